//! Peer configuration.

use std::time::Duration;

use crate::chunk::DEFAULT_MAX_MESSAGE_BUFFER_SIZE;
use crate::error::Result;
use crate::error::RpcError;
use crate::value::Value;

pub const DEFAULT_METHOD_TIMEOUT: Duration = Duration::from_secs(30);

/// Identity and tuning of one [`Peer`](crate::Peer). Immutable once the peer
/// is built.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub client_id: String,
    /// Peer that keeps the service directory and hands out connection info.
    pub manager_id: Option<String>,
    pub workspace: Option<String>,
    pub name: Option<String>,
    /// Budget for a call without settlement or heartbeat.
    pub method_timeout: Duration,
    /// Encoded messages above this size go through the chunked path.
    pub max_message_buffer_size: usize,
    /// Extra entries merged into the context of `require_context` methods.
    pub default_context: Vec<(String, Value)>,
}

impl PeerConfig {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            manager_id: None,
            workspace: None,
            name: None,
            method_timeout: DEFAULT_METHOD_TIMEOUT,
            max_message_buffer_size: DEFAULT_MAX_MESSAGE_BUFFER_SIZE,
            default_context: Vec::new(),
        }
    }

    pub fn with_manager(mut self, manager_id: impl Into<String>) -> Self {
        self.manager_id = Some(manager_id.into());
        self
    }

    pub fn with_workspace(mut self, workspace: impl Into<String>) -> Self {
        self.workspace = Some(workspace.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_method_timeout(mut self, timeout: Duration) -> Self {
        self.method_timeout = timeout;
        self
    }

    pub fn with_max_message_buffer_size(mut self, size: usize) -> Self {
        self.max_message_buffer_size = size;
        self
    }

    pub fn with_default_context(mut self, key: impl Into<String>, value: Value) -> Self {
        self.default_context.push((key.into(), value));
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.client_id.is_empty() {
            return Err(RpcError::Config("client_id is required".into()));
        }
        if self.client_id.contains(['/', ':']) {
            return Err(RpcError::Config(format!(
                "client_id {:?} must not contain '/' or ':'",
                self.client_id
            )));
        }
        if let Some(ws) = &self.workspace {
            if ws.is_empty() || ws.contains(['/', ':']) {
                return Err(RpcError::Config(format!(
                    "workspace {ws:?} must be non-empty and free of '/' and ':'"
                )));
            }
        }
        if self.max_message_buffer_size == 0 {
            return Err(RpcError::Config("max_message_buffer_size must be positive".into()));
        }
        if self.method_timeout.is_zero() {
            return Err(RpcError::Config("method_timeout must be positive".into()));
        }
        Ok(())
    }

    /// The identity other peers address: `"<workspace>/<client_id>"`, or
    /// the bare client id without a workspace.
    pub fn wire_id(&self) -> String {
        match &self.workspace {
            Some(ws) => format!("{ws}/{}", self.client_id),
            None => self.client_id.clone(),
        }
    }
}

/// Splits a wire id into its workspace (if any) and client id.
pub fn split_wire_id(wire_id: &str) -> (Option<&str>, &str) {
    match wire_id.split_once('/') {
        Some((ws, client)) => (Some(ws), client),
        None => (None, wire_id),
    }
}
