//! Handles to things living on another peer: a fetched service and a byte
//! stream read through its `read`/`seek` methods.

use crate::error::Result;
use crate::error::RpcError;
use crate::value::ByteStream;
use crate::value::Callable;
use crate::value::Value;

/// A service fetched with [`Peer::get_remote_service`](crate::Peer::get_remote_service).
/// Its functions are proxies; calling one sends a message.
#[derive(Debug, Clone)]
pub struct RemoteService {
    id: String,
    value: Value,
}

impl RemoteService {
    pub(crate) fn new(id: String, value: Value) -> Self {
        Self { id, value }
    }

    /// Fully qualified id, `"[workspace/]client:service"`.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.value.get("name").and_then(Value::as_str)
    }

    pub fn config(&self) -> Option<&Value> {
        self.value.get("config")
    }

    /// Looks up a member by dotted path, e.g. `"message_cache.create"`.
    pub fn get(&self, path: &str) -> Option<&Value> {
        self.value.get_path(path)
    }

    pub async fn call(&self, path: &str, args: Vec<Value>) -> Result<Value> {
        let function = self
            .get(path)
            .and_then(Value::as_function)
            .ok_or_else(|| RpcError::NotFound(format!("{}.{path}", self.id)))?;
        function.call(args).await
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn into_value(self) -> Value {
        self.value
    }
}

/// A [`ByteStream`] backed by another peer's stream methods.
pub struct RemoteStream {
    read: Callable,
    seek: Callable,
    metadata: Vec<(String, Value)>,
}

impl RemoteStream {
    pub(crate) fn new(read: Callable, seek: Callable, metadata: Vec<(String, Value)>) -> Self {
        Self { read, seek, metadata }
    }
}

#[async_trait::async_trait]
impl ByteStream for RemoteStream {
    async fn read(&self, size: Option<usize>) -> Result<Vec<u8>> {
        let size = match size {
            Some(n) => Value::Int(n as i64),
            None => Value::Null,
        };
        match self.read.call(vec![size]).await? {
            Value::Bytes(data) | Value::MemoryView(data) => Ok(data),
            other => Err(RpcError::Protocol(format!("stream read returned {}", other.kind()))),
        }
    }

    async fn seek(&self, pos: u64) -> Result<u64> {
        let reply = self.seek.call(vec![Value::Int(pos as i64)]).await?;
        reply
            .as_int()
            .and_then(|p| u64::try_from(p).ok())
            .ok_or_else(|| RpcError::Protocol(format!("stream seek returned {}", reply.kind())))
    }

    fn metadata(&self) -> Vec<(String, Value)> {
        self.metadata.clone()
    }
}
