//! # Session Store
//!
//! Bookkeeping for outstanding calls and the callbacks minted while encoding
//! their arguments.
//!
//! Session ids are dotted paths: a call made while handling another call's
//! callbacks lives at `"<parent>.<child>"`. A callback minted under a session
//! is addressed as `"<session>.<handle>"`; the reserved name `heartbeat`
//! renews the session's deadline.
//!
//! ## Invariants
//!
//! - Closing a session closes every descendant with it.
//! - A call's session, minted callbacks included, is closed once the call
//!   settles, times out or is closed by the peer.
//! - A session callback only answers the peer the session was opened for.
//! - Dropping a node drops its [`Timer`], which cancels the watchdog task.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::error::RpcError;
use crate::value::Callable;
use crate::value::Value;

/// Name of the per-session heartbeat callback.
pub const HEARTBEAT: &str = "heartbeat";

// ============================================================================
//  TIMER
// ============================================================================

/// A resettable watchdog. Fires `on_expire` once if `timeout` passes without
/// a call to [`Timer::reset`]. Aborted when dropped.
pub struct Timer {
    reset: mpsc::UnboundedSender<()>,
    task: JoinHandle<()>,
}

impl Timer {
    pub fn start<F>(timeout: Duration, on_expire: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let (reset, mut rx) = mpsc::unbounded_channel::<()>();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(timeout) => {
                        on_expire();
                        return;
                    }
                    signal = rx.recv() => {
                        if signal.is_none() {
                            return;
                        }
                    }
                }
            }
        });
        Self { reset, task }
    }

    pub fn reset(&self) {
        let _ = self.reset.send(());
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

// ============================================================================
//  SETTLER
// ============================================================================

/// The reply slot of a pending call, shared by everything that may settle
/// it: resolve, reject, timeout and disconnect. First writer wins.
#[derive(Clone)]
pub struct Settler(Arc<Mutex<Option<oneshot::Sender<Result<Value>>>>>);

impl Settler {
    pub fn new() -> (Self, oneshot::Receiver<Result<Value>>) {
        let (tx, rx) = oneshot::channel();
        (Self(Arc::new(Mutex::new(Some(tx)))), rx)
    }

    /// Returns `false` if the call was already settled.
    pub fn settle(&self, result: Result<Value>) -> bool {
        match self.0.lock().take() {
            Some(tx) => {
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }
}

// ============================================================================
//  SESSIONS
// ============================================================================

/// One call's worth of state.
pub struct SessionNode {
    /// The peer this session talks to; only it may invoke the callbacks.
    pub target_id: String,
    pub method: String,
    /// Reference store handles owned by this session (resolve/reject).
    pub refs: Vec<u32>,
    pub settle: Option<Settler>,
    pub timer: Option<Timer>,
    callbacks: HashMap<String, Callable>,
    next_handle: u32,
}

impl SessionNode {
    fn new(target_id: &str, method: &str) -> Self {
        Self {
            target_id: target_id.to_string(),
            method: method.to_string(),
            refs: Vec::new(),
            settle: None,
            timer: None,
            callbacks: HashMap::new(),
            next_handle: 0,
        }
    }
}

#[derive(Default)]
pub struct SessionStore {
    nodes: Mutex<HashMap<String, SessionNode>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.lock().is_empty()
    }

    /// Opens (or re-targets) a session for a pending call.
    pub fn open(&self, id: &str, target_id: &str, method: &str, settle: Settler, refs: Vec<u32>) {
        let mut nodes = self.nodes.lock();
        let node = nodes
            .entry(id.to_string())
            .or_insert_with(|| SessionNode::new(target_id, method));
        node.method = method.to_string();
        node.settle = Some(settle);
        node.refs = refs;
    }

    /// Stores `callable` under the next numbered handle of `session`,
    /// creating the session on first use. Returns its dotted address.
    pub fn mint(&self, session: &str, target_id: &str, callable: Callable) -> String {
        let mut nodes = self.nodes.lock();
        let node = nodes
            .entry(session.to_string())
            .or_insert_with(|| SessionNode::new(target_id, ""));
        let handle = node.next_handle;
        node.next_handle += 1;
        node.callbacks.insert(handle.to_string(), callable);
        format!("{session}.{handle}")
    }

    /// Stores a callback under a fixed name, e.g. [`HEARTBEAT`].
    pub fn insert_callback(&self, session: &str, name: &str, callable: Callable) -> Result<()> {
        let mut nodes = self.nodes.lock();
        let node = nodes
            .get_mut(session)
            .ok_or_else(|| RpcError::NotFound(format!("session {session}")))?;
        node.callbacks.insert(name.to_string(), callable);
        Ok(())
    }

    /// Installs the watchdog for a pending call. If the session is already
    /// gone the timer is handed back to be dropped.
    pub fn attach_timer(&self, id: &str, timer: Timer) -> Option<Timer> {
        match self.nodes.lock().get_mut(id) {
            Some(node) => {
                node.timer = Some(timer);
                None
            }
            None => Some(timer),
        }
    }

    pub fn reset_timer(&self, id: &str) -> bool {
        match self.nodes.lock().get(id) {
            Some(SessionNode { timer: Some(timer), .. }) => {
                timer.reset();
                true
            }
            _ => false,
        }
    }

    /// Resolves `"<session>.<name>"` for a message sent by `from`.
    pub fn lookup(&self, path: &str, from: &str) -> Result<Callable> {
        let (session, name) = path
            .rsplit_once('.')
            .ok_or_else(|| RpcError::NotFound(format!("method {path}")))?;
        let nodes = self.nodes.lock();
        let node = nodes
            .get(session)
            .ok_or_else(|| RpcError::NotFound(format!("session {session}")))?;
        if node.target_id != from {
            return Err(RpcError::Permission(format!(
                "session {session} does not belong to {from}"
            )));
        }
        node.callbacks
            .get(name)
            .cloned()
            .ok_or_else(|| RpcError::NotFound(format!("method {path}")))
    }

    /// Resolves a session callback without the ownership check, for
    /// references that come back to the peer that minted them.
    pub fn lookup_own(&self, path: &str) -> Option<Callable> {
        let (session, name) = path.rsplit_once('.')?;
        self.nodes.lock().get(session)?.callbacks.get(name).cloned()
    }

    /// Removes `id` and all of its descendants, returning them so the caller
    /// can release their resources outside the lock.
    pub fn close(&self, id: &str) -> Vec<(String, SessionNode)> {
        Self::remove_subtree(&mut self.nodes.lock(), id)
    }

    pub fn close_all(&self) -> Vec<(String, SessionNode)> {
        self.nodes.lock().drain().collect()
    }

    fn remove_subtree(nodes: &mut HashMap<String, SessionNode>, id: &str) -> Vec<(String, SessionNode)> {
        let prefix = format!("{id}.");
        let doomed: Vec<String> = nodes
            .keys()
            .filter(|k| k.as_str() == id || k.starts_with(&prefix))
            .cloned()
            .collect();
        doomed
            .into_iter()
            .filter_map(|k| nodes.remove(&k).map(|node| (k, node)))
            .collect()
    }
}
