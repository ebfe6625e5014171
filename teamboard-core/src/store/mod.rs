pub mod memory;

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;

/// Absolute path -> new value. `Value::Null` deletes the subtree at that path.
pub type PathUpdates = BTreeMap<String, Value>;

/// Abstract boundary to the hosted realtime tree store.
/// Implementations: MemoryStore (in-process), future: remote clients.
///
/// Absent values are reported as `Value::Null`; writing `Value::Null`
/// deletes. The store has no ordering primitive of its own.
pub trait TreeStore: Send + Sync + 'static {
    /// Point read of the subtree at `path`.
    fn get(&self, path: &str) -> impl Future<Output = Result<Value, StoreError>> + Send;

    /// Replace the whole subtree at `path`.
    fn set(&self, path: &str, value: Value) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Multi-path update. Applied atomically within this one call.
    fn update(&self, updates: PathUpdates) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Delete the subtree at `path`, children included.
    fn remove(&self, path: &str) -> impl Future<Output = Result<(), StoreError>> + Send {
        self.set(path, Value::Null)
    }

    /// Listen for changes at, above or below `path`. The current value is
    /// replayed immediately. Dropping the subscription stops delivery.
    fn subscribe(&self, path: &str) -> Result<Subscription, StoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("Invalid path: {0:?}")]
    InvalidPath(String),

    #[error("Write rejected at {path}: {reason}")]
    WriteRejected { path: String, reason: String },

    #[error("Store operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Cannot write below a non-object value at {0}")]
    NotAnObject(String),

    #[error("Subscription closed: {0}")]
    SubscriptionClosed(String),
}

/// Change feed for one path. Values arrive in the order the store produced
/// them.
#[derive(Debug)]
pub struct Subscription {
    path: String,
    rx: mpsc::UnboundedReceiver<Value>,
}

impl Subscription {
    pub fn new(path: impl Into<String>, rx: mpsc::UnboundedReceiver<Value>) -> Self {
        Self {
            path: path.into(),
            rx,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Next value at the path, `None` once the store closed the feed.
    pub async fn next(&mut self) -> Option<Value> {
        self.rx.recv().await
    }
}

/// Write `value` at `path` unless something already exists there.
///
/// Check-then-act: two concurrent callers can both pass the check and the
/// later write wins. Returns `false` without writing when the path exists.
pub async fn create_if_absent<S: TreeStore>(
    store: &S,
    path: &str,
    value: Value,
) -> Result<bool, StoreError> {
    if !store.get(path).await?.is_null() {
        return Ok(false);
    }
    store.set(path, value).await?;
    Ok(true)
}
