/// In-process tree store.
///
/// Holds one JSON tree with the semantics of the hosted store:
/// - `null` deletes, and objects left empty disappear with it
/// - multi-path updates apply under one lock, then notify once
/// - subscriptions replay the current value and fire for any change at,
///   above or below their path
///
/// Fault injection (`fail_next_writes`, `reject_writes_under`,
/// `set_write_latency`) lets tests exercise rejected and slow writes.
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::mpsc;

use super::{PathUpdates, StoreError, Subscription, TreeStore};
use crate::paths;

/// A write as it reached the store, kept for inspection.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteRecord {
    pub version: u64,
    pub updates: PathUpdates,
}

struct Subscriber {
    path: String,
    tx: mpsc::UnboundedSender<Value>,
}

pub struct MemoryStore {
    root: RwLock<Value>,
    subscribers: Mutex<Vec<Subscriber>>,
    /// Number of upcoming writes to reject
    failures: AtomicUsize,
    /// Writes touching this subtree are rejected
    read_only: Mutex<Option<String>>,
    /// Delay between applying a write and acknowledging it
    latency: Mutex<Option<Duration>>,
    writes: Mutex<VecDeque<WriteRecord>>,
    /// Monotonic version counter, incremented on every applied write
    next_version: AtomicU64,
}

const MAX_WRITE_RECORDS: usize = 1024;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            root: RwLock::new(Value::Null),
            subscribers: Mutex::new(Vec::new()),
            failures: AtomicUsize::new(0),
            read_only: Mutex::new(None),
            latency: Mutex::new(None),
            writes: Mutex::new(VecDeque::new()),
            next_version: AtomicU64::new(1),
        }
    }

    /// Store seeded with `value` at the root.
    pub fn with_root(value: Value) -> Self {
        let store = Self::new();
        *store.root.write().unwrap_or_else(PoisonError::into_inner) = value;
        store
    }

    /// Reject the next `count` writes without applying them.
    pub fn fail_next_writes(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Reject every write at or below `path` until cleared with `None`.
    pub fn reject_writes_under(&self, path: Option<&str>) {
        *lock(&self.read_only) = path.map(|p| p.trim_matches('/').to_string());
    }

    /// Acknowledge writes only after `latency`. Notifications still go out
    /// as soon as the write is applied.
    pub fn set_write_latency(&self, latency: Option<Duration>) {
        *lock(&self.latency) = latency;
    }

    /// Applied writes, oldest first.
    pub fn writes(&self) -> Vec<WriteRecord> {
        lock(&self.writes).iter().cloned().collect()
    }

    pub fn write_count(&self) -> usize {
        lock(&self.writes).len()
    }

    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = lock(&self.subscribers);
        subscribers.retain(|s| !s.tx.is_closed());
        subscribers.len()
    }

    /// Synchronous read of the current tree at `path`.
    pub fn snapshot(&self, path: &str) -> Value {
        let root = self.root.read().unwrap_or_else(PoisonError::into_inner);
        value_at(&root, path).cloned().unwrap_or(Value::Null)
    }

    fn take_failure(&self) -> bool {
        self.failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    /// Apply a batch under one write lock, then notify listeners.
    async fn apply(&self, updates: PathUpdates) -> Result<(), StoreError> {
        let mut normalized = PathUpdates::new();
        for (path, value) in updates {
            normalized.insert(paths::normalize(&path)?, value);
        }

        if self.take_failure() {
            let path = normalized.keys().next().cloned().unwrap_or_default();
            log::warn!("[teamboard.store.memory] Injected write failure at {:?}", path);
            return Err(StoreError::WriteRejected {
                path,
                reason: "injected failure".to_string(),
            });
        }
        let blocked = lock(&self.read_only).as_ref().and_then(|read_only| {
            normalized
                .keys()
                .find(|path| paths::is_at_or_below(path, read_only))
                .cloned()
        });
        if let Some(path) = blocked {
            log::warn!("[teamboard.store.memory] Write to read-only {:?} rejected", path);
            return Err(StoreError::WriteRejected {
                path,
                reason: "permission denied".to_string(),
            });
        }

        {
            let mut root = self.root.write().unwrap_or_else(PoisonError::into_inner);
            let mut staged = root.clone();
            for (path, value) in &normalized {
                write_at(&mut staged, path, value.clone())?;
            }
            *root = staged;
        }

        let version = self.next_version.fetch_add(1, Ordering::Relaxed);
        {
            let mut writes = lock(&self.writes);
            writes.push_back(WriteRecord {
                version,
                updates: normalized.clone(),
            });
            while writes.len() > MAX_WRITE_RECORDS {
                writes.pop_front();
            }
        }

        self.notify(normalized.keys());

        let latency = *lock(&self.latency);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        Ok(())
    }

    fn notify<'a>(&self, changed: impl Iterator<Item = &'a String> + Clone) {
        let mut subscribers = lock(&self.subscribers);
        let root = self.root.read().unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|sub| {
            if !changed.clone().any(|path| paths::is_related(path, &sub.path)) {
                return !sub.tx.is_closed();
            }
            let value = value_at(&root, &sub.path).cloned().unwrap_or(Value::Null);
            sub.tx.send(value).is_ok()
        });
    }
}

impl TreeStore for MemoryStore {
    async fn get(&self, path: &str) -> Result<Value, StoreError> {
        let path = paths::normalize(path)?;
        Ok(self.snapshot(&path))
    }

    async fn set(&self, path: &str, value: Value) -> Result<(), StoreError> {
        self.apply(PathUpdates::from([(path.to_string(), value)])).await
    }

    async fn update(&self, updates: PathUpdates) -> Result<(), StoreError> {
        if updates.is_empty() {
            return Ok(());
        }
        self.apply(updates).await
    }

    fn subscribe(&self, path: &str) -> Result<Subscription, StoreError> {
        let path = paths::normalize(path)?;
        let (tx, rx) = mpsc::unbounded_channel();
        // Replay and registration happen under the subscriber lock so no
        // write can slip between them.
        let mut subscribers = lock(&self.subscribers);
        let _ = tx.send(self.snapshot(&path));
        subscribers.push(Subscriber {
            path: path.clone(),
            tx,
        });
        Ok(Subscription::new(path, rx))
    }
}

fn value_at<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    paths::segments(path).try_fold(root, |node, key| match node {
        Value::Object(map) => map.get(key),
        Value::Array(list) => key.parse::<usize>().ok().and_then(|i| list.get(i)),
        _ => None,
    })
}

/// Write `value` at `path`, creating intermediate objects. Null deletes and
/// prunes parents left empty.
fn write_at(root: &mut Value, path: &str, value: Value) -> Result<(), StoreError> {
    let keys: Vec<&str> = paths::segments(path).collect();
    let value = prune(value);
    let Some((last, parents)) = keys.split_last() else {
        *root = value;
        return Ok(());
    };

    if value.is_null() {
        if remove_at(root, parents, last) {
            *root = Value::Null;
        }
        return Ok(());
    }

    let mut node = root;
    for key in parents {
        if node.is_null() {
            *node = Value::Object(Map::new());
        }
        let Value::Object(map) = node else {
            return Err(StoreError::NotAnObject(path.to_string()));
        };
        node = map
            .entry(key.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    if node.is_null() {
        *node = Value::Object(Map::new());
    }
    let Value::Object(map) = node else {
        return Err(StoreError::NotAnObject(path.to_string()));
    };
    map.insert(last.to_string(), value);
    Ok(())
}

/// Remove `last` below `parents`; returns true when the parent became empty.
fn remove_at(node: &mut Value, parents: &[&str], last: &str) -> bool {
    let Value::Object(map) = node else {
        return false;
    };
    match parents.split_first() {
        None => {
            map.remove(last);
        }
        Some((key, rest)) => {
            if let Some(child) = map.get_mut(*key) {
                if remove_at(child, rest, last) {
                    map.remove(*key);
                }
            }
        }
    }
    map.is_empty()
}

/// Drop nulls and empty objects from a value about to be stored.
fn prune(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let pruned: Map<String, Value> = map
                .into_iter()
                .map(|(k, v)| (k, prune(v)))
                .filter(|(_, v)| !v.is_null())
                .collect();
            if pruned.is_empty() {
                Value::Null
            } else {
                Value::Object(pruned)
            }
        }
        other => other,
    }
}
