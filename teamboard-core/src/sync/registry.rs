/// Shared collection sessions keyed by store path.
///
/// Consumers acquire a path, get the one live `CollectionSync` for it and
/// release it when done. The first acquire subscribes; the last release
/// disposes.
use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use super::collection::CollectionSync;
use super::SyncError;
use crate::config::SyncConfig;
use crate::paths;
use crate::store::TreeStore;
use crate::types::Payload;

struct Entry<S: TreeStore, T: Payload> {
    sync: Arc<CollectionSync<S, T>>,
    consumers: usize,
}

pub struct SyncRegistry<S: TreeStore, T: Payload> {
    store: Arc<S>,
    config: SyncConfig,
    sessions: Mutex<HashMap<String, Entry<S, T>>>,
}

impl<S: TreeStore, T: Payload> SyncRegistry<S, T> {
    pub fn new(store: Arc<S>, config: SyncConfig) -> Self {
        Self {
            store,
            config,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Session for `path`, opened on first use.
    pub async fn acquire(&self, path: &str) -> Result<Arc<CollectionSync<S, T>>, SyncError> {
        let path = paths::normalize(path)?;
        // Held across open so two consumers racing on one path share a session
        let mut sessions = self.sessions.lock().await;
        if let Some(entry) = sessions.get_mut(&path) {
            entry.consumers += 1;
            log::debug!(
                "[teamboard.sync.registry] {} now has {} consumers",
                path,
                entry.consumers
            );
            return Ok(entry.sync.clone());
        }

        let sync = Arc::new(
            CollectionSync::open(self.store.clone(), &path, self.config.clone()).await?,
        );
        sessions.insert(
            path.clone(),
            Entry {
                sync: sync.clone(),
                consumers: 1,
            },
        );
        log::info!("[teamboard.sync.registry] Opened shared session for {}", path);
        Ok(sync)
    }

    /// Drop one consumer of `path`. Returns true when this closed the session.
    pub async fn release(&self, path: &str) -> bool {
        let Ok(path) = paths::normalize(path) else {
            return false;
        };
        let mut sessions = self.sessions.lock().await;
        let Some(entry) = sessions.get_mut(&path) else {
            log::warn!("[teamboard.sync.registry] Release of unknown session {}", path);
            return false;
        };
        entry.consumers = entry.consumers.saturating_sub(1);
        if entry.consumers > 0 {
            return false;
        }
        if let Some(entry) = sessions.remove(&path) {
            entry.sync.dispose();
        }
        log::info!("[teamboard.sync.registry] Closed shared session for {}", path);
        true
    }

    pub async fn is_open(&self, path: &str) -> bool {
        match paths::normalize(path) {
            Ok(path) => self.sessions.lock().await.contains_key(&path),
            Err(_) => false,
        }
    }

    pub async fn consumers(&self, path: &str) -> usize {
        let Ok(path) = paths::normalize(path) else {
            return 0;
        };
        self.sessions
            .lock()
            .await
            .get(&path)
            .map(|entry| entry.consumers)
            .unwrap_or(0)
    }

    /// Dispose every session regardless of consumers.
    pub async fn close_all(&self) {
        let mut sessions = self.sessions.lock().await;
        for (path, entry) in sessions.drain() {
            entry.sync.dispose();
            log::debug!("[teamboard.sync.registry] Closed {}", path);
        }
    }
}
