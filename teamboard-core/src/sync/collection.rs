/// Ordered collection synchroniser.
///
/// Bridges one store path holding `{id: {order, ..payload}}` to a sorted
/// local sequence:
/// - a pump task drains the store subscription in delivery order and
///   refreshes the confirmed state
/// - moves, deletes, creates and edits are applied optimistically, written
///   as one multi-path update, and rolled back if the write fails
/// - while a write is in flight, notifications (including its own echo) do
///   not disturb the optimistic view
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Deserialize;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::WatchStream;

use super::echo::EchoTracker;
use super::reconcile::CollectionCell;
use super::types::{MoveOutcome, SequenceFingerprint, SyncPhase};
use super::SyncError;
use crate::config::SyncConfig;
use crate::paths;
use crate::rank;
use crate::store::{PathUpdates, StoreError, Subscription, TreeStore};
use crate::types::{Item, Payload, ORDER_FIELD};
use crate::validate;

/// Decode a stored map into a sequence sorted by `order`. Missing ranks
/// count as 0; ties fall back to id. Entries whose payload does not decode
/// are skipped.
pub fn decode_collection<T: Payload>(path: &str, value: &Value) -> Vec<Item<T>> {
    let entries: Vec<(String, &Value)> = match value {
        Value::Object(map) => map.iter().map(|(k, v)| (k.clone(), v)).collect(),
        Value::Array(list) => list
            .iter()
            .enumerate()
            .filter(|(_, v)| !v.is_null())
            .map(|(i, v)| (i.to_string(), v))
            .collect(),
        _ => Vec::new(),
    };

    let mut items: Vec<Item<T>> = entries
        .into_iter()
        .filter_map(|(id, raw)| {
            let order = raw.get(ORDER_FIELD).and_then(Value::as_u64).unwrap_or(0);
            match T::deserialize(raw) {
                Ok(payload) => Some(Item { id, order, payload }),
                Err(e) => {
                    log::warn!(
                        "[teamboard.sync.decode] Skipping {}/{}: {}",
                        path,
                        id,
                        e
                    );
                    None
                }
            }
        })
        .collect();
    items.sort_by(|a, b| a.order.cmp(&b.order).then_with(|| a.id.cmp(&b.id)));
    items
}

/// Store-style generated key: hex milliseconds plus random suffix, so keys
/// created later sort later.
pub fn generate_id() -> String {
    let millis = chrono::Utc::now().timestamp_millis().max(0);
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{:011x}{}", millis, &suffix[..8])
}

struct Session<T> {
    cell: CollectionCell<T>,
    phase: SyncPhase,
    echoes: EchoTracker,
}

impl<T: Payload> Session<T> {
    fn apply_remote(&mut self, path: &str, items: Vec<Item<T>>) {
        let fingerprint = SequenceFingerprint::from_items(&items);
        let is_echo = self.echoes.check_and_consume(&fingerprint);
        if is_echo {
            log::debug!("[teamboard.sync.echo] {} echoed our write", path);
        } else if self.cell.in_flight() {
            log::warn!(
                "[teamboard.sync.remote] {} changed by another writer during our write",
                path
            );
        } else {
            log::debug!("[teamboard.sync.remote] {} changed ({} items)", path, items.len());
        }
        self.cell.on_remote(items, is_echo);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Publish the displayed sequence. Callers hold the session lock so
/// snapshots go out in the order the session changed.
fn publish<T: Payload>(tx: &watch::Sender<Vec<Item<T>>>, displayed: &[Item<T>]) {
    tx.send_if_modified(|current| {
        if current.as_slice() == displayed {
            false
        } else {
            *current = displayed.to_vec();
            true
        }
    });
}

fn check_index(index: usize, len: usize) -> Result<(), SyncError> {
    if index < len {
        Ok(())
    } else {
        Err(SyncError::IndexOutOfRange { index, len })
    }
}

/// Drains a subscription into the session until the store closes it or the
/// session is disposed.
async fn pump<T: Payload>(
    path: String,
    mut subscription: Subscription,
    session: Arc<Mutex<Session<T>>>,
    snapshots: Arc<watch::Sender<Vec<Item<T>>>>,
) {
    while let Some(value) = subscription.next().await {
        let items = decode_collection::<T>(&path, &value);
        {
            let mut session = lock(&session);
            if session.phase == SyncPhase::Unsubscribed {
                break;
            }
            session.apply_remote(&path, items);
            publish(&snapshots, session.cell.displayed());
        }
    }
    log::debug!("[teamboard.sync.pump] Subscription to {} ended", path);
}

/// Clears the suppression flag when dropped, whether the write settled
/// normally or the future was cancelled.
struct WriteTicket<'a, S: TreeStore, T: Payload> {
    sync: &'a CollectionSync<S, T>,
    /// Expected echo of this write, forgotten if the write fails
    fingerprint: SequenceFingerprint,
    settled: bool,
}

impl<S: TreeStore, T: Payload> WriteTicket<'_, S, T> {
    fn settle(mut self, success: bool) {
        self.settled = true;
        self.sync.settle(success, &self.fingerprint);
    }
}

impl<S: TreeStore, T: Payload> Drop for WriteTicket<'_, S, T> {
    fn drop(&mut self) {
        if !self.settled {
            self.sync.settle(false, &self.fingerprint);
        }
    }
}

/// One open ordered collection.
pub struct CollectionSync<S: TreeStore, T: Payload> {
    store: Arc<S>,
    path: String,
    config: SyncConfig,
    session: Arc<Mutex<Session<T>>>,
    snapshots: Arc<watch::Sender<Vec<Item<T>>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl<S: TreeStore, T: Payload> CollectionSync<S, T> {
    /// Subscribe to `path` and wait for the store's initial snapshot.
    pub async fn open(store: Arc<S>, path: &str, config: SyncConfig) -> Result<Self, SyncError> {
        let path = paths::normalize(path)?;
        let session = Arc::new(Mutex::new(Session {
            cell: CollectionCell::default(),
            phase: SyncPhase::Subscribing,
            echoes: EchoTracker::new(config.echo_ttl()),
        }));

        log::info!("[teamboard.sync.open] Subscribing to {}", path);
        let mut subscription = store.subscribe(&path)?;
        let initial = match tokio::time::timeout(config.open_timeout(), subscription.next()).await
        {
            Ok(Some(value)) => value,
            Ok(None) => return Err(StoreError::SubscriptionClosed(path).into()),
            Err(_) => return Err(StoreError::Timeout(config.open_timeout()).into()),
        };

        let items = decode_collection::<T>(&path, &initial);
        {
            let mut session = lock(&session);
            session.cell = CollectionCell::new(items.clone());
            session.phase = SyncPhase::Synced;
        }
        let (tx, _) = watch::channel(items);
        let snapshots = Arc::new(tx);

        let handle = tokio::spawn(pump(
            path.clone(),
            subscription,
            session.clone(),
            snapshots.clone(),
        ));

        Ok(Self {
            store,
            path,
            config,
            session,
            snapshots,
            pump: Mutex::new(Some(handle)),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn phase(&self) -> SyncPhase {
        lock(&self.session).phase
    }

    /// The sequence as currently displayed.
    pub fn items(&self) -> Vec<Item<T>> {
        lock(&self.session).cell.displayed().to_vec()
    }

    /// Last state acknowledged by the store.
    pub fn confirmed(&self) -> Vec<Item<T>> {
        lock(&self.session).cell.confirmed().to_vec()
    }

    pub fn len(&self) -> usize {
        lock(&self.session).cell.displayed().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        lock(&self.session)
            .cell
            .displayed()
            .iter()
            .position(|item| item.id == id)
    }

    pub fn item_path(&self, id: &str) -> String {
        paths::join(&self.path, id)
    }

    /// Receiver of displayed sequences. Starts with the current one.
    pub fn watch(&self) -> watch::Receiver<Vec<Item<T>>> {
        self.snapshots.subscribe()
    }

    /// Displayed sequences as a stream, current value first.
    pub fn snapshots(&self) -> WatchStream<Vec<Item<T>>> {
        WatchStream::new(self.watch())
    }

    /// Move the item at `from` to position `to`. Equal positions are a no-op
    /// without any write.
    pub async fn move_item(&self, from: usize, to: usize) -> Result<MoveOutcome, SyncError> {
        let current = self.items();
        check_index(from, current.len())?;
        check_index(to, current.len())?;
        if from == to {
            log::debug!("[teamboard.sync.move] {}: {} -> {} is a no-op", self.path, from, to);
            return Ok(MoveOutcome::Unchanged);
        }

        let reordered = rank::move_within(&current, from, to);
        let updates = rank::rank_updates(&self.path, &rank::assign_ranks(&reordered));
        log::info!(
            "[teamboard.sync.move] {}: {} {} -> {}",
            self.path,
            current[from].id,
            from,
            to
        );
        self.commit("move", reordered, updates).await?;
        Ok(MoveOutcome::Moved)
    }

    /// Delete the item at `index` with everything stored below it, and
    /// close the rank gap in the same write.
    pub async fn delete(&self, index: usize) -> Result<Item<T>, SyncError> {
        let current = self.items();
        check_index(index, current.len())?;

        let (removed, remaining) = rank::remove_at(&current, index);
        let mut updates = rank::rank_updates(&self.path, &rank::assign_ranks(&remaining));
        updates.insert(self.item_path(&removed.id), Value::Null);
        log::info!("[teamboard.sync.delete] {}: {}", self.path, removed.id);
        self.commit("delete", remaining, updates).await?;
        Ok(removed)
    }

    /// Create an item keyed by a user-supplied name.
    pub async fn create_named(&self, name: &str, payload: T) -> Result<Item<T>, SyncError> {
        let id = validate::validate_name(name)?;
        self.create_with_id(id, payload).await
    }

    /// Create an item under a generated key.
    pub async fn create(&self, payload: T) -> Result<Item<T>, SyncError> {
        self.create_with_id(generate_id(), payload).await
    }

    /// Append an item. The existence check is a point read right before the
    /// write; concurrent creators of the same id are not detected.
    pub async fn create_with_id(&self, id: String, payload: T) -> Result<Item<T>, SyncError> {
        if !paths::is_valid_key(&id) {
            return Err(StoreError::InvalidPath(self.item_path(&id)).into());
        }
        if self.position(&id).is_some() {
            return Err(SyncError::AlreadyExists(self.item_path(&id)));
        }
        let item_path = self.item_path(&id);
        if !self.read(&item_path).await?.is_null() {
            return Err(SyncError::AlreadyExists(item_path));
        }

        let mut optimistic = self.items();
        let item = Item::new(id, optimistic.len() as u64, payload);
        let value = item.to_value()?;
        optimistic.push(item.clone());
        log::info!("[teamboard.sync.create] {}: {}", self.path, item.id);
        self.commit("create", optimistic, PathUpdates::from([(item_path, value)]))
            .await?;
        Ok(item)
    }

    /// Edit the payload of the item at `index`. Only payload fields are
    /// written, so children stored below the item are untouched.
    pub async fn update_item<F>(&self, index: usize, edit: F) -> Result<Item<T>, SyncError>
    where
        F: FnOnce(&mut T) -> Result<(), SyncError> + Send,
    {
        let mut optimistic = self.items();
        check_index(index, optimistic.len())?;
        edit(&mut optimistic[index].payload)?;

        let item = optimistic[index].clone();
        let item_path = self.item_path(&item.id);
        let updates: PathUpdates = item
            .payload_fields()?
            .into_iter()
            .map(|(field, value)| (paths::join(&item_path, &field), value))
            .collect();
        if updates.is_empty() {
            return Ok(item);
        }
        log::debug!("[teamboard.sync.edit] {}: {}", self.path, item.id);
        self.commit("edit", optimistic, updates).await?;
        Ok(item)
    }

    /// Re-read the collection and take the result as confirmed.
    pub async fn refresh(&self) -> Result<(), SyncError> {
        let value = self.read(&self.path).await?;
        let items = decode_collection::<T>(&self.path, &value);
        let mut session = lock(&self.session);
        if session.phase == SyncPhase::Unsubscribed {
            return Ok(());
        }
        session.apply_remote(&self.path, items);
        publish(&self.snapshots, session.cell.displayed());
        Ok(())
    }

    /// Stop listening. Pending suppression state is released and writes
    /// that settle afterwards leave the session alone.
    pub fn dispose(&self) {
        {
            let mut session = lock(&self.session);
            if session.phase == SyncPhase::Unsubscribed {
                return;
            }
            session.phase = SyncPhase::Unsubscribed;
            session.cell.release();
            session.echoes.clear();
        }
        if let Some(handle) = lock(&self.pump).take() {
            handle.abort();
        }
        log::info!("[teamboard.sync.dispose] Closed {}", self.path);
    }

    pub(crate) async fn read(&self, path: &str) -> Result<Value, SyncError> {
        let timeout = self.config.write_timeout();
        match tokio::time::timeout(timeout, self.store.get(path)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(StoreError::Timeout(timeout).into()),
        }
    }

    async fn write(&self, updates: PathUpdates) -> Result<(), SyncError> {
        let timeout = self.config.write_timeout();
        match tokio::time::timeout(timeout, self.store.update(updates)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(StoreError::Timeout(timeout).into()),
        }
    }

    /// Show `optimistic`, write `updates`, and settle. On failure the view
    /// falls back to the confirmed state and the collection is re-read.
    pub(crate) async fn commit(
        &self,
        op: &str,
        optimistic: Vec<Item<T>>,
        updates: PathUpdates,
    ) -> Result<(), SyncError> {
        let ticket = self.begin_write(optimistic)?;
        match self.write(updates).await {
            Ok(()) => {
                ticket.settle(true);
                Ok(())
            }
            Err(e) => {
                ticket.settle(false);
                log::error!(
                    "[teamboard.sync.{}] Write to {} failed: {}",
                    op,
                    self.path,
                    e
                );
                if let Err(refresh_err) = self.refresh().await {
                    log::warn!(
                        "[teamboard.sync.{}] Re-read of {} failed: {}",
                        op,
                        self.path,
                        refresh_err
                    );
                }
                Err(e)
            }
        }
    }

    fn begin_write(&self, optimistic: Vec<Item<T>>) -> Result<WriteTicket<'_, S, T>, SyncError> {
        let fingerprint = SequenceFingerprint::from_items(&optimistic);
        let mut session = lock(&self.session);
        if session.phase == SyncPhase::Unsubscribed {
            return Err(SyncError::Disposed(self.path.clone()));
        }
        session.echoes.register(fingerprint.clone());
        session.cell.begin_write(optimistic);
        session.phase = SyncPhase::Reconciling;
        publish(&self.snapshots, session.cell.displayed());
        Ok(WriteTicket {
            sync: self,
            fingerprint,
            settled: false,
        })
    }

    fn settle(&self, success: bool, fingerprint: &SequenceFingerprint) {
        let mut session = lock(&self.session);
        if session.phase == SyncPhase::Unsubscribed {
            log::debug!(
                "[teamboard.sync.settle] {} disposed before its write settled",
                self.path
            );
            return;
        }
        if !success {
            // No echo is coming; a later identical snapshot is someone else's
            session.echoes.forget(fingerprint);
        }
        session.cell.settle(success);
        session.echoes.cleanup_expired();
        if !session.cell.in_flight() {
            session.phase = SyncPhase::Synced;
        }
        publish(&self.snapshots, session.cell.displayed());
    }
}

impl<S: TreeStore, T: Payload> Drop for CollectionSync<S, T> {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use crate::types::TodoPayload;
    use crate::validate::ValidationError;
    use serde_json::json;
    use std::time::Duration;
    use tokio_stream::StreamExt;

    const PATH: &str = "teams/t/projects/p/tasks/Today/x/sections/s/todos";

    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn todo(text: &str) -> TodoPayload {
        TodoPayload {
            text: text.to_string(),
            completed: false,
        }
    }

    fn nest(path: &str, value: Value) -> Value {
        let keys: Vec<&str> = paths::segments(path).collect();
        keys.into_iter().rev().fold(value, |acc, key| {
            let mut map = serde_json::Map::new();
            map.insert(key.to_string(), acc);
            Value::Object(map)
        })
    }

    /// Store holding todos `ids` at PATH with ranks 0..N.
    fn seeded(ids: &[&str]) -> Arc<MemoryStore> {
        let mut map = serde_json::Map::new();
        for (i, id) in ids.iter().enumerate() {
            map.insert(
                id.to_string(),
                json!({"text": format!("do {}", id), "completed": false, "order": i}),
            );
        }
        Arc::new(MemoryStore::with_root(nest(PATH, Value::Object(map))))
    }

    async fn open(store: &Arc<MemoryStore>) -> CollectionSync<MemoryStore, TodoPayload> {
        init_logging();
        CollectionSync::open(store.clone(), PATH, SyncConfig::default())
            .await
            .unwrap()
    }

    fn ids<T>(items: &[Item<T>]) -> Vec<String> {
        items.iter().map(|i| i.id.clone()).collect()
    }

    /// (id, order) pairs as stored, sorted by order.
    fn stored_ranks(store: &MemoryStore) -> Vec<(String, u64)> {
        let mut out: Vec<(String, u64)> = store
            .snapshot(PATH)
            .as_object()
            .map(|m| {
                m.iter()
                    .map(|(k, v)| (k.clone(), v["order"].as_u64().unwrap_or(u64::MAX)))
                    .collect()
            })
            .unwrap_or_default();
        out.sort_by_key(|(_, order)| *order);
        out
    }

    fn ranked(ids: &[&str]) -> Vec<(String, u64)> {
        ids.iter()
            .enumerate()
            .map(|(i, id)| (id.to_string(), i as u64))
            .collect()
    }

    #[tokio::test]
    async fn test_open_sorts_by_order_and_tolerates_missing_rank() {
        let store = Arc::new(MemoryStore::with_root(nest(
            PATH,
            json!({
                "b": {"text": "b", "order": 1},
                "a": {"text": "a"},
                "c": {"text": "c", "order": 0},
                "bad": {"order": 2}
            }),
        )));
        let sync = open(&store).await;
        assert_eq!(sync.phase(), SyncPhase::Synced);
        assert_eq!(ids(&sync.items()), vec!["a", "c", "b"]);
    }

    #[test]
    fn test_decode_array_shaped_collection() {
        let value = json!([null, {"text": "x", "order": 1}, {"text": "y", "order": 0}]);
        let items = decode_collection::<TodoPayload>("c", &value);
        assert_eq!(ids(&items), vec!["2", "1"]);
        assert!(decode_collection::<TodoPayload>("c", &Value::Null).is_empty());
    }

    #[tokio::test]
    async fn test_move_within_collection() {
        let store = seeded(&["A", "B", "C", "D"]);
        let sync = open(&store).await;

        assert_eq!(sync.move_item(0, 2).await.unwrap(), MoveOutcome::Moved);
        assert_eq!(ids(&sync.items()), vec!["B", "C", "A", "D"]);
        assert_eq!(stored_ranks(&store), ranked(&["B", "C", "A", "D"]));

        // One batched write touching only the order fields
        let writes = store.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].updates.len(), 4);
        assert!(writes[0].updates.keys().all(|k| k.ends_with("/order")));
        assert_eq!(sync.phase(), SyncPhase::Synced);
    }

    #[tokio::test]
    async fn test_noop_move_writes_nothing() {
        let store = seeded(&["A", "B", "C", "D"]);
        let sync = open(&store).await;
        for i in 0..4 {
            assert_eq!(sync.move_item(i, i).await.unwrap(), MoveOutcome::Unchanged);
        }
        assert_eq!(store.write_count(), 0);
        assert_eq!(ids(&sync.items()), vec!["A", "B", "C", "D"]);
    }

    #[tokio::test]
    async fn test_move_out_of_range() {
        let store = seeded(&["A", "B"]);
        let sync = open(&store).await;
        assert!(matches!(
            sync.move_item(0, 2).await,
            Err(SyncError::IndexOutOfRange { index: 2, len: 2 })
        ));
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn test_delete_renumbers_and_removes_children() {
        let store = seeded(&["A", "B", "C", "D"]);
        store
            .set(&format!("{}/B/notes/n1", PATH), json!({"text": "child"}))
            .await
            .unwrap();
        let sync = open(&store).await;

        let removed = sync.delete(1).await.unwrap();
        assert_eq!(removed.id, "B");
        assert_eq!(ids(&sync.items()), vec!["A", "C", "D"]);
        assert_eq!(stored_ranks(&store), ranked(&["A", "C", "D"]));
        assert!(store.snapshot(&format!("{}/B", PATH)).is_null());
    }

    #[tokio::test]
    async fn test_delete_last_item_leaves_empty_collection() {
        let store = seeded(&["A"]);
        let sync = open(&store).await;
        sync.delete(0).await.unwrap();
        assert!(sync.is_empty());
        assert!(store.snapshot(PATH).is_null());
    }

    #[tokio::test]
    async fn test_create_appends_at_end() {
        let store = seeded(&["A", "B"]);
        let sync = open(&store).await;

        let item = sync.create_named("  Groceries ", todo("milk")).await.unwrap();
        assert_eq!(item.id, "Groceries");
        assert_eq!(item.order, 2);
        assert_eq!(ids(&sync.items()), vec!["A", "B", "Groceries"]);
        assert_eq!(
            store.snapshot(&format!("{}/Groceries", PATH)),
            json!({"text": "milk", "completed": false, "order": 2})
        );

        let generated = sync.create(todo("eggs")).await.unwrap();
        assert_eq!(generated.order, 3);
        assert!(paths::is_valid_key(&generated.id));
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_names_without_writing() {
        let store = seeded(&["A"]);
        let sync = open(&store).await;

        for name in ["foo bar", "", "   "] {
            let err = sync.create_named(name, todo("x")).await.unwrap_err();
            assert!(err.is_validation(), "{name:?} should be rejected");
        }
        assert!(matches!(
            sync.create_named("foo bar", todo("x")).await,
            Err(SyncError::Validation(ValidationError::InvalidCharacters(_)))
        ));
        assert_eq!(store.write_count(), 0);
        assert_eq!(ids(&sync.items()), vec!["A"]);
        assert_eq!(stored_ranks(&store), ranked(&["A"]));
    }

    #[tokio::test]
    async fn test_create_rejects_existing_id() {
        let store = seeded(&["A"]);
        let sync = open(&store).await;
        assert!(matches!(
            sync.create_named("A", todo("x")).await,
            Err(SyncError::AlreadyExists(_))
        ));
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_write_rolls_back() {
        let store = seeded(&["A", "B", "C", "D"]);
        let sync = open(&store).await;

        store.fail_next_writes(1);
        let err = sync.move_item(0, 2).await.unwrap_err();
        assert!(matches!(err, SyncError::Store(StoreError::WriteRejected { .. })));
        assert_eq!(ids(&sync.items()), vec!["A", "B", "C", "D"]);
        assert_eq!(sync.phase(), SyncPhase::Synced);
        assert_eq!(stored_ranks(&store), ranked(&["A", "B", "C", "D"]));

        // The session is not wedged: the next move goes through
        sync.move_item(0, 2).await.unwrap();
        assert_eq!(ids(&sync.items()), vec!["B", "C", "A", "D"]);
    }

    #[tokio::test]
    async fn test_timed_out_write_resyncs_from_store() {
        let store = seeded(&["A", "B", "C"]);
        store.set_write_latency(Some(Duration::from_millis(200)));
        let config = SyncConfig {
            write_timeout_ms: 20,
            ..SyncConfig::default()
        };
        let sync = CollectionSync::<_, TodoPayload>::open(store.clone(), PATH, config)
            .await
            .unwrap();

        let err = sync.move_item(2, 0).await.unwrap_err();
        assert!(matches!(err, SyncError::Store(StoreError::Timeout(_))));
        assert_eq!(sync.phase(), SyncPhase::Synced);
        // The store applied the write before acknowledging; the re-read shows it.
        let stored: Vec<String> = stored_ranks(&store).into_iter().map(|(id, _)| id).collect();
        assert_eq!(ids(&sync.items()), stored);
    }

    #[tokio::test]
    async fn test_echo_during_write_does_not_flicker() {
        let store = seeded(&["A", "B", "C", "D"]);
        store.set_write_latency(Some(Duration::from_millis(50)));
        let sync = Arc::new(open(&store).await);

        let mover = sync.clone();
        let handle = tokio::spawn(async move { mover.move_item(0, 2).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        // Echo already delivered and confirmed; the view did not change
        assert_eq!(sync.phase(), SyncPhase::Reconciling);
        assert_eq!(ids(&sync.confirmed()), vec!["B", "C", "A", "D"]);
        assert_eq!(ids(&sync.items()), vec!["B", "C", "A", "D"]);

        handle.await.unwrap().unwrap();
        assert_eq!(sync.phase(), SyncPhase::Synced);
        assert_eq!(ids(&sync.items()), vec!["B", "C", "A", "D"]);
    }

    #[tokio::test]
    async fn test_foreign_write_during_move_wins_after_settle() {
        let store = seeded(&["A", "B", "C", "D"]);
        store.set_write_latency(Some(Duration::from_millis(50)));
        let sync = Arc::new(open(&store).await);

        let mover = sync.clone();
        let handle = tokio::spawn(async move { mover.move_item(0, 2).await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        let other = store.clone();
        let writer = tokio::spawn(async move {
            other
                .set(
                    &format!("{}/E", PATH),
                    json!({"text": "e", "completed": false, "order": 4}),
                )
                .await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(ids(&sync.items()), vec!["B", "C", "A", "D"]);

        handle.await.unwrap().unwrap();
        writer.await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(ids(&sync.items()), vec!["B", "C", "A", "D", "E"]);
    }

    #[tokio::test]
    async fn test_failed_write_does_not_mask_later_foreign_write() {
        let store = seeded(&["A", "B", "C", "D"]);
        let sync = Arc::new(open(&store).await);

        store.fail_next_writes(1);
        assert!(sync.move_item(0, 2).await.is_err());
        assert_eq!(ids(&sync.items()), vec!["A", "B", "C", "D"]);

        store.set_write_latency(Some(Duration::from_millis(50)));
        let mover = sync.clone();
        let handle = tokio::spawn(async move { mover.move_item(3, 0).await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        // Another client writes exactly the state the failed move asked for
        let other = store.clone();
        let writer = tokio::spawn(async move {
            other
                .update(PathUpdates::from([
                    (format!("{}/B/order", PATH), json!(0)),
                    (format!("{}/C/order", PATH), json!(1)),
                    (format!("{}/A/order", PATH), json!(2)),
                    (format!("{}/D/order", PATH), json!(3)),
                ]))
                .await
        });

        handle.await.unwrap().unwrap();
        writer.await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let stored: Vec<String> = stored_ranks(&store).into_iter().map(|(id, _)| id).collect();
        assert_eq!(stored, vec!["B", "C", "A", "D"]);
        assert_eq!(ids(&sync.items()), stored);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_published_snapshot_matches_view_under_concurrency() {
        let store = seeded(&["A", "B", "C", "D", "E"]);
        let sync = Arc::new(open(&store).await);

        let mut tasks = Vec::new();
        for round in 0..40usize {
            let mover = sync.clone();
            tasks.push(tokio::spawn(async move {
                let _ = mover.move_item(round % 5, (round + 2) % 5).await;
            }));
            let other = store.clone();
            tasks.push(tokio::spawn(async move {
                let _ = other
                    .set(
                        &format!("{}/x{}", PATH, round),
                        json!({"text": "x", "completed": false, "order": 100 + round}),
                    )
                    .await;
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        let published = sync.watch().borrow().clone();
        assert_eq!(published, sync.items());
        assert_eq!(sync.phase(), SyncPhase::Synced);
    }

    #[tokio::test]
    async fn test_dispose_stops_updates_and_ignores_late_settle() {
        let store = seeded(&["A", "B", "C"]);
        store.set_write_latency(Some(Duration::from_millis(30)));
        let sync = Arc::new(open(&store).await);

        let mover = sync.clone();
        let handle = tokio::spawn(async move { mover.move_item(0, 1).await });
        tokio::time::sleep(Duration::from_millis(5)).await;

        sync.dispose();
        assert_eq!(sync.phase(), SyncPhase::Unsubscribed);
        let after_dispose = sync.items();

        // The in-flight write completes but leaves the disposed session alone
        assert_eq!(handle.await.unwrap().unwrap(), MoveOutcome::Moved);
        assert_eq!(sync.phase(), SyncPhase::Unsubscribed);

        store.set_write_latency(None);
        store
            .set(&format!("{}/Z", PATH), json!({"text": "z", "order": 9}))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(sync.items(), after_dispose);

        assert!(matches!(
            sync.move_item(0, 1).await,
            Err(SyncError::Disposed(_))
        ));
    }

    #[tokio::test]
    async fn test_snapshot_stream_follows_remote_changes() {
        let store = seeded(&["A"]);
        let sync = open(&store).await;
        let mut stream = sync.snapshots();

        assert_eq!(ids(&stream.next().await.unwrap()), vec!["A"]);

        store
            .set(
                &format!("{}/B", PATH),
                json!({"text": "b", "completed": false, "order": 1}),
            )
            .await
            .unwrap();
        assert_eq!(ids(&stream.next().await.unwrap()), vec!["A", "B"]);
    }

    #[tokio::test]
    async fn test_update_item_keeps_children() {
        let store = seeded(&["A", "B"]);
        store
            .set(&format!("{}/A/notes/n1", PATH), json!({"text": "keep"}))
            .await
            .unwrap();
        let sync = open(&store).await;

        let item = sync
            .update_item(0, |todo| {
                todo.completed = true;
                Ok(())
            })
            .await
            .unwrap();
        assert!(item.payload.completed);
        assert!(sync.items()[0].payload.completed);
        assert_eq!(store.snapshot(&format!("{}/A/completed", PATH)), json!(true));
        assert_eq!(store.snapshot(&format!("{}/A/order", PATH)), json!(0));
        assert_eq!(
            store.snapshot(&format!("{}/A/notes/n1/text", PATH)),
            json!("keep")
        );
    }

    #[test]
    fn test_generated_ids_are_valid_keys() {
        let a = generate_id();
        let b = generate_id();
        assert_ne!(a, b);
        assert!(paths::is_valid_key(&a));
        assert_eq!(a.len(), 19);
    }
}
