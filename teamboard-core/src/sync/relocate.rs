/// Moving an item between two collections.
///
/// The store has no transaction spanning two collections, so a relocation
/// is two writes:
/// 1. source: delete the item subtree and close the rank gap
/// 2. target: insert the subtree at its new position and re-rank
///
/// If step 2 fails the item would exist nowhere. With
/// `compensate_relocation` enabled the source write is undone (subtree and
/// original ranks restored); either way both collections are re-read and
/// the failure is reported.
use serde_json::{Map, Value};

use super::collection::CollectionSync;
use super::SyncError;
use crate::paths;
use crate::rank;
use crate::store::{PathUpdates, TreeStore};
use crate::types::{Item, Payload, ORDER_FIELD};

/// A completed move. `item` carries its rank in the target.
#[derive(Debug, Clone, PartialEq)]
pub struct Relocation<T> {
    pub item: Item<T>,
    pub from: usize,
    pub to: usize,
}

/// Move the item at `from` in `source` to position `to` in `target`.
/// `to` may equal the target length (append).
pub async fn move_between<S: TreeStore, T: Payload>(
    source: &CollectionSync<S, T>,
    target: &CollectionSync<S, T>,
    from: usize,
    to: usize,
) -> Result<Relocation<T>, SyncError> {
    if source.path() == target.path() {
        source.move_item(from, to).await?;
        let item = source
            .items()
            .into_iter()
            .nth(to)
            .ok_or(SyncError::IndexOutOfRange {
                index: to,
                len: source.len(),
            })?;
        return Ok(Relocation { item, from, to });
    }

    let source_items = source.items();
    let target_items = target.items();
    if from >= source_items.len() {
        return Err(SyncError::IndexOutOfRange {
            index: from,
            len: source_items.len(),
        });
    }
    if to > target_items.len() {
        return Err(SyncError::IndexOutOfRange {
            index: to,
            len: target_items.len(),
        });
    }

    let moved = source_items[from].clone();
    let id = moved.id.clone();
    if target.position(&id).is_some() {
        return Err(SyncError::AlreadyExists(target.item_path(&id)));
    }

    // The full subtree travels, children included
    let subtree = match source.read(&source.item_path(&id)).await? {
        Value::Object(fields) => fields,
        Value::Null => {
            log::warn!(
                "[teamboard.sync.relocate] {} vanished from {} before the move",
                id,
                source.path()
            );
            source.refresh().await?;
            return Err(SyncError::ItemVanished(id));
        }
        _ => moved.payload_fields()?,
    };

    log::info!(
        "[teamboard.sync.relocate] {}: {}[{}] -> {}[{}]",
        id,
        source.path(),
        from,
        target.path(),
        to
    );

    let (_, remaining) = rank::remove_at(&source_items, from);
    let mut source_updates = rank::rank_updates(source.path(), &rank::assign_ranks(&remaining));
    source_updates.insert(source.item_path(&id), Value::Null);
    source.commit("relocate", remaining, source_updates).await?;

    let placed = Item::new(id.clone(), 0, moved.payload.clone());
    let inserted = rank::insert_at(&target_items, to, placed);
    let target_updates = placement_updates(target.path(), &inserted, &id, subtree.clone());

    match target.commit("relocate", inserted.clone(), target_updates).await {
        Ok(()) => {
            let item = inserted
                .into_iter()
                .find(|item| item.id == id)
                .ok_or_else(|| SyncError::ItemVanished(id.clone()))?;
            Ok(Relocation { item, from, to })
        }
        Err(e) => {
            let compensated = if source.config().compensate_relocation {
                restore_source(source, &source_items, &id, subtree).await
            } else {
                log::warn!(
                    "[teamboard.sync.relocate] {} is in neither {} nor {} until re-created",
                    id,
                    source.path(),
                    target.path()
                );
                false
            };
            for sync in [source, target] {
                if let Err(refresh_err) = sync.refresh().await {
                    log::warn!(
                        "[teamboard.sync.relocate] Re-read of {} failed: {}",
                        sync.path(),
                        refresh_err
                    );
                }
            }
            Err(SyncError::RelocationFailed {
                id,
                compensated,
                source: Box::new(e),
            })
        }
    }
}

/// Rank writes for every item of `sequence` except `id`, plus the whole
/// subtree of `id` with its new rank.
fn placement_updates<T>(
    collection: &str,
    sequence: &[Item<T>],
    id: &str,
    mut subtree: Map<String, Value>,
) -> PathUpdates {
    let mut ranks = rank::assign_ranks(sequence);
    let order = ranks.remove(id).unwrap_or(0);
    let mut updates = rank::rank_updates(collection, &ranks);
    subtree.insert(ORDER_FIELD.to_string(), Value::from(order));
    updates.insert(paths::join(collection, id), Value::Object(subtree));
    updates
}

/// Put the subtree back into the source at its original position. Returns
/// whether the source is whole again.
async fn restore_source<S: TreeStore, T: Payload>(
    source: &CollectionSync<S, T>,
    original: &[Item<T>],
    id: &str,
    subtree: Map<String, Value>,
) -> bool {
    let mut restored = original.to_vec();
    rank::rerank(&mut restored);
    let updates = placement_updates(source.path(), &restored, id, subtree);
    match source.commit("compensate", restored, updates).await {
        Ok(()) => {
            log::info!(
                "[teamboard.sync.relocate] Restored {} in {}",
                id,
                source.path()
            );
            true
        }
        Err(e) => {
            log::error!(
                "[teamboard.sync.relocate] Could not restore {} in {}: {}",
                id,
                source.path(),
                e
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::store::memory::MemoryStore;
    use crate::store::StoreError;
    use crate::types::TodoPayload;
    use serde_json::json;
    use std::sync::Arc;

    const SOURCE: &str = "teams/t/projects/p/tasks/Today";
    const TARGET: &str = "teams/t/projects/p/tasks/Tomorrow";

    fn entry(id: &str, order: usize) -> Value {
        json!({"text": format!("do {}", id), "completed": false, "order": order})
    }

    fn store() -> Arc<MemoryStore> {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut b = entry("B", 1);
        b["sections"] = json!({"s1": {"type": "text", "content": "notes", "order": 0}});
        Arc::new(MemoryStore::with_root(json!({
            "teams": {"t": {"projects": {"p": {"tasks": {
                "Today": {"A": entry("A", 0), "B": b, "C": entry("C", 2)},
                "Tomorrow": {"X": entry("X", 0), "Y": entry("Y", 1)}
            }}}}}
        })))
    }

    async fn open_pair(
        store: &Arc<MemoryStore>,
        config: SyncConfig,
    ) -> (
        CollectionSync<MemoryStore, TodoPayload>,
        CollectionSync<MemoryStore, TodoPayload>,
    ) {
        let source = CollectionSync::open(store.clone(), SOURCE, config.clone())
            .await
            .unwrap();
        let target = CollectionSync::open(store.clone(), TARGET, config)
            .await
            .unwrap();
        (source, target)
    }

    fn ids(items: &[Item<TodoPayload>]) -> Vec<&str> {
        items.iter().map(|i| i.id.as_str()).collect()
    }

    fn order_at(store: &MemoryStore, path: &str) -> Option<u64> {
        store.snapshot(&format!("{}/order", path)).as_u64()
    }

    #[tokio::test]
    async fn test_move_conserves_items() {
        let store = store();
        let (source, target) = open_pair(&store, SyncConfig::default()).await;

        let relocation = move_between(&source, &target, 1, 0).await.unwrap();
        assert_eq!(relocation.item.id, "B");
        assert_eq!(relocation.item.order, 0);

        let source_items = source.items();
        let target_items = target.items();
        assert_eq!(ids(&source_items), vec!["A", "C"]);
        assert_eq!(ids(&target_items), vec!["B", "X", "Y"]);
        assert_eq!(source_items.len() + target_items.len(), 5);

        assert_eq!(order_at(&store, &format!("{}/A", SOURCE)), Some(0));
        assert_eq!(order_at(&store, &format!("{}/C", SOURCE)), Some(1));
        assert_eq!(order_at(&store, &format!("{}/B", TARGET)), Some(0));
        assert_eq!(order_at(&store, &format!("{}/X", TARGET)), Some(1));
        assert_eq!(order_at(&store, &format!("{}/Y", TARGET)), Some(2));
        assert!(store.snapshot(&format!("{}/B", SOURCE)).is_null());
        assert_eq!(store.write_count(), 2);
    }

    #[tokio::test]
    async fn test_move_carries_children() {
        let store = store();
        let (source, target) = open_pair(&store, SyncConfig::default()).await;

        move_between(&source, &target, 1, 2).await.unwrap();
        assert_eq!(ids(&target.items()), vec!["X", "Y", "B"]);
        assert_eq!(
            store.snapshot(&format!("{}/B/sections/s1/content", TARGET)),
            json!("notes")
        );
        assert_eq!(
            store.snapshot(&format!("{}/B/text", TARGET)),
            json!("do B")
        );
    }

    #[tokio::test]
    async fn test_into_empty_collection() {
        let store = store();
        let config = SyncConfig::default();
        let source = CollectionSync::<_, TodoPayload>::open(store.clone(), SOURCE, config.clone())
            .await
            .unwrap();
        let target = CollectionSync::open(store.clone(), "teams/t/projects/p/tasks/Later", config)
            .await
            .unwrap();
        assert!(target.is_empty());

        move_between(&source, &target, 0, 0).await.unwrap();
        assert_eq!(ids(&target.items()), vec!["A"]);
        assert_eq!(ids(&source.items()), vec!["B", "C"]);
    }

    #[tokio::test]
    async fn test_failed_insert_is_compensated() {
        let store = store();
        let (source, target) = open_pair(&store, SyncConfig::default()).await;
        store.reject_writes_under(Some(TARGET));

        let err = move_between(&source, &target, 1, 0).await.unwrap_err();
        match err {
            SyncError::RelocationFailed {
                id,
                compensated,
                source: cause,
            } => {
                assert_eq!(id, "B");
                assert!(compensated);
                assert!(matches!(
                    *cause,
                    SyncError::Store(StoreError::WriteRejected { .. })
                ));
            }
            other => panic!("unexpected error: {other}"),
        }

        assert_eq!(ids(&source.items()), vec!["A", "B", "C"]);
        assert_eq!(ids(&target.items()), vec!["X", "Y"]);
        assert_eq!(order_at(&store, &format!("{}/B", SOURCE)), Some(1));
        assert_eq!(
            store.snapshot(&format!("{}/B/sections/s1/content", SOURCE)),
            json!("notes")
        );
    }

    #[tokio::test]
    async fn test_failed_insert_without_compensation() {
        let store = store();
        let config = SyncConfig {
            compensate_relocation: false,
            ..SyncConfig::default()
        };
        let (source, target) = open_pair(&store, config).await;
        store.reject_writes_under(Some(TARGET));

        let err = move_between(&source, &target, 1, 0).await.unwrap_err();
        assert!(matches!(
            err,
            SyncError::RelocationFailed {
                compensated: false,
                ..
            }
        ));
        // The documented gap: B is in neither collection
        assert_eq!(ids(&source.items()), vec!["A", "C"]);
        assert_eq!(ids(&target.items()), vec!["X", "Y"]);
    }

    #[tokio::test]
    async fn test_failed_source_write_changes_nothing() {
        let store = store();
        let (source, target) = open_pair(&store, SyncConfig::default()).await;
        store.fail_next_writes(1);

        let err = move_between(&source, &target, 0, 0).await.unwrap_err();
        assert!(matches!(err, SyncError::Store(StoreError::WriteRejected { .. })));
        assert_eq!(ids(&source.items()), vec!["A", "B", "C"]);
        assert_eq!(ids(&target.items()), vec!["X", "Y"]);
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn test_rejects_duplicate_id_in_target() {
        let store = store();
        store
            .set(&format!("{}/B", TARGET), entry("B", 2))
            .await
            .unwrap();
        let (source, target) = open_pair(&store, SyncConfig::default()).await;

        assert!(matches!(
            move_between(&source, &target, 1, 0).await,
            Err(SyncError::AlreadyExists(_))
        ));
        assert_eq!(ids(&source.items()), vec!["A", "B", "C"]);
    }

    #[tokio::test]
    async fn test_index_bounds() {
        let store = store();
        let (source, target) = open_pair(&store, SyncConfig::default()).await;
        assert!(matches!(
            move_between(&source, &target, 3, 0).await,
            Err(SyncError::IndexOutOfRange { index: 3, len: 3 })
        ));
        assert!(matches!(
            move_between(&source, &target, 0, 3).await,
            Err(SyncError::IndexOutOfRange { index: 3, len: 2 })
        ));
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn test_vanished_item() {
        let store = store();
        let (source, target) = open_pair(&store, SyncConfig::default()).await;
        // Removed remotely; the pump has not caught up yet
        store.remove(&format!("{}/B", SOURCE)).await.unwrap();

        assert!(matches!(
            move_between(&source, &target, 1, 0).await,
            Err(SyncError::ItemVanished(id)) if id == "B"
        ));
        assert_eq!(ids(&source.items()), vec!["A", "C"]);
    }

    #[tokio::test]
    async fn test_same_collection_falls_back_to_reorder() {
        let store = store();
        let (source, _target) = open_pair(&store, SyncConfig::default()).await;
        let relocation = move_between(&source, &source, 0, 2).await.unwrap();
        assert_eq!(relocation.item.id, "A");
        assert_eq!(ids(&source.items()), vec!["B", "C", "A"]);
    }
}
