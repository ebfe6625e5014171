/// Rank assignment for ordered collections.
///
/// The tree store keeps no order of its own, so every item carries an
/// integer `order`. After any insert, delete or move the whole sequence is
/// re-ranked to `0..N` so that ascending sort reproduces it.
use std::collections::BTreeMap;

use serde_json::Value;

use crate::paths;
use crate::store::PathUpdates;
use crate::types::{Item, ORDER_FIELD};

/// id -> new rank.
pub type RankMap = BTreeMap<String, u64>;

/// Rank of every item = its zero-based position. Prior `order` values are
/// ignored.
pub fn assign_ranks<T>(items: &[Item<T>]) -> RankMap {
    items
        .iter()
        .enumerate()
        .map(|(index, item)| (item.id.clone(), index as u64))
        .collect()
}

/// Rewrite `order` in place to match positions.
pub fn rerank<T>(items: &mut [Item<T>]) {
    for (index, item) in items.iter_mut().enumerate() {
        item.order = index as u64;
    }
}

/// Remove the item at `from` and reinsert it at `to`, then re-rank.
/// Callers check both indices against the length.
pub fn move_within<T: Clone>(items: &[Item<T>], from: usize, to: usize) -> Vec<Item<T>> {
    let mut out = items.to_vec();
    let moved = out.remove(from);
    out.insert(to, moved);
    rerank(&mut out);
    out
}

/// Drop the item at `index`, close the gap. Returns the removed item and the
/// re-ranked remainder.
pub fn remove_at<T: Clone>(items: &[Item<T>], index: usize) -> (Item<T>, Vec<Item<T>>) {
    let mut out = items.to_vec();
    let removed = out.remove(index);
    rerank(&mut out);
    (removed, out)
}

/// Insert `item` at `index` (clamped to the end) and re-rank.
pub fn insert_at<T: Clone>(items: &[Item<T>], index: usize, item: Item<T>) -> Vec<Item<T>> {
    let mut out = items.to_vec();
    out.insert(index.min(out.len()), item);
    rerank(&mut out);
    out
}

/// Batched write setting `{collection}/{id}/order` for every ranked id.
/// An empty map yields no updates, never a write of an empty object.
pub fn rank_updates(collection: &str, ranks: &RankMap) -> PathUpdates {
    ranks
        .iter()
        .map(|(id, order)| {
            (
                paths::join(&paths::join(collection, id), ORDER_FIELD),
                Value::from(*order),
            )
        })
        .collect()
}

/// Ranks are dense when the sorted orders are exactly `0..N`.
pub fn is_dense<T>(items: &[Item<T>]) -> bool {
    let mut orders: Vec<u64> = items.iter().map(|i| i.order).collect();
    orders.sort_unstable();
    orders.iter().enumerate().all(|(i, o)| *o == i as u64)
}
