/// Types shared by the collection synchroniser.
use serde::Serialize;

use crate::types::Item;

/// SHA-256 fingerprint of an ordered sequence, used for echo detection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SequenceFingerprint(pub String);

impl SequenceFingerprint {
    /// Fingerprint of ids, ranks and payloads in sequence order.
    pub fn from_items<T: Serialize>(items: &[Item<T>]) -> Self {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        for item in items {
            hasher.update(item.id.as_bytes());
            hasher.update([0u8]);
            hasher.update(item.order.to_be_bytes());
            let body = serde_json::to_string(&item.payload).unwrap_or_default();
            hasher.update(body.as_bytes());
            hasher.update([0xffu8]);
        }
        Self(hex::encode(hasher.finalize()))
    }
}

/// Lifecycle of one collection session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Unsubscribed,
    Subscribing,
    Synced,
    /// A local write is in flight; remote notifications only refresh the
    /// confirmed state.
    Reconciling,
}

/// What a move request did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveOutcome {
    /// Source and target position were equal; nothing was written.
    Unchanged,
    Moved,
}
