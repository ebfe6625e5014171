pub mod collection;
pub mod echo;
pub mod reconcile;
pub mod registry;
pub mod relocate;
pub mod types;

pub use collection::{decode_collection, CollectionSync};
pub use registry::SyncRegistry;
pub use relocate::{move_between, Relocation};
pub use types::{MoveOutcome, SyncPhase};

use crate::store::StoreError;
use crate::types::TableError;
use crate::validate::ValidationError;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("Index {index} out of range (collection has {len} items)")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("Item {0} is no longer in the store")]
    ItemVanished(String),

    #[error("Collection {0} has been disposed")]
    Disposed(String),

    #[error("Payload is not storable: {0}")]
    Payload(#[from] serde_json::Error),

    #[error(transparent)]
    Table(#[from] TableError),

    #[error("Moving {id} between buckets failed (source restored: {compensated}): {source}")]
    RelocationFailed {
        id: String,
        compensated: bool,
        #[source]
        source: Box<SyncError>,
    },
}

impl SyncError {
    /// Validation failures are reported before anything is written.
    pub fn is_validation(&self) -> bool {
        matches!(self, SyncError::Validation(_) | SyncError::AlreadyExists(_))
    }
}
