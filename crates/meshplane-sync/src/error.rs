//! Error types for the sync protocol.

use thiserror::Error;

pub type SyncResult<T> = Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    /// The dispatcher could not hand the object to the target cluster.
    #[error("dispatch to cluster {cluster} failed: {reason}")]
    Dispatch { cluster: String, reason: String },

    #[error("failed to encode {kind} {name}: {reason}")]
    Encode {
        kind: String,
        name: String,
        reason: String,
    },
}
