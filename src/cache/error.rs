//! Errors from cache operations

use crate::backend::BackendError;

use super::cells::SeqId;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("could not find a kv cache slot (capacity: {capacity})")]
    CapacityExhausted { capacity: usize },

    #[error("inconsistent batch sizes (layer: {layer}, batch size: {expected}, layer batch size: {actual})")]
    BatchSizeMismatch {
        layer: usize,
        expected: usize,
        actual: usize,
    },

    #[error("cache invariant violated: {0}")]
    InvariantViolation(String),

    #[error("model does not support operation: {0}")]
    UnsupportedOperation(String),

    #[error("invalid shift for sequence {seq}: {reason}")]
    InvalidShift { seq: SeqId, reason: String },

    #[error("defragmentation failed, cache left unchanged")]
    DefragmentationFailed(#[source] BackendError),

    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("cache has been closed")]
    Closed,
}

impl CacheError {
    /// Whether the caller can reasonably recover (evict, shrink the batch,
    /// pick another mutation) rather than treat this as a bug.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            CacheError::CapacityExhausted { .. }
                | CacheError::UnsupportedOperation(_)
                | CacheError::InvalidShift { .. }
                | CacheError::DefragmentationFailed(_)
        )
    }

    /// Caller/programming bugs: abort the step, never retry
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            CacheError::BatchSizeMismatch { .. } | CacheError::InvariantViolation(_)
        )
    }
}
