//! The cell-based KV cache engine

pub mod allocator;
pub mod cells;
pub mod defrag;
pub mod error;
pub mod kv;
pub mod mask;
pub mod positions;

pub use cells::{Cell, SeqId, SeqPos};
pub use error::CacheError;
pub use kv::{CacheStats, KvCache, KvViews};
pub use mask::Mask;
