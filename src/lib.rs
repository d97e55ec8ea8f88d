//! kvcell: cell-based key/value cache for batched multi-sequence decoding
//!
//! A fixed pool of cells is shared by every sequence being decoded. Each
//! step reserves one cell per advancing sequence, builds the causal mask,
//! and per layer stores the new keys/values while handing back views over
//! all live cells. Sequences can be forked, trimmed and renumbered between
//! steps without recomputing cached data.

pub mod backend;
pub mod cache;
pub mod config;
pub mod workload;

pub use backend::{Backend, BackendError, CpuBackend, DType, Tensor};
pub use cache::{CacheError, CacheStats, KvCache, KvViews, Mask, SeqId};
pub use config::{CacheConfig, Config, ShiftMode, WorkloadConfig};
