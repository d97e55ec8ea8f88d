//! Tensor/compute backend capability surface consumed by the cache
//!
//! The cache only needs four things from a backend: zeroed buffers, buffers
//! built from host floats (the mask), strided views (pure metadata, see
//! [`Tensor::view`]) and deferred copies that materialize on `compute()`.

pub mod cpu;
pub mod tensor;

pub use cpu::CpuBackend;
pub use tensor::{BufferId, DType, Tensor, MAX_DIMS};

/// Errors raised by a backend
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("unknown buffer {0}")]
    UnknownBuffer(BufferId),

    #[error("buffer {0} has been released")]
    Released(BufferId),

    #[error("view on {buffer} reaches element {end} but buffer holds {len}")]
    OutOfBounds {
        buffer: BufferId,
        end: usize,
        len: usize,
    },

    #[error("copy shape mismatch: source has {src} elements, destination {dst}")]
    ShapeMismatch { src: usize, dst: usize },

    #[error("host data has {got} values but shape needs {expected}")]
    DataLength { expected: usize, got: usize },

    #[error("tensor rank {0} exceeds the supported maximum")]
    RankTooLarge(usize),

    #[error("backend compute failed: {0}")]
    Compute(String),
}

/// Capabilities a compute backend provides to the cache engine
///
/// All methods take `&self`; implementations synchronize internally so a
/// backend can be shared between the cache and the model layer.
pub trait Backend: Send + Sync {
    /// Short human-readable name, used in logs
    fn name(&self) -> &str;

    /// Allocate a zero-initialized 1-D buffer of `len` elements
    fn zeros(&self, dtype: DType, len: usize) -> Result<Tensor, BackendError>;

    /// Build an f32 buffer from host values with the given shape
    fn from_floats(&self, data: &[f32], shape: &[usize]) -> Result<Tensor, BackendError>;

    /// Queue a batch of `(src, dst)` copies; nothing moves until `compute()`.
    /// Either every copy in the batch is queued or, on error, none is.
    fn schedule_copies(&self, copies: &[(Tensor, Tensor)]) -> Result<(), BackendError>;

    /// Queue a single copy of `src` into `dst`
    fn schedule_copy(&self, src: &Tensor, dst: &Tensor) -> Result<(), BackendError> {
        self.schedule_copies(&[(*src, *dst)])
    }

    /// Drop every queued copy without applying it
    fn discard(&self);

    /// Execute every queued copy in submission order. On error none of the
    /// queued copies has been applied and the queue is cleared.
    fn compute(&self) -> Result<(), BackendError>;

    /// Read a view back to host memory as f32, dim 0 fastest
    fn read(&self, tensor: &Tensor) -> Result<Vec<f32>, BackendError>;

    /// Release a buffer; views into it become invalid
    fn release(&self, buffer: BufferId);
}
