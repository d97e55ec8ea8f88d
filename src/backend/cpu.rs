//! Host-memory reference backend
//!
//! Buffers live in plain vectors (f32 or IEEE half via the `half` crate).
//! Copies are queued by `schedule_copy` and only applied by `compute`, which
//! validates the whole queue before touching any buffer so a failed compute
//! leaves every buffer unchanged.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use half::f16;
use tracing::debug;

use super::{Backend, BackendError, BufferId, DType, Tensor};

enum Storage {
    F32(Vec<f32>),
    F16(Vec<f16>),
}

impl Storage {
    fn zeros(dtype: DType, len: usize) -> Self {
        match dtype {
            DType::F32 => Storage::F32(vec![0.0; len]),
            DType::F16 => Storage::F16(vec![f16::ZERO; len]),
        }
    }

    fn len(&self) -> usize {
        match self {
            Storage::F32(v) => v.len(),
            Storage::F16(v) => v.len(),
        }
    }

    fn get(&self, idx: usize) -> f32 {
        match self {
            Storage::F32(v) => v[idx],
            Storage::F16(v) => v[idx].to_f32(),
        }
    }

    fn set(&mut self, idx: usize, value: f32) {
        match self {
            Storage::F32(v) => v[idx] = value,
            Storage::F16(v) => v[idx] = f16::from_f32(value),
        }
    }

    fn size_bytes(&self) -> usize {
        match self {
            Storage::F32(v) => v.len() * std::mem::size_of::<f32>(),
            Storage::F16(v) => v.len() * std::mem::size_of::<f16>(),
        }
    }
}

struct PendingCopy {
    src: Tensor,
    dst: Tensor,
}

#[derive(Default)]
struct CpuStore {
    buffers: HashMap<BufferId, Storage>,
    released: HashSet<BufferId>,
    pending: Vec<PendingCopy>,
    next_id: u64,
    copies_executed: u64,
}

impl CpuStore {
    fn insert(&mut self, storage: Storage) -> BufferId {
        let id = BufferId(self.next_id);
        self.next_id += 1;
        self.buffers.insert(id, storage);
        id
    }

    fn storage(&self, id: BufferId) -> Result<&Storage, BackendError> {
        match self.buffers.get(&id) {
            Some(s) => Ok(s),
            None if self.released.contains(&id) => Err(BackendError::Released(id)),
            None => Err(BackendError::UnknownBuffer(id)),
        }
    }

    fn check_view(&self, t: &Tensor) -> Result<(), BackendError> {
        let storage = self.storage(t.buffer())?;
        let end = t.end();
        if end > storage.len() {
            return Err(BackendError::OutOfBounds {
                buffer: t.buffer(),
                end,
                len: storage.len(),
            });
        }
        Ok(())
    }

    fn gather(&self, t: &Tensor) -> Result<Vec<f32>, BackendError> {
        self.check_view(t)?;
        let storage = self.storage(t.buffer())?;
        Ok(t.element_indices()
            .into_iter()
            .map(|i| storage.get(i))
            .collect())
    }
}

/// Reference backend that keeps every buffer in host memory
#[derive(Default)]
pub struct CpuBackend {
    store: Mutex<CpuStore>,
}

impl CpuBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, CpuStore> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of live buffers
    pub fn live_buffers(&self) -> usize {
        self.lock().buffers.len()
    }

    /// Bytes held by live buffers
    pub fn allocated_bytes(&self) -> usize {
        self.lock().buffers.values().map(Storage::size_bytes).sum()
    }

    /// Copies queued but not yet computed
    pub fn pending_copies(&self) -> usize {
        self.lock().pending.len()
    }

    /// Copies applied since creation
    pub fn copies_executed(&self) -> u64 {
        self.lock().copies_executed
    }
}

impl Backend for CpuBackend {
    fn name(&self) -> &str {
        "cpu"
    }

    fn zeros(&self, dtype: DType, len: usize) -> Result<Tensor, BackendError> {
        let id = self.lock().insert(Storage::zeros(dtype, len));
        debug!("cpu: allocated {} x {} as {}", len, dtype, id);
        Tensor::contiguous(id, dtype, 0, &[len])
    }

    fn from_floats(&self, data: &[f32], shape: &[usize]) -> Result<Tensor, BackendError> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(BackendError::DataLength {
                expected,
                got: data.len(),
            });
        }
        let id = self.lock().insert(Storage::F32(data.to_vec()));
        Tensor::contiguous(id, DType::F32, 0, shape)
    }

    fn schedule_copies(&self, copies: &[(Tensor, Tensor)]) -> Result<(), BackendError> {
        let mut store = self.lock();
        for (src, dst) in copies {
            if src.len() != dst.len() {
                return Err(BackendError::ShapeMismatch {
                    src: src.len(),
                    dst: dst.len(),
                });
            }
            store.storage(src.buffer())?;
            store.storage(dst.buffer())?;
        }
        store.pending.extend(
            copies
                .iter()
                .map(|&(src, dst)| PendingCopy { src, dst }),
        );
        Ok(())
    }

    fn discard(&self) {
        let mut store = self.lock();
        if !store.pending.is_empty() {
            debug!("cpu: discarded {} queued copies", store.pending.len());
            store.pending.clear();
        }
    }

    fn compute(&self) -> Result<(), BackendError> {
        let mut store = self.lock();
        let pending = std::mem::take(&mut store.pending);

        for op in &pending {
            store.check_view(&op.src)?;
            store.check_view(&op.dst)?;
        }

        for op in &pending {
            // Gather first so overlapping source/destination ranges behave like memmove
            let values = store.gather(&op.src)?;
            let dst_indices = op.dst.element_indices();
            let storage = store
                .buffers
                .get_mut(&op.dst.buffer())
                .ok_or(BackendError::UnknownBuffer(op.dst.buffer()))?;
            for (idx, value) in dst_indices.into_iter().zip(values) {
                storage.set(idx, value);
            }
        }

        store.copies_executed += pending.len() as u64;
        Ok(())
    }

    fn read(&self, tensor: &Tensor) -> Result<Vec<f32>, BackendError> {
        self.lock().gather(tensor)
    }

    fn release(&self, buffer: BufferId) {
        let mut store = self.lock();
        if store.buffers.remove(&buffer).is_some() {
            store.released.insert(buffer);
            debug!("cpu: released {}", buffer);
        }
    }
}
