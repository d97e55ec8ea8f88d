//! Tensor handles: non-owning, strided windows into backend buffers
//!
//! Dimensions are ordered innermost first (dim 0 varies fastest) and strides
//! are counted in elements, not bytes. A `Tensor` never owns memory; it only
//! names a buffer plus the offset/shape/stride needed to address part of it.

use std::fmt;
use std::str::FromStr;

use super::BackendError;

/// Maximum tensor rank
pub const MAX_DIMS: usize = 4;

/// Element storage type of a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    F32,
    F16,
}

impl DType {
    /// Size of one element in bytes
    pub fn size_bytes(self) -> usize {
        match self {
            DType::F32 => 4,
            DType::F16 => 2,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DType::F32 => write!(f, "f32"),
            DType::F16 => write!(f, "f16"),
        }
    }
}

impl FromStr for DType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "f32" | "float32" => Ok(DType::F32),
            "f16" | "float16" | "half" => Ok(DType::F16),
            other => Err(format!("unknown dtype '{}'", other)),
        }
    }
}

/// Identifier of a buffer owned by a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u64);

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buf#{}", self.0)
    }
}

/// A strided view into a backend buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tensor {
    buffer: BufferId,
    dtype: DType,
    /// Element offset of the first element within the buffer
    offset: usize,
    /// Extent of each dimension: [dim0, dim1, dim2, dim3]
    ne: [usize; MAX_DIMS],
    /// Stride of each dimension in elements
    nb: [usize; MAX_DIMS],
    n_dims: usize,
}

impl Tensor {
    /// Contiguous tensor covering `shape` starting at `offset`
    pub fn contiguous(
        buffer: BufferId,
        dtype: DType,
        offset: usize,
        shape: &[usize],
    ) -> Result<Self, BackendError> {
        check_rank(shape.len())?;
        let mut ne = [1; MAX_DIMS];
        let mut nb = [0; MAX_DIMS];
        let mut stride = 1;
        for (i, &n) in shape.iter().enumerate() {
            ne[i] = n;
            nb[i] = stride;
            stride *= n;
        }
        // Trailing unit dims still get a well-formed stride
        for i in shape.len()..MAX_DIMS {
            nb[i] = stride;
        }
        Ok(Self {
            buffer,
            dtype,
            offset,
            ne,
            nb,
            n_dims: shape.len().max(1),
        })
    }

    /// Take a view relative to this tensor's offset
    ///
    /// `dims` is a list of `(extent, stride)` pairs, innermost first.
    pub fn view(&self, offset: usize, dims: &[(usize, usize)]) -> Result<Self, BackendError> {
        check_rank(dims.len())?;
        let mut ne = [1; MAX_DIMS];
        let mut nb = [0; MAX_DIMS];
        for (i, &(n, s)) in dims.iter().enumerate() {
            ne[i] = n;
            nb[i] = s;
        }
        Ok(Self {
            buffer: self.buffer,
            dtype: self.dtype,
            offset: self.offset + offset,
            ne,
            nb,
            n_dims: dims.len().max(1),
        })
    }

    /// Contiguous 1-D view of `len` elements starting `offset` elements in
    pub fn view_1d(&self, offset: usize, len: usize) -> Result<Self, BackendError> {
        self.view(offset, &[(len, 1)])
    }

    pub fn buffer(&self) -> BufferId {
        self.buffer
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn n_dims(&self) -> usize {
        self.n_dims
    }

    /// Extent of dimension `i` (1 for dimensions beyond the rank)
    pub fn dim(&self, i: usize) -> usize {
        if i < MAX_DIMS {
            self.ne[i]
        } else {
            1
        }
    }

    /// Stride of dimension `i` in elements
    pub fn stride(&self, i: usize) -> usize {
        if i < MAX_DIMS {
            self.nb[i]
        } else {
            0
        }
    }

    /// Shape truncated to the tensor's rank
    pub fn shape(&self) -> Vec<usize> {
        self.ne[..self.n_dims].to_vec()
    }

    /// Total number of elements addressed
    pub fn len(&self) -> usize {
        self.ne.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether elements are laid out densely in dim order
    pub fn is_contiguous(&self) -> bool {
        let mut expected = 1;
        for i in 0..MAX_DIMS {
            if self.ne[i] > 1 && self.nb[i] != expected {
                return false;
            }
            expected *= self.ne[i];
        }
        true
    }

    /// One past the highest buffer element this view touches
    pub fn end(&self) -> usize {
        if self.is_empty() {
            return self.offset;
        }
        let last: usize = (0..MAX_DIMS).map(|i| (self.ne[i] - 1) * self.nb[i]).sum();
        self.offset + last + 1
    }

    /// Absolute buffer element index for every element, dim 0 fastest
    pub fn element_indices(&self) -> Vec<usize> {
        let mut out = Vec::with_capacity(self.len());
        if self.is_empty() {
            return out;
        }
        for i3 in 0..self.ne[3] {
            for i2 in 0..self.ne[2] {
                for i1 in 0..self.ne[1] {
                    let base = self.offset + i3 * self.nb[3] + i2 * self.nb[2] + i1 * self.nb[1];
                    for i0 in 0..self.ne[0] {
                        out.push(base + i0 * self.nb[0]);
                    }
                }
            }
        }
        out
    }
}

fn check_rank(n: usize) -> Result<(), BackendError> {
    if n > MAX_DIMS {
        return Err(BackendError::RankTooLarge(n));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contiguous_strides() {
        let t = Tensor::contiguous(BufferId(1), DType::F32, 0, &[4, 3, 2]).unwrap();
        assert_eq!(t.shape(), vec![4, 3, 2]);
        assert_eq!(t.stride(0), 1);
        assert_eq!(t.stride(1), 4);
        assert_eq!(t.stride(2), 12);
        assert_eq!(t.len(), 24);
        assert_eq!(t.end(), 24);
        assert!(t.is_contiguous());
    }

    #[test]
    fn test_view_offsets_compose() {
        let t = Tensor::contiguous(BufferId(1), DType::F32, 0, &[64]).unwrap();
        let v = t.view_1d(8, 8).unwrap();
        let vv = v.view(2, &[(2, 1), (2, 4)]).unwrap();
        assert_eq!(vv.offset(), 10);
        assert_eq!(vv.element_indices(), vec![10, 11, 14, 15]);
        assert!(!vv.is_contiguous());
        assert_eq!(vv.end(), 16);
    }

    #[test]
    fn test_dim_beyond_rank() {
        let t = Tensor::contiguous(BufferId(0), DType::F16, 0, &[5]).unwrap();
        assert_eq!(t.dim(2), 1);
        assert_eq!(t.dim(7), 1);
        assert_eq!(t.n_dims(), 1);
    }

    #[test]
    fn test_rank_limit() {
        let err = Tensor::contiguous(BufferId(0), DType::F32, 0, &[1, 1, 1, 1, 1]).unwrap_err();
        assert!(matches!(err, BackendError::RankTooLarge(5)));
    }

    #[test]
    fn test_dtype_parse() {
        assert_eq!("F16".parse::<DType>().unwrap(), DType::F16);
        assert_eq!("float32".parse::<DType>().unwrap(), DType::F32);
        assert!("q4_0".parse::<DType>().is_err());
        assert_eq!(DType::F16.size_bytes(), 2);
    }
}
