use crate::error::AutogradError;
use crate::types::DType;
use std::fmt::Debug;

/// Concrete CPU storage for a gradient tensor, specialized by data type.
///
/// This enum acts as the dispatcher between the dtype-erased engine and the
/// typed inner kernels in [`crate::math`]. Buffers are plainly owned here:
/// the surrounding `TensorData` always lives behind a variable's lock, so no
/// further sharing layer is needed for the engine's in-place accumulation.
#[derive(Debug, Clone, PartialEq)]
pub enum CpuBuffer {
    /// Buffer holding `f32` (32-bit floating-point) values.
    F32(Vec<f32>),
    /// Buffer holding `f64` (64-bit floating-point) values.
    F64(Vec<f64>),
}

impl CpuBuffer {
    /// Allocates a zeroed buffer of `numel` elements of the given dtype.
    pub fn zeros(dtype: DType, numel: usize) -> Self {
        match dtype {
            DType::F32 => CpuBuffer::F32(vec![0.0; numel]),
            DType::F64 => CpuBuffer::F64(vec![0.0; numel]),
        }
    }

    /// The dtype of the stored elements.
    pub fn dtype(&self) -> DType {
        match self {
            CpuBuffer::F32(_) => DType::F32,
            CpuBuffer::F64(_) => DType::F64,
        }
    }

    /// Number of stored elements.
    pub fn len(&self) -> usize {
        match self {
            CpuBuffer::F32(data) => data.len(),
            CpuBuffer::F64(data) => data.len(),
        }
    }

    /// Whether the buffer holds no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Attempts to view the buffer as an `f32` slice.
    ///
    /// Returns `DataTypeMismatch` if the buffer holds a different dtype.
    pub fn try_as_f32(&self) -> Result<&[f32], AutogradError> {
        match self {
            CpuBuffer::F32(data) => Ok(data),
            other => Err(AutogradError::DataTypeMismatch {
                expected: DType::F32,
                actual: other.dtype(),
                operation: "try_as_f32".to_string(),
            }),
        }
    }

    /// Attempts to view the buffer as a mutable `f32` slice.
    pub fn try_as_f32_mut(&mut self) -> Result<&mut [f32], AutogradError> {
        match self {
            CpuBuffer::F32(data) => Ok(data),
            other => Err(AutogradError::DataTypeMismatch {
                expected: DType::F32,
                actual: other.dtype(),
                operation: "try_as_f32_mut".to_string(),
            }),
        }
    }

    /// Attempts to view the buffer as an `f64` slice.
    pub fn try_as_f64(&self) -> Result<&[f64], AutogradError> {
        match self {
            CpuBuffer::F64(data) => Ok(data),
            other => Err(AutogradError::DataTypeMismatch {
                expected: DType::F64,
                actual: other.dtype(),
                operation: "try_as_f64".to_string(),
            }),
        }
    }

    /// Attempts to view the buffer as a mutable `f64` slice.
    pub fn try_as_f64_mut(&mut self) -> Result<&mut [f64], AutogradError> {
        match self {
            CpuBuffer::F64(data) => Ok(data),
            other => Err(AutogradError::DataTypeMismatch {
                expected: DType::F64,
                actual: other.dtype(),
                operation: "try_as_f64_mut".to_string(),
            }),
        }
    }
}
