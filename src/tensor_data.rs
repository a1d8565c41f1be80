use crate::buffer::CpuBuffer;
use crate::device::StorageDevice;
use crate::error::AutogradError;
use crate::types::DType;

/// Storage and metadata for one gradient (or primal) tensor value.
///
/// This is the opaque value a [`crate::variable::Variable`] wraps. The engine
/// only ever allocates, fills, adds into, and moves these values; all other
/// tensor machinery (views, strides, broadcasting) belongs to the forward
/// framework and is out of scope here. Buffers are contiguous row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorData {
    /// The underlying typed data buffer.
    pub(crate) buffer: CpuBuffer,
    /// The device where the buffer resides.
    pub(crate) device: StorageDevice,
    /// The shape (dimensions) of the tensor.
    pub shape: Vec<usize>,
    /// Monotonic counter incremented on every destructive mutation of the
    /// buffer. The engine compares it against the snapshot a variable took
    /// at forward-record time to detect tampering during backward.
    pub(crate) inplace_version: u32,
}

impl TensorData {
    /// Allocates a zero-initialized tensor of the given shape and dtype.
    pub fn zeros(shape: Vec<usize>, dtype: DType, device: StorageDevice) -> Self {
        let numel = shape.iter().product();
        TensorData {
            buffer: CpuBuffer::zeros(dtype, numel),
            device,
            shape,
            inplace_version: 0,
        }
    }

    /// Builds an `f32` tensor from raw data. Used by forward recorders and tests.
    pub fn from_f32(data: Vec<f32>, shape: Vec<usize>) -> Result<Self, AutogradError> {
        let numel: usize = shape.iter().product();
        if data.len() != numel {
            return Err(AutogradError::GradientShapeMismatch {
                expected: shape,
                actual: vec![data.len()],
            });
        }
        Ok(TensorData {
            buffer: CpuBuffer::F32(data),
            device: StorageDevice::CPU,
            shape,
            inplace_version: 0,
        })
    }

    /// Builds an `f64` tensor from raw data.
    pub fn from_f64(data: Vec<f64>, shape: Vec<usize>) -> Result<Self, AutogradError> {
        let numel: usize = shape.iter().product();
        if data.len() != numel {
            return Err(AutogradError::GradientShapeMismatch {
                expected: shape,
                actual: vec![data.len()],
            });
        }
        Ok(TensorData {
            buffer: CpuBuffer::F64(data),
            device: StorageDevice::CPU,
            shape,
            inplace_version: 0,
        })
    }

    /// The dtype of the stored elements.
    pub fn dtype(&self) -> DType {
        self.buffer.dtype()
    }

    /// The device the buffer resides on.
    pub fn device(&self) -> StorageDevice {
        self.device
    }

    /// Number of elements, as given by the shape.
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    /// Immutable access to the typed buffer.
    pub fn buffer(&self) -> &CpuBuffer {
        &self.buffer
    }

    /// Mutable access to the typed buffer for the math kernels.
    ///
    /// This does **not** bump the inplace version: the engine's own writes
    /// (gradient sums, zero fills) are part of backward itself, not user
    /// mutations of a forward-recorded tensor.
    pub(crate) fn buffer_mut(&mut self) -> &mut CpuBuffer {
        &mut self.buffer
    }

    /// Current inplace version of this tensor.
    pub fn inplace_version(&self) -> u32 {
        self.inplace_version
    }

    /// Records one destructive mutation. Called by whoever mutates the
    /// tensor's storage outside the engine (e.g. a forward inplace operator).
    pub fn bump_inplace_version(&mut self) {
        self.inplace_version += 1;
    }

    /// Copies out the data as `f32`. Convenience for assertions in tests.
    pub fn to_f32_vec(&self) -> Result<Vec<f32>, AutogradError> {
        Ok(self.buffer.try_as_f32()?.to_vec())
    }

    /// Copies out the data as `f64`.
    pub fn to_f64_vec(&self) -> Result<Vec<f64>, AutogradError> {
        Ok(self.buffer.try_as_f64()?.to_vec())
    }
}
