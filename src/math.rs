//! Element-wise math primitives used by the backward engine.
//!
//! Only the two operations the engine itself needs live here: filling a
//! tensor with a scalar (seed gradients, zero-filling ungenerated inputs)
//! and in-place addition (gradient accumulation). Both dispatch on the
//! buffer dtype and delegate to small generic inner kernels.

use crate::buffer::CpuBuffer;
use crate::device::DeviceContext;
use crate::error::AutogradError;
use crate::tensor_data::TensorData;
use num_traits::NumCast;
use std::ops::AddAssign;

/// Fills every element of `tensor` with `value`, cast to the tensor's dtype.
///
/// The context is taken by reference so call sites read like a device
/// dispatch even though the CPU implementation needs no queue.
pub fn set_constant(
    _ctx: &DeviceContext,
    tensor: &mut TensorData,
    value: f64,
) -> Result<(), AutogradError> {
    match tensor.buffer_mut() {
        CpuBuffer::F32(data) => fill_slice(data, value),
        CpuBuffer::F64(data) => fill_slice(data, value),
    }
}

/// In-place element-wise addition: `dst += src`.
///
/// Gradients accumulated into the same bucket always share shape and dtype;
/// a mismatch means the recorder produced an inconsistent graph and is
/// reported rather than silently broadcast.
pub fn add_assign(dst: &mut TensorData, src: &TensorData) -> Result<(), AutogradError> {
    if dst.shape != src.shape {
        return Err(AutogradError::GradientShapeMismatch {
            expected: dst.shape.clone(),
            actual: src.shape.clone(),
        });
    }
    match (dst.buffer_mut(), src.buffer()) {
        (CpuBuffer::F32(dst_data), CpuBuffer::F32(src_data)) => {
            add_slice(dst_data, src_data);
            Ok(())
        }
        (CpuBuffer::F64(dst_data), CpuBuffer::F64(src_data)) => {
            add_slice(dst_data, src_data);
            Ok(())
        }
        (dst_buf, src_buf) => Err(AutogradError::DataTypeMismatch {
            expected: dst_buf.dtype(),
            actual: src_buf.dtype(),
            operation: "add_assign".to_string(),
        }),
    }
}

fn fill_slice<T: NumCast + Copy>(data: &mut [T], value: f64) -> Result<(), AutogradError> {
    let typed: T = NumCast::from(value).ok_or_else(|| {
        AutogradError::Internal(format!("cannot represent constant {} in target dtype", value))
    })?;
    for elem in data.iter_mut() {
        *elem = typed;
    }
    Ok(())
}

fn add_slice<T: AddAssign + Copy>(dst: &mut [T], src: &[T]) {
    for (d, s) in dst.iter_mut().zip(src.iter()) {
        *d += *s;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{device_context_for, StorageDevice};
    use crate::types::DType;
    use approx::assert_relative_eq;

    #[test]
    fn test_set_constant_f32() {
        let ctx = device_context_for(StorageDevice::CPU).unwrap();
        let mut t = TensorData::zeros(vec![2, 2], DType::F32, StorageDevice::CPU);
        set_constant(&ctx, &mut t, 1.0).unwrap();
        assert_eq!(t.to_f32_vec().unwrap(), vec![1.0; 4]);
    }

    #[test]
    fn test_add_assign_matching_shapes() {
        let mut dst = TensorData::from_f32(vec![1.0, 2.0], vec![2]).unwrap();
        let src = TensorData::from_f32(vec![0.5, -1.0], vec![2]).unwrap();
        add_assign(&mut dst, &src).unwrap();
        let data = dst.to_f32_vec().unwrap();
        assert_relative_eq!(data[0], 1.5);
        assert_relative_eq!(data[1], 1.0);
    }

    #[test]
    fn test_add_assign_shape_mismatch() {
        let mut dst = TensorData::from_f32(vec![1.0, 2.0], vec![2]).unwrap();
        let src = TensorData::from_f32(vec![1.0], vec![1]).unwrap();
        let result = add_assign(&mut dst, &src);
        assert!(matches!(
            result,
            Err(AutogradError::GradientShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_add_assign_dtype_mismatch() {
        let mut dst = TensorData::from_f32(vec![1.0], vec![1]).unwrap();
        let src = TensorData::from_f64(vec![1.0], vec![1]).unwrap();
        let result = add_assign(&mut dst, &src);
        assert!(matches!(result, Err(AutogradError::DataTypeMismatch { .. })));
    }
}
