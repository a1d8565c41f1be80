use crate::device::StorageDevice;
use crate::types::DType;
use thiserror::Error;

/// Custom error type for the retrograd engine.
///
/// Every failure raised during a backward pass is fatal to the current
/// `execute` call; the engine resets itself via `clear()` so a failed pass
/// never leaves half-applied dependency or accumulator state behind.
#[derive(Error, Debug, PartialEq, Clone)] // PartialEq for easier testing
pub enum AutogradError {
    #[error(
        "Variable '{var}' is trying to backward through the same graph a second time, \
         but this graph has already been freed. Specify retain_graph=true when calling \
         backward the first time."
    )]
    AlreadyConsumed { var: String },

    #[error("{registry} must be empty when preparing backward dependencies")]
    AlreadyInitialized { registry: String },

    #[error("Grad variable does not exist for variable '{var}'")]
    MissingGradSlot { var: String },

    #[error("Grad pending node is gone or null ({context})")]
    MissingNode { context: String },

    #[error("Cannot find gradient accumulator of variable '{var}'")]
    MissingAccumulator { var: String },

    #[error("Only a leaf variable's gradient can carry backward hooks, but '{var}' has a producer node")]
    HookOnNonLeaf { var: String },

    #[error(
        "Tensor '{var}' used in gradient computation of grad op '{op_type}' has been \
         modified by an inplace operation. Its version is {observed} but the expected \
         version is {expected}. Avoid calling an inplace operator on a tensor that is \
         required live for backward."
    )]
    InplaceTampering {
        var: String,
        op_type: String,
        observed: u32,
        expected: u32,
    },

    #[error("Backward kernel of grad op '{op_type}' failed: {message}")]
    KernelFailure { op_type: String, message: String },

    #[error("Data type mismatch: expected {expected:?}, got {actual:?}, operation: {operation}")]
    DataTypeMismatch {
        expected: DType,
        actual: DType,
        operation: String,
    },

    #[error("Shape mismatch during gradient accumulation: expected {expected:?}, got {actual:?}")]
    GradientShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("Device {device:?} is not supported by operation '{operation}'")]
    DeviceUnsupported {
        device: StorageDevice,
        operation: String,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}
