// Core modules of the crate
pub mod autograd;
pub mod buffer;
pub mod config;
pub mod device;
pub mod error;
pub mod math;
pub mod tensor_data;
pub mod types;
pub mod variable;

pub mod utils;

// Re-export the main surface so callers can reach it directly via
// `retrograd::Engine` / `retrograd::Variable`.
pub use autograd::Engine;
pub use error::AutogradError;
pub use tensor_data::TensorData;
pub use variable::{BackwardHook, Variable};
