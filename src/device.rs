use crate::error::AutogradError;
use std::fmt::Debug;

/// Represents the physical location where tensor data is stored.
///
/// Backward operators carry a placement so the engine can request the
/// matching device context before dispatching them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[derive(Default)]
pub enum StorageDevice {
    /// Data is stored in main system memory (RAM).
    /// This is the default device.
    #[default]
    CPU,
    /// Data is stored on a CUDA-enabled NVIDIA GPU.
    ///
    /// **Note:** GPU support is planned for future phases; requesting a
    /// context for it currently fails with `DeviceUnsupported`.
    /// TODO: Add device ID/index when multiple GPUs are supported.
    GPU,
}

/// Opaque execution context handed to kernels and to `set_constant`.
///
/// On CPU this carries no state beyond the placement itself; it exists so
/// that kernel signatures stay stable once real device queues are added.
#[derive(Debug, Clone, Copy)]
pub struct DeviceContext {
    place: StorageDevice,
}

impl DeviceContext {
    /// The placement this context executes on.
    pub fn place(&self) -> StorageDevice {
        self.place
    }
}

/// Returns the execution context for a placement.
///
/// Mirrors a per-process context pool: contexts are cheap value types here,
/// so the lookup simply validates the placement.
pub fn device_context_for(place: StorageDevice) -> Result<DeviceContext, AutogradError> {
    match place {
        StorageDevice::CPU => Ok(DeviceContext { place }),
        StorageDevice::GPU => Err(AutogradError::DeviceUnsupported {
            device: place,
            operation: "device_context_for".to_string(),
        }),
    }
}
