//! Compute context for the `tch` backend.
//!
//! Every tensor created inside the loss and the offset builder is allocated
//! on the context's device, so callers pick CPU or CUDA once and pass the
//! context down instead of reaching for a global device.

use tch::{Device, Kind};
use tracing::debug;

/// Device selection for tensor computations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComputeContext {
    device: Device,
}

impl ComputeContext {
    /// Context on an explicit device.
    pub fn new(device: Device) -> Self {
        ComputeContext { device }
    }

    /// CPU context.
    pub fn cpu() -> Self {
        Self::new(Device::Cpu)
    }

    /// First CUDA device when one is available, otherwise CPU.
    pub fn cuda_if_available() -> Self {
        let device = Device::cuda_if_available();
        debug!(?device, "selected compute device");
        Self::new(device)
    }

    /// The device tensors are placed on.
    pub fn device(&self) -> Device {
        self.device
    }

    /// `(Kind::Float, device)` options for tensor constructors.
    pub fn float_options(&self) -> (Kind, Device) {
        (Kind::Float, self.device)
    }
}

impl Default for ComputeContext {
    fn default() -> Self {
        Self::cpu()
    }
}
