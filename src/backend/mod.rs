//! Native device access.
//!
//! [`Driver`] is the seam between the resource layer and Vulkan. Production
//! code uses [`VulkanDriver`]; the headless [`GpuContext`] stands in for the
//! surrounding application that owns the instance and device.

pub mod device;
pub mod driver;
pub mod instance;
pub mod vulkan;

#[cfg(test)]
pub(crate) mod mock;

pub use driver::{DeviceHandles, Driver, RawAllocation, RawAllocationDesc};
pub use vulkan::VulkanDriver;

use color_eyre::Result;
use crate::backend::device::Device;
use crate::backend::instance::Instance;
use crate::config::BootstrapConfig;

/// Instance plus device for running without a window.
///
/// Any [`VulkanDriver`] created from the context must be dropped before it.
pub struct GpuContext {
    // Declared first so the device is destroyed before the instance.
    pub device: Device,
    pub instance: Instance,
}

impl GpuContext {
    pub fn new(config: &BootstrapConfig) -> Result<Self> {
        let instance = Instance::new(config)?;
        let device = instance.create_device()?;
        Ok(Self { device, instance })
    }

    pub fn create_driver(&self) -> Result<VulkanDriver> {
        self.device.create_driver(&self.instance.instance)
    }
}
