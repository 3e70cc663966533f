use ash::vk;
use color_eyre::eyre::OptionExt;
use color_eyre::Result;
use crate::backend::vulkan::VulkanDriver;

/// Logical device with a single compute queue, enough to back a
/// [`VulkanDriver`] and to signal fences from an empty submission.
pub struct Device {
    pub logical: ash::Device,
    pub physical: vk::PhysicalDevice,
    pub compute_queue: vk::Queue,
    pub compute_queue_family: u32,
}

impl Device {
    pub fn new(instance: &ash::Instance) -> Result<Self> {
        let (physical_device, compute_queue_family) = Self::select_physical_device(instance)?;

        let queue_priorities = [1.0];
        let queue_create_infos = [
            vk::DeviceQueueCreateInfo::default()
                .queue_family_index(compute_queue_family)
                .queue_priorities(&queue_priorities),
        ];
        let device_create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos);

        let logical_device = unsafe {
            instance.create_device(physical_device, &device_create_info, None)?
        };
        let compute_queue = unsafe {
            logical_device.get_device_queue(compute_queue_family, 0)
        };

        log::debug!("Using compute queue family {}", compute_queue_family);

        Ok(Self {
            logical: logical_device,
            physical: physical_device,
            compute_queue,
            compute_queue_family,
        })
    }

    pub fn create_driver(&self, instance: &ash::Instance) -> Result<VulkanDriver> {
        VulkanDriver::new(instance.clone(), self.physical, self.logical.clone())
    }

    /// Submits an empty batch that signals `fence` once all prior work on the
    /// compute queue has completed.
    pub fn submit_signal(&self, fence: vk::Fence) -> Result<()> {
        unsafe {
            self.logical.queue_submit(self.compute_queue, &[], fence)?;
        }
        Ok(())
    }

    fn select_physical_device(instance: &ash::Instance) -> Result<(vk::PhysicalDevice, u32)> {
        unsafe {
            instance
                .enumerate_physical_devices()?
                .into_iter()
                .filter_map(|device| {
                    instance
                        .get_physical_device_queue_family_properties(device)
                        .iter()
                        .position(|q| q.queue_flags.contains(vk::QueueFlags::COMPUTE))
                        .map(|family| (device, family as u32))
                })
                .min_by_key(|(device, _)| {
                    match instance.get_physical_device_properties(*device).device_type {
                        vk::PhysicalDeviceType::DISCRETE_GPU => 0,
                        vk::PhysicalDeviceType::INTEGRATED_GPU => 1,
                        _ => 2,
                    }
                })
                .ok_or_eyre("No suitable physical device found")
        }
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = self.logical.device_wait_idle() {
                log::warn!("Failed to wait for device idle: {}", e);
            }
            self.logical.destroy_device(None);
        }
    }
}
