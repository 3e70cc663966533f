use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use ash::vk;
use color_eyre::Result;
use color_eyre::eyre::{OptionExt, WrapErr, eyre};
use gpu_allocator::{
    vulkan::{Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc},
    MemoryLocation,
};
use crate::backend::driver::{DeviceHandles, Driver, RawAllocation, RawAllocationDesc};

/// [`Driver`] backed by `ash` for object calls and `gpu-allocator` for memory.
///
/// The instance and device are borrowed identities: they must outlive this
/// driver, and the driver never destroys them.
pub struct VulkanDriver {
    instance: ash::Instance,
    physical_device: vk::PhysicalDevice,
    device: ash::Device,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    non_coherent_atom_size: vk::DeviceSize,

    memory_allocator: Mutex<Allocator>,
    allocations: Mutex<HashMap<u64, Allocation>>,
    next_allocation_id: AtomicU64,
}

impl VulkanDriver {
    pub fn new(
        instance: ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: ash::Device,
    ) -> Result<Self> {
        debug_assert!(instance.handle() != vk::Instance::null(), "Invalid Vulkan instance!");
        debug_assert!(physical_device != vk::PhysicalDevice::null(), "Invalid Vulkan physical device!");
        debug_assert!(device.handle() != vk::Device::null(), "Invalid Vulkan device!");

        let (memory_properties, non_coherent_atom_size) = unsafe {
            (
                instance.get_physical_device_memory_properties(physical_device),
                instance
                    .get_physical_device_properties(physical_device)
                    .limits
                    .non_coherent_atom_size,
            )
        };

        let memory_allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: gpu_allocator::AllocatorDebugSettings {
                log_memory_information: cfg!(debug_assertions),
                log_leaks_on_shutdown: true,
                store_stack_traces: false,
                log_allocations: false,
                log_frees: false,
                log_stack_traces: false,
            },
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .wrap_err("Failed to create memory allocator")?;

        Ok(Self {
            instance,
            physical_device,
            device,
            memory_properties,
            non_coherent_atom_size: non_coherent_atom_size.max(1),

            memory_allocator: Mutex::new(memory_allocator),
            allocations: Mutex::new(HashMap::new()),
            next_allocation_id: AtomicU64::new(1),
        })
    }

    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    fn is_coherent(&self, memory_type_index: u32) -> bool {
        self.memory_properties.memory_types[memory_type_index as usize]
            .property_flags
            .contains(vk::MemoryPropertyFlags::HOST_COHERENT)
    }

    /// Builds a range the driver accepts for flush/invalidate: the start is
    /// aligned down to `nonCoherentAtomSize` and the range runs to the end of
    /// the mapping, which `gpu-allocator` keeps persistently mapped per block.
    fn mapped_range(
        &self,
        allocation: &RawAllocation,
        offset: vk::DeviceSize,
    ) -> vk::MappedMemoryRange<'static> {
        let atom = self.non_coherent_atom_size;
        let start = (allocation.offset + offset) & !(atom - 1);
        vk::MappedMemoryRange::default()
            .memory(allocation.memory)
            .offset(start)
            .size(vk::WHOLE_SIZE)
    }
}

impl Driver for VulkanDriver {
    fn handles(&self) -> DeviceHandles {
        DeviceHandles {
            instance: self.instance.handle(),
            physical_device: self.physical_device,
            device: self.device.handle(),
        }
    }

    fn memory_properties(&self) -> vk::PhysicalDeviceMemoryProperties {
        self.memory_properties
    }

    fn create_buffer(&self, info: &vk::BufferCreateInfo<'_>) -> Result<vk::Buffer> {
        Ok(unsafe { self.device.create_buffer(info, None)? })
    }

    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements {
        unsafe { self.device.get_buffer_memory_requirements(buffer) }
    }

    fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> Result<()> {
        Ok(unsafe { self.device.bind_buffer_memory(buffer, memory, offset)? })
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        unsafe { self.device.destroy_buffer(buffer, None) }
    }

    fn create_image(&self, info: &vk::ImageCreateInfo<'_>) -> Result<vk::Image> {
        Ok(unsafe { self.device.create_image(info, None)? })
    }

    fn image_memory_requirements(&self, image: vk::Image) -> vk::MemoryRequirements {
        unsafe { self.device.get_image_memory_requirements(image) }
    }

    fn bind_image_memory(
        &self,
        image: vk::Image,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> Result<()> {
        Ok(unsafe { self.device.bind_image_memory(image, memory, offset)? })
    }

    fn destroy_image(&self, image: vk::Image) {
        unsafe { self.device.destroy_image(image, None) }
    }

    fn create_image_view(&self, info: &vk::ImageViewCreateInfo<'_>) -> Result<vk::ImageView> {
        Ok(unsafe { self.device.create_image_view(info, None)? })
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        unsafe { self.device.destroy_image_view(view, None) }
    }

    fn create_sampler(&self, info: &vk::SamplerCreateInfo<'_>) -> Result<vk::Sampler> {
        Ok(unsafe { self.device.create_sampler(info, None)? })
    }

    fn destroy_sampler(&self, sampler: vk::Sampler) {
        unsafe { self.device.destroy_sampler(sampler, None) }
    }

    fn create_fence(&self, info: &vk::FenceCreateInfo<'_>) -> Result<vk::Fence> {
        Ok(unsafe { self.device.create_fence(info, None)? })
    }

    fn wait_for_fences(&self, fences: &[vk::Fence], timeout_ns: u64) -> Result<()> {
        unsafe { self.device.wait_for_fences(fences, true, timeout_ns) }
            .wrap_err_with(|| format!("Failed to wait for {} fence(s)", fences.len()))
    }

    fn reset_fences(&self, fences: &[vk::Fence]) -> Result<()> {
        Ok(unsafe { self.device.reset_fences(fences)? })
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.device.destroy_fence(fence, None) }
    }

    fn allocate_memory(&self, desc: &RawAllocationDesc<'_>) -> Result<RawAllocation> {
        // The memory type is resolved by the caller; restricting the type bits
        // to that single index pins gpu-allocator to it.
        let requirements = vk::MemoryRequirements {
            size: desc.size,
            alignment: desc.alignment,
            memory_type_bits: 1 << desc.memory_type_index,
        };

        let allocation = self.memory_allocator
            .lock()
            .map_err(|e| eyre!(e.to_string()))?
            .allocate(&AllocationCreateDesc {
                name: desc.name,
                requirements,
                location: MemoryLocation::Unknown,
                linear: desc.linear,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .wrap_err_with(|| format!(
                "Failed to allocate {} bytes from memory type {}",
                desc.size,
                desc.memory_type_index,
            ))?;

        let raw = RawAllocation {
            id: self.next_allocation_id.fetch_add(1, Ordering::Relaxed),
            memory: unsafe { allocation.memory() },
            offset: allocation.offset(),
            size: allocation.size(),
            memory_type_index: desc.memory_type_index,
        };

        self.allocations
            .lock()
            .map_err(|e| eyre!(e.to_string()))?
            .insert(raw.id, allocation);

        Ok(raw)
    }

    fn free_memory(&self, allocation: RawAllocation) -> Result<()> {
        let allocation = self.allocations
            .lock()
            .map_err(|e| eyre!(e.to_string()))?
            .remove(&allocation.id)
            .ok_or_else(|| eyre!("Unknown allocation {}", allocation.id))?;

        self.memory_allocator
            .lock()
            .map_err(|e| eyre!(e.to_string()))?
            .free(allocation)?;

        Ok(())
    }

    fn map_memory(&self, allocation: &RawAllocation) -> Result<NonNull<u8>> {
        self.allocations
            .lock()
            .map_err(|e| eyre!(e.to_string()))?
            .get(&allocation.id)
            .ok_or_else(|| eyre!("Unknown allocation {}", allocation.id))?
            .mapped_ptr()
            .map(|ptr| ptr.cast::<u8>())
            .ok_or_eyre("Allocation is not host visible")
    }

    fn unmap_memory(&self, _allocation: &RawAllocation) {
        // gpu-allocator keeps host-visible blocks mapped for their lifetime.
    }

    fn flush_memory(
        &self,
        allocation: &RawAllocation,
        offset: vk::DeviceSize,
        _size: vk::DeviceSize,
    ) -> Result<()> {
        if self.is_coherent(allocation.memory_type_index) {
            return Ok(());
        }
        let range = self.mapped_range(allocation, offset);
        Ok(unsafe { self.device.flush_mapped_memory_ranges(&[range])? })
    }

    fn invalidate_memory(
        &self,
        allocation: &RawAllocation,
        offset: vk::DeviceSize,
        _size: vk::DeviceSize,
    ) -> Result<()> {
        if self.is_coherent(allocation.memory_type_index) {
            return Ok(());
        }
        let range = self.mapped_range(allocation, offset);
        Ok(unsafe { self.device.invalidate_mapped_memory_ranges(&[range])? })
    }
}

impl Drop for VulkanDriver {
    fn drop(&mut self) {
        let leaked = match self.allocations.get_mut() {
            Ok(allocations) => allocations.drain().map(|(_, a)| a).collect::<Vec<_>>(),
            Err(_) => return,
        };
        if leaked.is_empty() {
            return;
        }

        log::warn!("Releasing {} allocation(s) still held at driver shutdown", leaked.len());
        if let Ok(allocator) = self.memory_allocator.get_mut() {
            for allocation in leaked {
                if let Err(e) = allocator.free(allocation) {
                    log::error!("Failed to free allocation: {}", e);
                }
            }
        }
    }
}
