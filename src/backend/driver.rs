use std::ptr::NonNull;
use ash::vk;
use color_eyre::Result;

/// Raw identities of the GPU context the layer was handed at construction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceHandles {
    pub instance: vk::Instance,
    pub physical_device: vk::PhysicalDevice,
    pub device: vk::Device,
}

impl DeviceHandles {
    pub fn is_complete(&self) -> bool {
        self.instance != vk::Instance::null()
            && self.physical_device != vk::PhysicalDevice::null()
            && self.device != vk::Device::null()
    }
}

/// A block of device memory handed out by the driver's native allocator.
///
/// This is a plain description; the driver keeps whatever bookkeeping it
/// needs keyed by `id` until the allocation is returned through
/// [`Driver::free_memory`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RawAllocation {
    pub id: u64,
    pub memory: vk::DeviceMemory,
    pub offset: vk::DeviceSize,
    pub size: vk::DeviceSize,
    pub memory_type_index: u32,
}

pub struct RawAllocationDesc<'a> {
    pub name: &'a str,
    pub size: vk::DeviceSize,
    pub alignment: vk::DeviceSize,
    pub memory_type_index: u32,
    pub linear: bool,
}

/// The native device surface the resource layer is built on.
///
/// Every handle passed back in must have been produced by the same driver.
/// Destroy calls accept null handles and ignore them.
pub trait Driver: Send + Sync {
    fn handles(&self) -> DeviceHandles;
    fn memory_properties(&self) -> vk::PhysicalDeviceMemoryProperties;

    fn create_buffer(&self, info: &vk::BufferCreateInfo<'_>) -> Result<vk::Buffer>;
    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements;
    fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> Result<()>;
    fn destroy_buffer(&self, buffer: vk::Buffer);

    fn create_image(&self, info: &vk::ImageCreateInfo<'_>) -> Result<vk::Image>;
    fn image_memory_requirements(&self, image: vk::Image) -> vk::MemoryRequirements;
    fn bind_image_memory(
        &self,
        image: vk::Image,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> Result<()>;
    fn destroy_image(&self, image: vk::Image);

    fn create_image_view(&self, info: &vk::ImageViewCreateInfo<'_>) -> Result<vk::ImageView>;
    fn destroy_image_view(&self, view: vk::ImageView);

    fn create_sampler(&self, info: &vk::SamplerCreateInfo<'_>) -> Result<vk::Sampler>;
    fn destroy_sampler(&self, sampler: vk::Sampler);

    fn create_fence(&self, info: &vk::FenceCreateInfo<'_>) -> Result<vk::Fence>;
    /// Blocks until every fence is signaled. Running out of time is an error.
    fn wait_for_fences(&self, fences: &[vk::Fence], timeout_ns: u64) -> Result<()>;
    fn reset_fences(&self, fences: &[vk::Fence]) -> Result<()>;
    fn destroy_fence(&self, fence: vk::Fence);

    fn allocate_memory(&self, desc: &RawAllocationDesc<'_>) -> Result<RawAllocation>;
    fn free_memory(&self, allocation: RawAllocation) -> Result<()>;

    /// Returns the host address of the first byte of `allocation`.
    fn map_memory(&self, allocation: &RawAllocation) -> Result<NonNull<u8>>;
    fn unmap_memory(&self, allocation: &RawAllocation);

    /// Makes host writes in the range visible to the device. Ignored for
    /// host-coherent memory.
    fn flush_memory(
        &self,
        allocation: &RawAllocation,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> Result<()>;

    /// Makes device writes in the range visible to the host. Ignored for
    /// host-coherent memory.
    fn invalidate_memory(
        &self,
        allocation: &RawAllocation,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> Result<()>;
}
