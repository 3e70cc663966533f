use std::sync::Arc;
use ash::vk;
use color_eyre::eyre::{Result, WrapErr};
use crate::backend::Driver;
use crate::memory::{AllocationPolicy, AllocationRequest, MemoryAccess, MemoryAllocator, MemoryMap, MemoryProperties, MemoryRegion};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferDescriptor {
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
    pub memory: MemoryProperties,
}

/// A native buffer and the memory bound to it. Both are released together
/// when the buffer is dropped.
#[derive(Debug)]
pub struct Buffer {
    handle: vk::Buffer,
    offset: vk::DeviceSize,
    range: vk::DeviceSize,
    size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
    memory: MemoryRegion,
}

impl Buffer {
    pub fn new(
        allocator: &Arc<MemoryAllocator>,
        descriptor: &BufferDescriptor,
        policy: Option<&mut (dyn AllocationPolicy + 'static)>,
    ) -> Result<Self> {
        let driver = allocator.driver();
        let info = vk::BufferCreateInfo::default()
            .size(descriptor.size)
            .usage(descriptor.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let handle = driver
            .create_buffer(&info)
            .wrap_err_with(|| format!("Failed to create buffer of {} bytes", descriptor.size))?;

        let memory = match Self::bind_memory(allocator, driver.as_ref(), handle, descriptor, policy) {
            Ok(memory) => memory,
            Err(e) => {
                driver.destroy_buffer(handle);
                return Err(e);
            }
        };
        log::trace!("Created buffer {:?} ({} bytes, {:?})", handle, descriptor.size, descriptor.usage);

        Ok(Self {
            handle,
            offset: 0,
            range: descriptor.size,
            size: descriptor.size,
            usage: descriptor.usage,
            memory,
        })
    }

    fn bind_memory(
        allocator: &Arc<MemoryAllocator>,
        driver: &dyn Driver,
        handle: vk::Buffer,
        descriptor: &BufferDescriptor,
        policy: Option<&mut (dyn AllocationPolicy + 'static)>,
    ) -> Result<MemoryRegion> {
        let requirements = driver.buffer_memory_requirements(handle);
        let mut request = AllocationRequest::new(descriptor.memory, true);
        if let Some(policy) = policy {
            policy.enact(allocator, &requirements, &mut request)?;
        }

        let memory = allocator
            .allocate(&requirements, &request)
            .wrap_err("Failed to allocate buffer memory")?;
        let allocation = memory.allocation();
        driver.bind_buffer_memory(handle, allocation.memory(), allocation.bind_offset())?;
        Ok(memory)
    }

    pub fn handle(&self) -> vk::Buffer {
        self.handle
    }

    pub fn offset(&self) -> vk::DeviceSize {
        self.offset
    }

    pub fn range(&self) -> vk::DeviceSize {
        self.range
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    pub fn usage(&self) -> vk::BufferUsageFlags {
        self.usage
    }

    pub fn memory(&self) -> &MemoryRegion {
        &self.memory
    }

    /// Opens a host map over the buffer's memory. One map at a time.
    pub fn map(&mut self, access: MemoryAccess) -> Result<MemoryMap<'_>> {
        self.memory.map(access)
    }

    pub fn descriptor_info(&self) -> vk::DescriptorBufferInfo {
        vk::DescriptorBufferInfo {
            buffer: self.handle,
            offset: self.offset,
            range: self.range,
        }
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        // Memory is released by the region right after this.
        log::trace!("Destroying buffer {:?}", self.handle);
        self.memory.allocator().driver().destroy_buffer(self.handle);
    }
}
