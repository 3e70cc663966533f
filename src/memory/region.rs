use std::fmt;
use std::sync::Arc;
use ash::vk;
use color_eyre::Result;
use crate::backend::RawAllocation;
use crate::internals::block::BlockRegion;
use crate::memory::allocator::{MemoryAllocator, PoolId};
use crate::memory::map::{MemoryAccess, MemoryMap};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocationSource {
    Dedicated,
    Pool(PoolId),
}

/// A claim on device memory: either a whole dedicated allocation or a
/// range carved out of a pool block.
#[derive(Debug)]
pub struct Allocation {
    raw: RawAllocation,
    offset: vk::DeviceSize,
    size: vk::DeviceSize,
    source: AllocationSource,
}

impl Allocation {
    pub(crate) fn dedicated(raw: RawAllocation) -> Self {
        Self {
            raw,
            offset: 0,
            size: raw.size,
            source: AllocationSource::Dedicated,
        }
    }

    pub(crate) fn pooled(pool: PoolId, block: RawAllocation, region: BlockRegion) -> Self {
        Self {
            raw: block,
            offset: region.offset,
            size: region.size,
            source: AllocationSource::Pool(pool),
        }
    }

    /// The native allocation backing this claim (the whole block when pooled).
    pub fn raw(&self) -> &RawAllocation {
        &self.raw
    }

    pub fn memory(&self) -> vk::DeviceMemory {
        self.raw.memory
    }

    /// Offset of this claim inside [`Self::raw`].
    pub fn offset(&self) -> vk::DeviceSize {
        self.offset
    }

    /// Offset inside the `vk::DeviceMemory` object, as passed to bind calls.
    pub fn bind_offset(&self) -> vk::DeviceSize {
        self.raw.offset + self.offset
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    pub fn memory_type_index(&self) -> u32 {
        self.raw.memory_type_index
    }

    pub fn source(&self) -> AllocationSource {
        self.source
    }

    pub(crate) fn block_region(&self) -> BlockRegion {
        BlockRegion {
            offset: self.offset,
            size: self.size,
        }
    }
}

/// Exclusive ownership of one [`Allocation`]. Dropping the region hands the
/// memory back to the allocator it came from.
pub struct MemoryRegion {
    allocator: Arc<MemoryAllocator>,
    allocation: Allocation,
}

impl MemoryRegion {
    pub(crate) fn new(allocator: Arc<MemoryAllocator>, allocation: Allocation) -> Self {
        Self {
            allocator,
            allocation,
        }
    }

    pub fn allocator(&self) -> &Arc<MemoryAllocator> {
        &self.allocator
    }

    pub fn allocation(&self) -> &Allocation {
        &self.allocation
    }

    pub fn map(&mut self, access: MemoryAccess) -> Result<MemoryMap<'_>> {
        MemoryMap::new(self, access)
    }
}

impl fmt::Debug for MemoryRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryRegion")
            .field("allocation", &self.allocation)
            .finish_non_exhaustive()
    }
}

impl Drop for MemoryRegion {
    fn drop(&mut self) {
        if let Err(e) = self.allocator.free(&self.allocation) {
            log::warn!("Failed to release memory region: {:?}", e);
        }
    }
}
