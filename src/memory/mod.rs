//! Device memory: type selection, dedicated and pooled allocations, and
//! scoped host mappings.

mod allocator;
mod map;
mod policy;
mod region;

pub use allocator::{
    AllocationRequest, AllocatorStats, IMAGE_FORMAT_FP, MemoryAllocator, MemoryProperties, PoolCreateInfo, PoolId,
};
pub use map::{MemoryAccess, MemoryMap};
pub use policy::{AllocationPolicy, BlockPoolPolicy};
pub use region::{Allocation, AllocationSource, MemoryRegion};
