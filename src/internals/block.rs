use ash::vk;
use color_eyre::Result;
use color_eyre::eyre::eyre;
use crate::backend::{Driver, RawAllocation, RawAllocationDesc};
use crate::memory::PoolCreateInfo;

const BLOCK_ALIGNMENT: vk::DeviceSize = 256;

#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub struct BlockRegion {
    pub offset: u64,
    pub size: u64,
}

/// First-fit free list over one block. Offsets are relative to the block;
/// alignment is applied to `base + offset` so the bound address is aligned.
pub struct FreeList {
    base: u64,
    capacity: u64,
    free_regions: Vec<BlockRegion>,
}

impl FreeList {
    pub fn new(base: u64, capacity: u64) -> Self {
        Self {
            base,
            capacity,
            free_regions: vec![BlockRegion {
                offset: 0,
                size: capacity,
            }],
        }
    }

    pub fn allocate(&mut self, size: u64, alignment: u64) -> Option<BlockRegion> {
        let alignment = alignment.max(1);
        let aligned_start = |region: &BlockRegion| {
            let absolute = self.base + region.offset;
            ((absolute + alignment - 1) & !(alignment - 1)) - self.base
        };

        let (i, start) = self.free_regions
            .iter()
            .enumerate()
            .map(|(i, region)| (i, aligned_start(region)))
            .find(|(i, start)| {
                let region = &self.free_regions[*i];
                start + size <= region.offset + region.size
            })?;

        let region = self.free_regions.remove(i);
        let head = BlockRegion {
            offset: region.offset,
            size: start - region.offset,
        };
        let tail = BlockRegion {
            offset: start + size,
            size: region.offset + region.size - (start + size),
        };

        // Padding in front of the aligned start stays free.
        if tail.size > 0 {
            self.free_regions.insert(i, tail);
        }
        if head.size > 0 {
            self.free_regions.insert(i, head);
        }

        Some(BlockRegion {
            offset: start,
            size,
        })
    }

    pub fn deallocate(&mut self, region: BlockRegion) {
        let mut left_index = None; // Some if there is a free region to the left of the deallocated region
        let mut right_index = None; // Some if there is a free region to the right of the deallocated region

        for (i, free_region) in self.free_regions.iter().enumerate() {
            if free_region.offset + free_region.size == region.offset {
                left_index = Some(i);
            } else if region.offset + region.size == free_region.offset {
                right_index = Some(i);
            }
        }

        match (left_index, right_index) {
            (Some(left), Some(right)) => {
                self.free_regions[left].size += region.size + self.free_regions[right].size;
                self.free_regions.remove(right);
            }
            (Some(left), None) => {
                self.free_regions[left].size += region.size;
            }
            (None, Some(right)) => {
                self.free_regions[right].offset = region.offset;
                self.free_regions[right].size += region.size;
            }
            (None, None) => {
                self.free_regions.push(region);
                self.free_regions.sort_by_key(|r| r.offset);
            }
        }
    }

    pub fn is_unused(&self) -> bool {
        self.free_bytes() == self.capacity
    }

    pub fn free_bytes(&self) -> u64 {
        self.free_regions.iter().map(|r| r.size).sum()
    }
}

pub struct MemoryBlock {
    pub raw: RawAllocation,
    free_list: FreeList,
}

/// A set of equally sized blocks of one memory type that sub-allocates
/// requests linearly, growing up to `max_block_count` blocks.
pub struct MemoryPool {
    info: PoolCreateInfo,
    blocks: Vec<MemoryBlock>,
}

impl MemoryPool {
    pub fn new(info: PoolCreateInfo, driver: &dyn Driver) -> Result<Self> {
        let mut pool = Self {
            info,
            blocks: Vec::with_capacity(info.min_block_count as usize),
        };
        for _ in 0..info.min_block_count {
            let grown = pool.grow(driver).map(|_| ());
            if let Err(e) = grown {
                pool.release(driver);
                return Err(e);
            }
        }
        Ok(pool)
    }

    pub fn info(&self) -> &PoolCreateInfo {
        &self.info
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn allocate(
        &mut self,
        driver: &dyn Driver,
        requirements: &vk::MemoryRequirements,
    ) -> Result<(RawAllocation, BlockRegion)> {
        if requirements.memory_type_bits & (1 << self.info.memory_type_index) == 0 {
            return Err(eyre!(
                "Memory type {} is not allowed by the resource's requirements ({:#b})",
                self.info.memory_type_index,
                requirements.memory_type_bits,
            ));
        }
        if requirements.size > self.info.block_size {
            return Err(eyre!(
                "Request of {} bytes exceeds the pool block size of {} bytes",
                requirements.size,
                self.info.block_size,
            ));
        }

        for block in self.blocks.iter_mut() {
            if let Some(region) = block.free_list.allocate(requirements.size, requirements.alignment) {
                return Ok((block.raw, region));
            }
        }

        let max = self.info.max_block_count as usize;
        if max != 0 && self.blocks.len() >= max {
            return Err(eyre!(
                "Memory pool for type {} is exhausted ({} blocks)",
                self.info.memory_type_index,
                self.blocks.len(),
            ));
        }

        let block = self.grow(driver)?;
        block
            .free_list
            .allocate(requirements.size, requirements.alignment)
            .map(|region| (block.raw, region))
            .ok_or_else(|| eyre!("Fresh pool block cannot satisfy alignment {}", requirements.alignment))
    }

    pub fn free(&mut self, driver: &dyn Driver, block_id: u64, region: BlockRegion) -> Result<()> {
        let index = self.blocks
            .iter()
            .position(|block| block.raw.id == block_id)
            .ok_or_else(|| eyre!("Unknown pool block {}", block_id))?;

        self.blocks[index].free_list.deallocate(region);

        if self.blocks[index].free_list.is_unused()
            && self.blocks.len() > self.info.min_block_count as usize
        {
            let block = self.blocks.remove(index);
            log::trace!("Releasing empty block {} of memory type {}", block.raw.id, self.info.memory_type_index);
            driver.free_memory(block.raw)?;
        }

        Ok(())
    }

    pub fn release(&mut self, driver: &dyn Driver) {
        for block in self.blocks.drain(..) {
            if !block.free_list.is_unused() {
                log::warn!("Releasing pool block {} with live sub-allocations", block.raw.id);
            }
            if let Err(e) = driver.free_memory(block.raw) {
                log::error!("Failed to free pool block: {}", e);
            }
        }
    }

    fn grow(&mut self, driver: &dyn Driver) -> Result<&mut MemoryBlock> {
        let raw = driver.allocate_memory(&RawAllocationDesc {
            name: "memory pool block",
            size: self.info.block_size,
            alignment: BLOCK_ALIGNMENT,
            memory_type_index: self.info.memory_type_index,
            linear: self.info.linear,
        })?;
        log::debug!(
            "Memory pool for type {} grew to {} block(s) of {} bytes",
            self.info.memory_type_index,
            self.blocks.len() + 1,
            self.info.block_size,
        );

        self.blocks.push(MemoryBlock {
            raw,
            free_list: FreeList::new(raw.offset, raw.size.min(self.info.block_size)),
        });
        let last = self.blocks.len() - 1;
        Ok(&mut self.blocks[last])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::{MockDriver, DEVICE_LOCAL_TYPE};

    fn requirements(size: u64, alignment: u64) -> vk::MemoryRequirements {
        vk::MemoryRequirements {
            size,
            alignment,
            memory_type_bits: !0,
        }
    }

    fn pool_info(min_block_count: u32, max_block_count: u32) -> PoolCreateInfo {
        PoolCreateInfo {
            memory_type_index: DEVICE_LOCAL_TYPE,
            block_size: 4096,
            min_block_count,
            max_block_count,
            linear: true,
        }
    }

    #[test]
    fn free_list_respects_alignment_and_keeps_padding() {
        let mut list = FreeList::new(0, 1024);
        let a = list.allocate(100, 1).unwrap();
        let b = list.allocate(64, 256).unwrap();

        assert_eq!(a, BlockRegion { offset: 0, size: 100 });
        assert_eq!(b, BlockRegion { offset: 256, size: 64 });
        // The gap between 100 and 256 is still usable.
        assert_eq!(list.allocate(128, 4).unwrap().offset, 100);
        assert_eq!(list.free_bytes(), 1024 - 100 - 64 - 128);
    }

    #[test]
    fn free_list_aligns_against_block_base() {
        let mut list = FreeList::new(64, 1024);
        let region = list.allocate(16, 256).unwrap();
        assert_eq!((64 + region.offset) % 256, 0);
    }

    #[test]
    fn free_list_merges_neighbours_on_release() {
        let mut list = FreeList::new(0, 300);
        let a = list.allocate(100, 1).unwrap();
        let b = list.allocate(100, 1).unwrap();
        let c = list.allocate(100, 1).unwrap();
        assert!(list.allocate(1, 1).is_none());

        list.deallocate(a);
        list.deallocate(c);
        list.deallocate(b);

        assert!(list.is_unused());
        assert_eq!(list.allocate(300, 1).unwrap().offset, 0);
    }

    #[test]
    fn pool_preallocates_min_blocks_and_grows_on_demand() {
        let driver = MockDriver::new();
        let mut pool = MemoryPool::new(pool_info(1, 0), driver.as_ref()).unwrap();
        assert_eq!(pool.block_count(), 1);
        assert_eq!(driver.calls().allocations, 1);

        let (first, _) = pool.allocate(driver.as_ref(), &requirements(3000, 256)).unwrap();
        let (second, _) = pool.allocate(driver.as_ref(), &requirements(3000, 256)).unwrap();

        assert_ne!(first.id, second.id);
        assert_eq!(pool.block_count(), 2);
        pool.release(driver.as_ref());
        assert_eq!(driver.live_allocations(), 0);
    }

    #[test]
    fn pool_respects_max_block_count() {
        let driver = MockDriver::new();
        let mut pool = MemoryPool::new(pool_info(0, 1), driver.as_ref()).unwrap();

        pool.allocate(driver.as_ref(), &requirements(4096, 256)).unwrap();
        let err = pool.allocate(driver.as_ref(), &requirements(256, 256)).unwrap_err();
        assert!(err.to_string().contains("exhausted"));
        pool.release(driver.as_ref());
    }

    #[test]
    fn pool_rejects_oversized_requests() {
        let driver = MockDriver::new();
        let mut pool = MemoryPool::new(pool_info(0, 0), driver.as_ref()).unwrap();
        assert!(pool.allocate(driver.as_ref(), &requirements(8192, 256)).is_err());
        assert_eq!(driver.calls().allocations, 0);
    }

    #[test]
    fn pool_releases_empty_blocks_above_minimum() {
        let driver = MockDriver::new();
        let mut pool = MemoryPool::new(pool_info(1, 0), driver.as_ref()).unwrap();

        let (a_block, a) = pool.allocate(driver.as_ref(), &requirements(4096, 256)).unwrap();
        let (b_block, b) = pool.allocate(driver.as_ref(), &requirements(4096, 256)).unwrap();
        assert_eq!(pool.block_count(), 2);

        pool.free(driver.as_ref(), b_block.id, b).unwrap();
        assert_eq!(pool.block_count(), 1);
        pool.free(driver.as_ref(), a_block.id, a).unwrap();
        assert_eq!(pool.block_count(), 1, "minimum block count is kept");
        pool.release(driver.as_ref());
    }
}
