use ash::vk;
use color_eyre::Result;
use crate::config::BlockPoolConfig;
use crate::memory::allocator::{AllocationRequest, MemoryAllocator, PoolCreateInfo, PoolId};

/// Hook run between querying a resource's memory requirements and allocating
/// its memory. Implementations may rewrite the request, typically to route it
/// into a pool.
pub trait AllocationPolicy: Send {
    fn enact(
        &mut self,
        allocator: &MemoryAllocator,
        requirements: &vk::MemoryRequirements,
        request: &mut AllocationRequest,
    ) -> Result<()>;
}

/// Routes every request into a block pool for its memory type and tiling,
/// creating the pool the first time that pair is seen.
#[derive(Debug)]
pub struct BlockPoolPolicy {
    config: BlockPoolConfig,
    pools: Vec<PoolSlot>,
}

#[derive(Debug)]
struct PoolSlot {
    memory_type_index: u32,
    linear: bool,
    pool: PoolId,
}

impl BlockPoolPolicy {
    const RESERVE: usize = 16;

    pub fn new(config: BlockPoolConfig) -> Self {
        Self {
            config,
            pools: Vec::with_capacity(Self::RESERVE),
        }
    }

    /// Shorthand for a boxed policy ready to hand to a pool.
    pub fn boxed(
        block_size: vk::DeviceSize,
        min_block_count: u32,
        max_block_count: u32,
    ) -> Box<dyn AllocationPolicy> {
        Box::new(Self::new(BlockPoolConfig {
            block_size,
            min_block_count,
            max_block_count,
        }))
    }

    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }
}

impl AllocationPolicy for BlockPoolPolicy {
    fn enact(
        &mut self,
        allocator: &MemoryAllocator,
        requirements: &vk::MemoryRequirements,
        request: &mut AllocationRequest,
    ) -> Result<()> {
        let memory_type_index = allocator.find_memory_type_index(requirements.memory_type_bits, &request.memory)?;

        let known = self.pools
            .iter()
            .find(|slot| slot.memory_type_index == memory_type_index && slot.linear == request.linear)
            .map(|slot| slot.pool);

        let pool = match known {
            Some(pool) => pool,
            None => {
                let pool = allocator.create_pool(PoolCreateInfo {
                    memory_type_index,
                    block_size: self.config.block_size,
                    min_block_count: self.config.min_block_count,
                    max_block_count: self.config.max_block_count,
                    linear: request.linear,
                })?;
                self.pools.push(PoolSlot {
                    memory_type_index,
                    linear: request.linear,
                    pool,
                });
                pool
            }
        };

        request.pool = Some(pool);
        Ok(())
    }
}
