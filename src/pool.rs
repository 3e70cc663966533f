use std::fmt;
use std::sync::Arc;
use ash::vk;
use color_eyre::Result;
use color_eyre::eyre::OptionExt;
use crate::backend::Driver;
use crate::config::ResourcePoolConfig;
use crate::memory::{AllocationPolicy, BlockPoolPolicy, MemoryAllocator};
use crate::resources::{Buffer, BufferDescriptor, Image, ImageDescriptor, SamplerCache};
use crate::sync::{Fence, FencePool};

const INVALID_POOL: &str =
    "This resource pool is in an invalid state! Potential reason: This resource pool is moved from.";

/// Owns the allocator, sampler cache and fences for one device, and defers
/// destruction of registered buffers and images until [`ResourcePool::purge`].
///
/// Methods take `&mut self`; callers serialize access to the pool.
pub struct ResourcePool {
    state: Option<PoolState>,
}

// Fields drop in declaration order: pending resources go before the
// samplers they reference and the allocator that backs them.
struct PoolState {
    buffers: Vec<Buffer>,
    images: Vec<Image>,
    fence_pool: FencePool,
    policy: Option<Box<dyn AllocationPolicy>>,
    sampler_cache: SamplerCache,
    allocator: Arc<MemoryAllocator>,
}

impl ResourcePool {
    pub fn new(driver: Arc<dyn Driver>, policy: Option<Box<dyn AllocationPolicy>>) -> Self {
        Self::build(driver, policy, ResourcePoolConfig::default().reserve)
    }

    /// Builds a pool whose policy follows `config.block_pool`.
    pub fn with_config(driver: Arc<dyn Driver>, config: &ResourcePoolConfig) -> Self {
        let policy = config
            .block_pool
            .map(|block_pool| Box::new(BlockPoolPolicy::new(block_pool)) as Box<dyn AllocationPolicy>);
        Self::build(driver, policy, config.reserve)
    }

    fn build(driver: Arc<dyn Driver>, policy: Option<Box<dyn AllocationPolicy>>, reserve: usize) -> Self {
        debug_assert!(driver.handles().device != vk::Device::null(), "Invalid Vulkan device!");
        log::debug!(
            "Creating resource pool (pooled allocations: {})",
            policy.is_some(),
        );

        let allocator = MemoryAllocator::new(Arc::clone(&driver));
        Self {
            state: Some(PoolState {
                buffers: Vec::with_capacity(reserve),
                images: Vec::with_capacity(reserve),
                fence_pool: FencePool::new(Arc::clone(&driver), reserve),
                policy,
                sampler_cache: SamplerCache::new(driver),
                allocator,
            }),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.state.is_some()
    }

    /// Moves every owned resource into a new pool. `self` is left invalid and
    /// its drop becomes a no-op.
    pub fn take(&mut self) -> ResourcePool {
        ResourcePool {
            state: self.state.take(),
        }
    }

    pub fn create_buffer(&mut self, descriptor: &BufferDescriptor) -> Result<Buffer> {
        let state = self.state_mut()?;
        Buffer::new(&state.allocator, descriptor, state.policy.as_deref_mut())
    }

    pub fn create_image(&mut self, descriptor: &ImageDescriptor) -> Result<Image> {
        let state = self.state_mut()?;
        let sampler = state.sampler_cache.retrieve(&descriptor.sampler)?;
        Image::new(&state.allocator, descriptor, sampler, state.policy.as_deref_mut())
    }

    /// Hands `buffer` to the pool; it is destroyed by the next purge.
    pub fn register_buffer_cleanup(&mut self, buffer: Buffer) -> Result<()> {
        self.state_mut()?.buffers.push(buffer);
        Ok(())
    }

    /// Hands `image` to the pool; it is destroyed by the next purge.
    pub fn register_image_cleanup(&mut self, image: Image) -> Result<()> {
        self.state_mut()?.images.push(image);
        Ok(())
    }

    pub fn fence(&mut self) -> Result<Fence> {
        self.state_mut()?.fence_pool.fence()
    }

    /// Waits for all waitlisted fences, destroys every pending buffer and
    /// image, and makes all fence slots reusable.
    pub fn purge(&mut self) -> Result<()> {
        let state = self.state_mut()?;
        state.fence_pool.wait_all()?;

        let (buffers, images) = (state.buffers.len(), state.images.len());
        state.images.clear();
        state.buffers.clear();
        state.fence_pool.recycle()?;

        if buffers + images > 0 {
            log::debug!("Purged {} buffer(s) and {} image(s)", buffers, images);
        }
        Ok(())
    }

    pub fn allocator(&self) -> Result<&Arc<MemoryAllocator>> {
        Ok(&self.state()?.allocator)
    }

    pub fn sampler_cache(&self) -> Result<&SamplerCache> {
        Ok(&self.state()?.sampler_cache)
    }

    pub fn fence_pool(&self) -> Result<&FencePool> {
        Ok(&self.state()?.fence_pool)
    }

    pub fn pending_buffers(&self) -> usize {
        self.state.as_ref().map_or(0, |state| state.buffers.len())
    }

    pub fn pending_images(&self) -> usize {
        self.state.as_ref().map_or(0, |state| state.images.len())
    }

    fn state(&self) -> Result<&PoolState> {
        debug_assert!(self.state.is_some(), "{}", INVALID_POOL);
        self.state.as_ref().ok_or_eyre(INVALID_POOL)
    }

    fn state_mut(&mut self) -> Result<&mut PoolState> {
        debug_assert!(self.state.is_some(), "{}", INVALID_POOL);
        self.state.as_mut().ok_or_eyre(INVALID_POOL)
    }
}

impl fmt::Debug for ResourcePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("ResourcePool");
        s.field("valid", &self.is_valid());
        if let Some(state) = &self.state {
            s.field("pending_buffers", &state.buffers.len())
                .field("pending_images", &state.images.len())
                .field("fence_pool", &state.fence_pool)
                .field("allocator", &state.allocator);
        }
        s.finish_non_exhaustive()
    }
}

impl Drop for ResourcePool {
    fn drop(&mut self) {
        if !self.is_valid() {
            return;
        }
        if let Err(e) = self.purge() {
            log::warn!("Resource pool failed to purge on drop: {:?}", e);
        }
    }
}
