use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use ash::vk;
use color_eyre::Result;
use color_eyre::eyre::eyre;
use gpu_allocator::MemoryLocation;
use crate::backend::{DeviceHandles, Driver, RawAllocationDesc};
use crate::internals::block::MemoryPool;
use crate::memory::region::{Allocation, AllocationSource, MemoryRegion};
use crate::resources::{Buffer, BufferDescriptor, Image, ImageDescriptor, ImageProperties, SamplerKey, ViewProperties};

/// Format of the floating point 3-D textures produced by
/// [`MemoryAllocator::create_image3d_fp`].
#[cfg(not(feature = "fp16"))]
pub const IMAGE_FORMAT_FP: vk::Format = vk::Format::R32G32B32A32_SFLOAT;
#[cfg(feature = "fp16")]
pub const IMAGE_FORMAT_FP: vk::Format = vk::Format::R16G16B16A16_SFLOAT;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PoolId(usize);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolCreateInfo {
    pub memory_type_index: u32,
    pub block_size: vk::DeviceSize,
    pub min_block_count: u32,
    /// Zero means unbounded.
    pub max_block_count: u32,
    /// Buffers and linear images. Optimal-tiling images get separate pools so
    /// the two never share a `bufferImageGranularity` page.
    pub linear: bool,
}

/// Residency class plus explicit memory property wishes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryProperties {
    pub location: MemoryLocation,
    pub required: vk::MemoryPropertyFlags,
    pub preferred: vk::MemoryPropertyFlags,
}

impl MemoryProperties {
    pub const fn new(location: MemoryLocation) -> Self {
        Self {
            location,
            required: vk::MemoryPropertyFlags::empty(),
            preferred: vk::MemoryPropertyFlags::empty(),
        }
    }

    pub fn required(mut self, flags: vk::MemoryPropertyFlags) -> Self {
        self.required |= flags;
        self
    }

    pub fn preferred(mut self, flags: vk::MemoryPropertyFlags) -> Self {
        self.preferred |= flags;
        self
    }

    /// Explicit flags merged with the ones implied by the residency class,
    /// as `(required, preferred, avoided)`.
    fn resolve(&self) -> (vk::MemoryPropertyFlags, vk::MemoryPropertyFlags, vk::MemoryPropertyFlags) {
        use vk::MemoryPropertyFlags as F;

        let mut required = self.required;
        let mut preferred = self.preferred;
        let mut avoided = F::empty();

        match self.location {
            MemoryLocation::GpuOnly => {
                preferred |= F::DEVICE_LOCAL;
                avoided |= F::HOST_VISIBLE;
            }
            MemoryLocation::GpuToCpu => {
                required |= F::HOST_VISIBLE;
                preferred |= F::HOST_CACHED;
            }
            MemoryLocation::CpuToGpu => {
                required |= F::HOST_VISIBLE;
                preferred |= F::HOST_COHERENT;
                avoided |= F::DEVICE_LOCAL;
            }
            _ => {}
        }

        avoided &= !(required | preferred);
        (required, preferred, avoided)
    }
}

/// What an allocation should look like. Policies may rewrite it before the
/// allocator sees it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AllocationRequest {
    pub memory: MemoryProperties,
    /// Buffers and linear images; optimal-tiling images set this to false.
    pub linear: bool,
    /// Sub-allocate from this pool instead of making a dedicated allocation.
    pub pool: Option<PoolId>,
}

impl AllocationRequest {
    pub fn new(memory: MemoryProperties, linear: bool) -> Self {
        Self {
            memory,
            linear,
            pool: None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AllocatorStats {
    pub dedicated_allocations: usize,
    pub pools: usize,
    pub pool_blocks: usize,
}

/// Sub-allocator bound to one (instance, physical device, device) triple.
pub struct MemoryAllocator {
    driver: Arc<dyn Driver>,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    pools: Mutex<Vec<MemoryPool>>,
    dedicated_allocations: AtomicUsize,
}

impl MemoryAllocator {
    pub fn new(driver: Arc<dyn Driver>) -> Arc<Self> {
        let handles = driver.handles();
        debug_assert!(
            handles.is_complete(),
            "Invalid Vulkan instance, physical device or device handle!"
        );
        log::debug!(
            "Creating memory allocator for device {:?}",
            handles.device,
        );

        let memory_properties = driver.memory_properties();
        Arc::new(Self {
            driver,
            memory_properties,
            pools: Mutex::new(Vec::new()),
            dedicated_allocations: AtomicUsize::new(0),
        })
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    pub fn handles(&self) -> DeviceHandles {
        self.driver.handles()
    }

    pub fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }

    /// Cheapest memory type allowed by `type_bits` that has every required
    /// flag. Cost is the number of missing preferred flags plus present
    /// avoided flags; the lowest index wins ties.
    pub fn find_memory_type_index(&self, type_bits: u32, properties: &MemoryProperties) -> Result<u32> {
        let (required, preferred, avoided) = properties.resolve();
        let count = self.memory_properties.memory_type_count as usize;

        self.memory_properties.memory_types[..count]
            .iter()
            .enumerate()
            .filter(|(i, _)| (type_bits & (1 << i)) != 0)
            .filter(|(_, ty)| ty.property_flags.contains(required))
            .min_by_key(|(_, ty)| {
                let missing = preferred & !ty.property_flags;
                let unwanted = avoided & ty.property_flags;
                missing.as_raw().count_ones() + unwanted.as_raw().count_ones()
            })
            .map(|(i, _)| i as u32)
            .ok_or_else(|| eyre!(
                "No memory type in {:#b} satisfies {:?}",
                type_bits,
                properties,
            ))
    }

    pub fn create_pool(&self, info: PoolCreateInfo) -> Result<PoolId> {
        if info.memory_type_index >= self.memory_properties.memory_type_count {
            return Err(eyre!("Memory type index {} is out of range", info.memory_type_index));
        }

        let pool = MemoryPool::new(info, self.driver.as_ref())?;
        let mut pools = self.lock_pools()?;
        pools.push(pool);
        log::debug!(
            "Created memory pool {} for type {} ({} byte blocks)",
            pools.len() - 1,
            info.memory_type_index,
            info.block_size,
        );
        Ok(PoolId(pools.len() - 1))
    }

    pub fn allocate(
        self: &Arc<Self>,
        requirements: &vk::MemoryRequirements,
        request: &AllocationRequest,
    ) -> Result<MemoryRegion> {
        let allocation = match request.pool {
            Some(id) => {
                let mut pools = self.lock_pools()?;
                let pool = pools
                    .get_mut(id.0)
                    .ok_or_else(|| eyre!("Unknown memory pool {:?}", id))?;
                if pool.info().linear != request.linear {
                    return Err(eyre!(
                        "Memory pool {:?} does not hold {} resources",
                        id,
                        if request.linear { "linear" } else { "optimal-tiling" },
                    ));
                }
                let (block, region) = pool.allocate(self.driver.as_ref(), requirements)?;
                Allocation::pooled(id, block, region)
            }
            None => {
                let memory_type_index = self.find_memory_type_index(requirements.memory_type_bits, &request.memory)?;
                let raw = self.driver.allocate_memory(&RawAllocationDesc {
                    name: "dedicated allocation",
                    size: requirements.size,
                    alignment: requirements.alignment,
                    memory_type_index,
                    linear: request.linear,
                })?;
                self.dedicated_allocations.fetch_add(1, Ordering::Relaxed);
                Allocation::dedicated(raw)
            }
        };

        Ok(MemoryRegion::new(Arc::clone(self), allocation))
    }

    pub(crate) fn free(&self, allocation: &Allocation) -> Result<()> {
        match allocation.source() {
            AllocationSource::Dedicated => {
                self.dedicated_allocations.fetch_sub(1, Ordering::Relaxed);
                self.driver.free_memory(*allocation.raw())
            }
            AllocationSource::Pool(id) => {
                let mut pools = self.lock_pools()?;
                let pool = pools
                    .get_mut(id.0)
                    .ok_or_else(|| eyre!("Unknown memory pool {:?}", id))?;
                pool.free(self.driver.as_ref(), allocation.raw().id, allocation.block_region())
            }
        }
    }

    pub fn stats(&self) -> AllocatorStats {
        let (pools, pool_blocks) = match self.pools.lock() {
            Ok(pools) => (pools.len(), pools.iter().map(MemoryPool::block_count).sum()),
            Err(_) => (0, 0),
        };
        AllocatorStats {
            dedicated_allocations: self.dedicated_allocations.load(Ordering::Relaxed),
            pools,
            pool_blocks,
        }
    }

    /// Device-local 3-D image of four floating point channels.
    pub fn create_image3d_fp(
        self: &Arc<Self>,
        extents: vk::Extent3D,
        sampler_properties: SamplerKey,
        sampler: vk::Sampler,
        allow_transfer: bool,
    ) -> Result<Image> {
        let mut usage = vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::STORAGE;
        if allow_transfer {
            usage |= vk::ImageUsageFlags::TRANSFER_SRC | vk::ImageUsageFlags::TRANSFER_DST;
        }

        let descriptor = ImageDescriptor {
            properties: ImageProperties {
                image_type: vk::ImageType::TYPE_3D,
                format: IMAGE_FORMAT_FP,
                extent: extents,
            },
            view: ViewProperties {
                view_type: vk::ImageViewType::TYPE_3D,
                format: IMAGE_FORMAT_FP,
            },
            sampler: sampler_properties,
            usage,
            memory: MemoryProperties::new(MemoryLocation::GpuOnly),
        };
        Image::new(self, &descriptor, sampler, None)
    }

    pub fn create_storage_buffer(self: &Arc<Self>, size: vk::DeviceSize, gpu_only: bool) -> Result<Buffer> {
        let memory = if gpu_only {
            MemoryProperties::new(MemoryLocation::GpuOnly)
        } else {
            MemoryProperties::new(MemoryLocation::GpuToCpu)
                .preferred(vk::MemoryPropertyFlags::HOST_COHERENT)
        };

        let descriptor = BufferDescriptor {
            size,
            usage: vk::BufferUsageFlags::STORAGE_BUFFER
                | vk::BufferUsageFlags::TRANSFER_SRC
                | vk::BufferUsageFlags::TRANSFER_DST,
            memory,
        };
        Buffer::new(self, &descriptor, None)
    }

    pub fn create_staging_buffer(self: &Arc<Self>, size: vk::DeviceSize) -> Result<Buffer> {
        let descriptor = BufferDescriptor {
            size,
            usage: vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST,
            memory: MemoryProperties::new(MemoryLocation::CpuToGpu),
        };
        Buffer::new(self, &descriptor, None)
    }

    fn lock_pools(&self) -> Result<MutexGuard<'_, Vec<MemoryPool>>> {
        self.pools.lock().map_err(|e| eyre!(e.to_string()))
    }
}

impl fmt::Debug for MemoryAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryAllocator")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl Drop for MemoryAllocator {
    fn drop(&mut self) {
        let driver = &self.driver;
        match self.pools.get_mut() {
            Ok(pools) => {
                for pool in pools.iter_mut() {
                    pool.release(driver.as_ref());
                }
            }
            Err(e) => log::error!("Memory pools are poisoned, leaking blocks: {}", e),
        }
    }
}
