use std::sync::Arc;
use ash::vk;
use bytemuck::{Pod, Zeroable};
use color_eyre::Result;
use gpu_allocator::MemoryLocation;
use gpures::ResourcePool;
use gpures::backend::{Driver, GpuContext};
use gpures::config::{BootstrapConfig, ResourcePoolConfig};
use gpures::memory::{MemoryAccess, MemoryProperties};
use gpures::resources::{BufferDescriptor, SamplerKey};
use gpures::sync::WAIT_FOREVER;

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
struct Params {
    extent: [u32; 4],
    scale: f32,
    _padding: [f32; 3],
}

fn main() -> Result<()> {
    color_eyre::install()?;
    env_logger::init();

    let context = GpuContext::new(&BootstrapConfig::default())?;
    let driver: Arc<dyn Driver> = Arc::new(context.create_driver()?);

    // Every resource holding the driver is gone when this returns, before
    // the context tears down the device.
    run(&context, driver)
}

fn run(context: &GpuContext, driver: Arc<dyn Driver>) -> Result<()> {
    let mut pool = ResourcePool::with_config(driver, &ResourcePoolConfig::default());
    let allocator = Arc::clone(pool.allocator()?);

    let extent = vk::Extent3D { width: 16, height: 16, depth: 4 };
    let params = Params {
        extent: [extent.width, extent.height, extent.depth, 0],
        scale: 0.5,
        _padding: [0.0; 3],
    };

    let mut staging = allocator.create_staging_buffer(size_of::<Params>() as vk::DeviceSize)?;
    staging.map(MemoryAccess::Write)?.write(&[params], 0)?;

    let storage = allocator.create_storage_buffer(1 << 20, true)?;
    let mut readback = allocator.create_storage_buffer(1 << 10, false)?;

    let sampler_key = SamplerKey {
        filter: vk::Filter::LINEAR,
        ..SamplerKey::default()
    };
    let sampler = pool.sampler_cache()?.retrieve(&sampler_key)?;
    let image = allocator.create_image3d_fp(extent, sampler_key, sampler, true)?;

    let mut uniform = pool.create_buffer(&BufferDescriptor {
        size: size_of::<Params>() as vk::DeviceSize,
        usage: vk::BufferUsageFlags::UNIFORM_BUFFER,
        memory: MemoryProperties::new(MemoryLocation::CpuToGpu)
            .preferred(vk::MemoryPropertyFlags::DEVICE_LOCAL),
    })?;
    uniform.map(MemoryAccess::Write)?.write(&[params], 0)?;

    // One fence waited on explicitly, one left for the purge.
    let mut first = pool.fence()?;
    context.device.submit_signal(first.handle(true)?)?;
    first.wait(WAIT_FOREVER)?;

    let mut second = pool.fence()?;
    context.device.submit_signal(second.handle(true)?)?;

    {
        let map = readback.map(MemoryAccess::Read)?;
        log::info!("Readback buffer holds {} bytes", map.len());
    }
    log::info!("Image {:?} uses {:?}", image.extent(), image.format());
    log::info!("Allocator: {:?}", allocator.stats());

    pool.register_buffer_cleanup(staging)?;
    pool.register_buffer_cleanup(storage)?;
    pool.register_buffer_cleanup(readback)?;
    pool.register_buffer_cleanup(uniform)?;
    pool.register_image_cleanup(image)?;
    pool.purge()?;

    log::info!("After purge: {:?}", pool);
    Ok(())
}
