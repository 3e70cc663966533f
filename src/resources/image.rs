use std::fmt;
use std::sync::Arc;
use ash::vk;
use color_eyre::eyre::{Result, WrapErr};
use crate::backend::Driver;
use crate::memory::{AllocationPolicy, AllocationRequest, MemoryAllocator, MemoryProperties, MemoryRegion};
use crate::resources::sampler::SamplerKey;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageProperties {
    pub image_type: vk::ImageType,
    pub format: vk::Format,
    pub extent: vk::Extent3D,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ViewProperties {
    pub view_type: vk::ImageViewType,
    pub format: vk::Format,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageDescriptor {
    pub properties: ImageProperties,
    pub view: ViewProperties,
    pub sampler: SamplerKey,
    pub usage: vk::ImageUsageFlags,
    pub memory: MemoryProperties,
}

/// A native image with one view over all of it and bound memory.
///
/// The sampler is borrowed from a [`SamplerCache`](crate::resources::SamplerCache)
/// and is never destroyed by the image.
pub struct Image {
    handle: vk::Image,
    view: vk::ImageView,
    layout: vk::ImageLayout,
    sampler: vk::Sampler,
    properties: ImageProperties,
    view_properties: ViewProperties,
    usage: vk::ImageUsageFlags,
    driver: Arc<dyn Driver>,
    memory: MemoryRegion,
}

impl Image {
    pub fn new(
        allocator: &Arc<MemoryAllocator>,
        descriptor: &ImageDescriptor,
        sampler: vk::Sampler,
        policy: Option<&mut (dyn AllocationPolicy + 'static)>,
    ) -> Result<Self> {
        let driver = Arc::clone(allocator.driver());
        let properties = descriptor.properties;

        let info = vk::ImageCreateInfo::default()
            .image_type(properties.image_type)
            .format(properties.format)
            .extent(properties.extent)
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(descriptor.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let handle = driver
            .create_image(&info)
            .wrap_err_with(|| format!("Failed to create {:?} image", properties.format))?;

        let memory = match Self::bind_memory(allocator, driver.as_ref(), handle, descriptor, policy) {
            Ok(memory) => memory,
            Err(e) => {
                driver.destroy_image(handle);
                return Err(e);
            }
        };

        let view_info = vk::ImageViewCreateInfo::default()
            .image(handle)
            .view_type(descriptor.view.view_type)
            .format(descriptor.view.format)
            .components(vk::ComponentMapping {
                r: vk::ComponentSwizzle::IDENTITY,
                g: vk::ComponentSwizzle::IDENTITY,
                b: vk::ComponentSwizzle::IDENTITY,
                a: vk::ComponentSwizzle::IDENTITY,
            })
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: vk::REMAINING_MIP_LEVELS,
                base_array_layer: 0,
                layer_count: vk::REMAINING_ARRAY_LAYERS,
            });
        let view = match driver.create_image_view(&view_info) {
            Ok(view) => view,
            Err(e) => {
                driver.destroy_image(handle);
                return Err(e.wrap_err("Failed to create image view"));
            }
        };
        log::trace!(
            "Created image {:?} ({:?}, {:?}) with view {:?}",
            handle,
            properties.format,
            properties.extent,
            view,
        );

        Ok(Self {
            handle,
            view,
            layout: vk::ImageLayout::UNDEFINED,
            sampler,
            properties,
            view_properties: descriptor.view,
            usage: descriptor.usage,
            driver,
            memory,
        })
    }

    fn bind_memory(
        allocator: &Arc<MemoryAllocator>,
        driver: &dyn Driver,
        handle: vk::Image,
        descriptor: &ImageDescriptor,
        policy: Option<&mut (dyn AllocationPolicy + 'static)>,
    ) -> Result<MemoryRegion> {
        let requirements = driver.image_memory_requirements(handle);
        let mut request = AllocationRequest::new(descriptor.memory, false);
        if let Some(policy) = policy {
            policy.enact(allocator, &requirements, &mut request)?;
        }

        let memory = allocator
            .allocate(&requirements, &request)
            .wrap_err("Failed to allocate image memory")?;
        let allocation = memory.allocation();
        driver.bind_image_memory(handle, allocation.memory(), allocation.bind_offset())?;
        Ok(memory)
    }

    pub fn handle(&self) -> vk::Image {
        self.handle
    }

    pub fn view(&self) -> vk::ImageView {
        self.view
    }

    pub fn sampler(&self) -> vk::Sampler {
        self.sampler
    }

    /// Last layout recorded with [`Self::set_layout`].
    pub fn layout(&self) -> vk::ImageLayout {
        self.layout
    }

    pub fn set_layout(&mut self, layout: vk::ImageLayout) {
        self.layout = layout;
    }

    pub fn properties(&self) -> &ImageProperties {
        &self.properties
    }

    pub fn view_properties(&self) -> &ViewProperties {
        &self.view_properties
    }

    pub fn extent(&self) -> vk::Extent3D {
        self.properties.extent
    }

    pub fn format(&self) -> vk::Format {
        self.properties.format
    }

    pub fn usage(&self) -> vk::ImageUsageFlags {
        self.usage
    }

    pub fn memory(&self) -> &MemoryRegion {
        &self.memory
    }

    pub fn descriptor_info(&self) -> vk::DescriptorImageInfo {
        vk::DescriptorImageInfo {
            sampler: self.sampler,
            image_view: self.view,
            image_layout: self.layout,
        }
    }
}

impl fmt::Debug for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Image")
            .field("handle", &self.handle)
            .field("view", &self.view)
            .field("layout", &self.layout)
            .field("properties", &self.properties)
            .field("memory", &self.memory)
            .finish_non_exhaustive()
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        log::trace!("Destroying image {:?}", self.handle);
        self.driver.destroy_image_view(self.view);
        self.driver.destroy_image(self.handle);
    }
}
