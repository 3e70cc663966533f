mod buffer;
mod image;
mod sampler;

pub use buffer::{Buffer, BufferDescriptor};
pub use image::{Image, ImageDescriptor, ImageProperties, ViewProperties};
pub use sampler::{SamplerCache, SamplerKey};
