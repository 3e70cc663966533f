//! Resource lifetime and memory allocation for Vulkan compute work.
//!
//! A [`ResourcePool`] hands out buffers, images and fences backed by a
//! [`MemoryAllocator`](memory::MemoryAllocator), and destroys registered
//! resources in batches once the fences guarding them have signaled.

pub mod backend;
pub mod config;
mod internals;
pub mod memory;
pub mod pool;
pub mod resources;
pub mod sync;

pub use pool::ResourcePool;
