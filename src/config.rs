/// Sizing of the per-memory-type block pools created by
/// [`BlockPoolPolicy`](crate::memory::BlockPoolPolicy).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockPoolConfig {
    pub block_size: u64,
    pub min_block_count: u32,
    /// Zero means the pool may grow without bound.
    pub max_block_count: u32,
}

impl Default for BlockPoolConfig {
    fn default() -> Self {
        Self {
            block_size: 64 * 1024 * 1024,
            min_block_count: 0,
            max_block_count: 0,
        }
    }
}

/// Contains configuration options for a [`ResourcePool`](crate::pool::ResourcePool)
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourcePoolConfig {
    /// Initial capacity of the pending-destruction lists and the fence array.
    pub reserve: usize,
    /// `None` disables pooling; every allocation gets dedicated memory.
    pub block_pool: Option<BlockPoolConfig>,
}

impl Default for ResourcePoolConfig {
    fn default() -> Self {
        Self {
            reserve: 16,
            block_pool: Some(BlockPoolConfig::default()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BootstrapConfig {
    pub application_name: String,
    /// Requests the Khronos validation layer. Skipped with a warning when
    /// the layer is not installed.
    pub enable_validation: bool,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            application_name: env!("CARGO_PKG_NAME").to_string(),
            enable_validation: cfg!(debug_assertions),
        }
    }
}
