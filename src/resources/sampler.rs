use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use ash::vk;
use color_eyre::eyre::{Result, WrapErr, eyre};
use crate::backend::Driver;

/// Filtering and addressing configuration identifying one cached sampler.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SamplerKey {
    pub filter: vk::Filter,
    pub mipmap_mode: vk::SamplerMipmapMode,
    pub address_mode: vk::SamplerAddressMode,
    pub border_color: vk::BorderColor,
}

impl Default for SamplerKey {
    fn default() -> Self {
        Self {
            filter: vk::Filter::NEAREST,
            mipmap_mode: vk::SamplerMipmapMode::NEAREST,
            address_mode: vk::SamplerAddressMode::CLAMP_TO_BORDER,
            border_color: vk::BorderColor::FLOAT_TRANSPARENT_BLACK,
        }
    }
}

impl SamplerKey {
    fn create_info(&self) -> vk::SamplerCreateInfo<'static> {
        vk::SamplerCreateInfo::default()
            .mag_filter(self.filter)
            .min_filter(self.filter)
            .mipmap_mode(self.mipmap_mode)
            .address_mode_u(self.address_mode)
            .address_mode_v(self.address_mode)
            .address_mode_w(self.address_mode)
            .mip_lod_bias(0.0)
            .anisotropy_enable(false)
            .max_anisotropy(1.0)
            .compare_enable(false)
            .compare_op(vk::CompareOp::NEVER)
            .min_lod(0.0)
            .max_lod(vk::LOD_CLAMP_NONE)
            .border_color(self.border_color)
            .unnormalized_coordinates(false)
    }
}

struct SamplerEntry {
    handle: vk::Sampler,
    driver: Arc<dyn Driver>,
}

impl Drop for SamplerEntry {
    fn drop(&mut self) {
        log::trace!("Destroying sampler {:?}", self.handle);
        self.driver.destroy_sampler(self.handle);
    }
}

/// Deduplicates samplers by configuration. Safe to share between threads;
/// handles stay valid until the next [`SamplerCache::purge`].
pub struct SamplerCache {
    driver: Arc<dyn Driver>,
    cache: Mutex<HashMap<SamplerKey, SamplerEntry>>,
}

impl SamplerCache {
    pub fn new(driver: Arc<dyn Driver>) -> Self {
        Self {
            driver,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn retrieve(&self, key: &SamplerKey) -> Result<vk::Sampler> {
        let mut cache = self.cache.lock().map_err(|e| eyre!(e.to_string()))?;

        match cache.entry(*key) {
            Entry::Occupied(entry) => Ok(entry.get().handle),
            Entry::Vacant(entry) => {
                let handle = self.driver
                    .create_sampler(&key.create_info())
                    .wrap_err_with(|| format!("Failed to create sampler for {:?}", key))?;
                log::trace!("Created sampler {:?} for {:?}", handle, key);
                entry.insert(SamplerEntry {
                    handle,
                    driver: Arc::clone(&self.driver),
                });
                Ok(handle)
            }
        }
    }

    /// Destroys every cached sampler. Images still referencing one of them
    /// must not be used afterwards.
    pub fn purge(&self) {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        if !cache.is_empty() {
            log::debug!("Purging {} cached sampler(s)", cache.len());
        }
        cache.clear();
    }

    pub fn len(&self) -> usize {
        self.cache.lock().map(|cache| cache.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for SamplerCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SamplerCache")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

impl Drop for SamplerCache {
    fn drop(&mut self) {
        self.purge();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use crate::backend::mock::MockDriver;

    fn linear_repeat() -> SamplerKey {
        SamplerKey {
            filter: vk::Filter::LINEAR,
            mipmap_mode: vk::SamplerMipmapMode::LINEAR,
            address_mode: vk::SamplerAddressMode::REPEAT,
            border_color: vk::BorderColor::FLOAT_OPAQUE_BLACK,
        }
    }

    #[test]
    fn same_key_returns_same_sampler() {
        let driver = MockDriver::new();
        let cache = SamplerCache::new(driver.clone());

        let first = cache.retrieve(&linear_repeat()).unwrap();
        let second = cache.retrieve(&linear_repeat()).unwrap();
        assert_eq!(first, second);
        assert_eq!(driver.calls().samplers_created, 1);

        let other = cache.retrieve(&SamplerKey::default()).unwrap();
        assert_ne!(first, other);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn purge_forces_recreation() {
        let driver = MockDriver::new();
        let cache = SamplerCache::new(driver.clone());

        let before = cache.retrieve(&linear_repeat()).unwrap();
        cache.purge();
        assert!(cache.is_empty());
        assert_eq!(driver.calls().samplers_destroyed, 1);

        let after = cache.retrieve(&linear_repeat()).unwrap();
        assert_ne!(before, after);
        assert_eq!(driver.calls().samplers_created, 2);
    }

    #[test]
    fn concurrent_retrieval_creates_once() {
        let driver = MockDriver::new();
        let cache = Arc::new(SamplerCache::new(driver.clone()));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || cache.retrieve(&linear_repeat()).unwrap())
            })
            .collect();
        let samplers: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert!(samplers.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(driver.calls().samplers_created, 1);
    }

    #[test]
    fn dropping_cache_destroys_samplers() {
        let driver = MockDriver::new();
        let cache = SamplerCache::new(driver.clone());
        cache.retrieve(&linear_repeat()).unwrap();
        cache.retrieve(&SamplerKey::default()).unwrap();

        drop(cache);
        assert_eq!(driver.calls().samplers_destroyed, 2);
    }
}
