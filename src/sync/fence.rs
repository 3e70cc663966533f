use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use ash::vk;
use color_eyre::Result;
use color_eyre::eyre::{WrapErr, eyre};
use smallvec::SmallVec;
use crate::backend::Driver;

/// Timeout for waits that block until the fence signals.
pub const WAIT_FOREVER: u64 = u64::MAX;

/// Growable array of reusable fences plus the waitlist of fences that
/// currently guard submitted work. Clones share the same pool.
#[repr(transparent)]
pub struct FencePool(Arc<Mutex<FencePoolInner>>);

impl Clone for FencePool {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

struct FencePoolInner {
    fences: Vec<vk::Fence>,
    in_use: usize,
    waitlist: SmallVec<[vk::Fence; 8]>,
    driver: Arc<dyn Driver>,
}

impl FencePool {
    pub fn new(driver: Arc<dyn Driver>, reserve: usize) -> Self {
        Self(Arc::new(Mutex::new(FencePoolInner {
            fences: Vec::with_capacity(reserve),
            in_use: 0,
            waitlist: SmallVec::new(),
            driver,
        })))
    }

    /// Hands out the next free slot, creating a native fence only when every
    /// existing one is in use.
    pub fn fence(&self) -> Result<Fence> {
        let mut inner = self.lock()?;

        if inner.fences.len() == inner.in_use {
            let fence = inner.driver
                .create_fence(&vk::FenceCreateInfo::default())
                .wrap_err("Failed to create fence")?;
            log::trace!("Created fence {:?} (slot {})", fence, inner.fences.len());
            inner.fences.push(fence);
        }

        let id = inner.in_use;
        inner.in_use += 1;

        Ok(Fence {
            pool: self.clone(),
            id,
            waiting: false,
        })
    }

    /// Blocks until every waitlisted fence signals, then resets them and
    /// empties the waitlist. On failure the waitlist is left untouched.
    pub fn wait_all(&self) -> Result<()> {
        let (pending, driver) = {
            let inner = self.lock()?;
            if inner.waitlist.is_empty() {
                return Ok(());
            }
            (inner.waitlist.clone(), Arc::clone(&inner.driver))
        };

        // Unlocked while blocking so other threads can still take fences.
        log::debug!("Waiting on {} fence(s)", pending.len());
        driver
            .wait_for_fences(&pending, WAIT_FOREVER)
            .wrap_err("Failed waiting on fences")?;
        driver
            .reset_fences(&pending)
            .wrap_err("Failed to reset fences")?;

        self.lock()?.waitlist.retain(|fence| !pending.contains(fence));
        Ok(())
    }

    /// Makes every slot available again. Callers must have waited on
    /// outstanding fences first.
    pub fn recycle(&self) -> Result<()> {
        let mut inner = self.lock()?;
        debug_assert!(inner.waitlist.is_empty(), "Recycling fences that are still waitlisted!");
        inner.in_use = 0;
        Ok(())
    }

    /// Number of native fences created so far.
    pub fn len(&self) -> usize {
        self.lock().map(|inner| inner.fences.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn in_use(&self) -> usize {
        self.lock().map(|inner| inner.in_use).unwrap_or(0)
    }

    pub fn waitlist_len(&self) -> usize {
        self.lock().map(|inner| inner.waitlist.len()).unwrap_or(0)
    }

    fn lock(&self) -> Result<MutexGuard<'_, FencePoolInner>> {
        self.0.lock().map_err(|e| eyre!(e.to_string()))
    }
}

impl fmt::Debug for FencePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FencePool")
            .field("len", &self.len())
            .field("in_use", &self.in_use())
            .field("waitlist_len", &self.waitlist_len())
            .finish()
    }
}

impl Drop for FencePoolInner {
    fn drop(&mut self) {
        if !self.waitlist.is_empty() {
            log::warn!("Destroying {} fence(s) that were never waited on", self.waitlist.len());
        }
        for fence in self.fences.drain(..) {
            self.driver.destroy_fence(fence);
        }
    }
}

/// A slot in a [`FencePool`]. The slot stays reserved until the pool is
/// recycled.
pub struct Fence {
    pool: FencePool,
    id: usize,
    waiting: bool,
}

impl Fence {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn is_waiting(&self) -> bool {
        self.waiting
    }

    /// Resolves the native fence, optionally registering it on the waitlist
    /// so that a later wait or pool purge blocks on it.
    pub fn handle(&mut self, add_to_waitlist: bool) -> Result<vk::Fence> {
        let mut inner = self.pool.lock()?;
        let fence = inner.fences
            .get(self.id)
            .copied()
            .ok_or_else(|| eyre!("Fence slot {} does not exist", self.id))?;
        debug_assert!(fence != vk::Fence::null(), "Invalid Vulkan fence!");

        if add_to_waitlist {
            if !inner.waitlist.contains(&fence) {
                inner.waitlist.push(fence);
            }
            self.waiting = true;
        }

        Ok(fence)
    }

    /// Blocks until the fence signals, then resets it. Returns immediately
    /// without touching the device if the fence is not waitlisted.
    pub fn wait(&mut self, timeout_ns: u64) -> Result<()> {
        let (fence, driver) = {
            let inner = self.pool.lock()?;
            match inner.fences.get(self.id).copied() {
                Some(fence) if inner.waitlist.contains(&fence) => (fence, Arc::clone(&inner.driver)),
                _ => {
                    self.waiting = false;
                    return Ok(());
                }
            }
        };

        driver
            .wait_for_fences(&[fence], timeout_ns)
            .wrap_err_with(|| format!("Failed waiting on fence {}", self.id))?;
        driver.reset_fences(&[fence])?;

        self.pool.lock()?.waitlist.retain(|f| *f != fence);
        self.waiting = false;
        Ok(())
    }
}

impl fmt::Debug for Fence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fence")
            .field("id", &self.id)
            .field("waiting", &self.waiting)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use crate::backend::mock::MockDriver;

    #[test]
    fn grows_to_exactly_the_number_in_use() {
        let driver = MockDriver::new();
        let pool = FencePool::new(driver.clone(), 4);

        let fences: Vec<_> = (0..3).map(|_| pool.fence().unwrap()).collect();
        assert_eq!(fences.iter().map(Fence::id).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert_eq!(pool.len(), 3);
        assert_eq!(pool.in_use(), 3);
        assert_eq!(driver.calls().fences_created, 3);
    }

    #[test]
    fn recycled_slots_are_reused_without_creation() {
        let driver = MockDriver::new();
        let pool = FencePool::new(driver.clone(), 4);

        let mut first = pool.fence().unwrap();
        let first_handle = first.handle(false).unwrap();
        pool.fence().unwrap();
        pool.recycle().unwrap();

        let mut reused = pool.fence().unwrap();
        assert_eq!(reused.id(), 0);
        assert_eq!(reused.handle(false).unwrap(), first_handle);
        assert_eq!(driver.calls().fences_created, 2);
    }

    #[test]
    fn wait_without_waitlist_makes_no_device_call() {
        let driver = MockDriver::new();
        let pool = FencePool::new(driver.clone(), 4);

        let mut fence = pool.fence().unwrap();
        fence.handle(false).unwrap();
        fence.wait(WAIT_FOREVER).unwrap();

        assert_eq!(driver.calls().fence_waits, 0);
        assert_eq!(driver.calls().fence_resets, 0);
    }

    #[test]
    fn waitlisted_fence_is_waited_once() {
        let driver = MockDriver::new();
        let pool = FencePool::new(driver.clone(), 4);

        let mut fence = pool.fence().unwrap();
        let handle = fence.handle(true).unwrap();
        fence.handle(true).unwrap();
        assert!(fence.is_waiting());
        assert_eq!(pool.waitlist_len(), 1);

        fence.wait(WAIT_FOREVER).unwrap();
        fence.wait(WAIT_FOREVER).unwrap();

        assert!(!fence.is_waiting());
        assert_eq!(pool.waitlist_len(), 0);
        assert_eq!(driver.waited_fences(), vec![handle]);
        assert_eq!(driver.calls().fence_waits, 1);
        assert_eq!(driver.calls().fence_resets, 1);
    }

    #[test]
    fn pool_stays_unlocked_while_waiting() {
        let driver = MockDriver::new();
        let pool = FencePool::new(driver.clone(), 4);
        let unlocked = Arc::new(AtomicUsize::new(0));

        let weak = Arc::downgrade(&pool.0);
        let seen = Arc::clone(&unlocked);
        driver.on_wait(move || {
            if weak.upgrade().is_some_and(|inner| inner.try_lock().is_ok()) {
                seen.fetch_add(1, Ordering::SeqCst);
            }
        });

        let mut fence = pool.fence().unwrap();
        fence.handle(true).unwrap();
        fence.wait(WAIT_FOREVER).unwrap();

        pool.fence().unwrap().handle(true).unwrap();
        pool.wait_all().unwrap();

        assert_eq!(unlocked.load(Ordering::SeqCst), 2);
        assert_eq!(pool.waitlist_len(), 0);
    }

    #[test]
    fn timed_out_wait_keeps_fence_waitlisted() {
        let driver = MockDriver::new();
        let pool = FencePool::new(driver.clone(), 4);

        let mut fence = pool.fence().unwrap();
        fence.handle(true).unwrap();
        driver.fail_waits(true);

        assert!(fence.wait(1_000).is_err());
        assert!(fence.is_waiting());
        assert_eq!(pool.waitlist_len(), 1);
        assert_eq!(driver.calls().fence_resets, 0);

        driver.fail_waits(false);
        pool.wait_all().unwrap();
        assert_eq!(pool.waitlist_len(), 0);
    }

    #[test]
    fn wait_all_covers_every_waitlisted_fence() {
        let driver = MockDriver::new();
        let pool = FencePool::new(driver.clone(), 4);

        let mut a = pool.fence().unwrap();
        let mut b = pool.fence().unwrap();
        let mut idle = pool.fence().unwrap();
        let handles = vec![a.handle(true).unwrap(), b.handle(true).unwrap()];
        idle.handle(false).unwrap();

        pool.wait_all().unwrap();
        assert_eq!(driver.waited_fences(), handles);
        assert_eq!(driver.calls().fence_waits, 1);
        assert_eq!(pool.waitlist_len(), 0);

        pool.wait_all().unwrap();
        assert_eq!(driver.calls().fence_waits, 1);
    }

    #[test]
    fn last_reference_destroys_fences() {
        let driver = MockDriver::new();
        let pool = FencePool::new(driver.clone(), 4);
        let fence = pool.fence().unwrap();
        pool.fence().unwrap();

        drop(pool);
        assert_eq!(driver.calls().fences_destroyed, 0);
        drop(fence);
        assert_eq!(driver.calls().fences_destroyed, 2);
    }
}
