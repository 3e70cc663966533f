use std::any::type_name;
use std::fmt;
use std::ptr::NonNull;
use std::slice;
use bytemuck::Pod;
use color_eyre::Result;
use color_eyre::eyre::eyre;
use crate::memory::region::MemoryRegion;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MemoryAccess {
    Read,
    Write,
    ReadWrite,
}

impl MemoryAccess {
    pub fn reads(self) -> bool {
        matches!(self, Self::Read | Self::ReadWrite)
    }

    pub fn writes(self) -> bool {
        matches!(self, Self::Write | Self::ReadWrite)
    }
}

/// Host view of a [`MemoryRegion`] for as long as the map is alive.
///
/// Read access invalidates the range when the map is opened. Write access
/// flushes the whole range before the memory is unmapped on drop; the driver
/// skips both for host-coherent memory.
///
/// A map borrows its region mutably, so a second map can only be opened once
/// the first has been dropped:
///
/// ```compile_fail
/// use gpures::memory::MemoryAccess;
/// use gpures::resources::Buffer;
///
/// fn two_maps(buffer: &mut Buffer) {
///     let first = buffer.map(MemoryAccess::Write).unwrap();
///     let second = buffer.map(MemoryAccess::Write).unwrap();
///     drop(first);
///     drop(second);
/// }
/// ```
pub struct MemoryMap<'a> {
    region: &'a mut MemoryRegion,
    access: MemoryAccess,
    data: NonNull<u8>,
    len: usize,
}

impl<'a> MemoryMap<'a> {
    pub fn new(region: &'a mut MemoryRegion, access: MemoryAccess) -> Result<Self> {
        let allocation = region.allocation();
        let (offset, len) = (allocation.offset(), allocation.size());
        let base = region.allocator().driver().map_memory(allocation.raw())?;

        // The driver maps the whole raw allocation; pooled regions start
        // `offset` bytes into it.
        let data = unsafe { base.add(offset as usize) };

        let map = Self {
            region,
            access,
            data,
            len: len as usize,
        };
        map.invalidate()?;
        Ok(map)
    }

    pub fn access(&self) -> MemoryAccess {
        self.access
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Pulls device writes into the host view. No-op without read access.
    pub fn invalidate(&self) -> Result<()> {
        if !self.access.reads() {
            return Ok(());
        }
        let allocation = self.region.allocation();
        self.region
            .allocator()
            .driver()
            .invalidate_memory(allocation.raw(), allocation.offset(), allocation.size())
    }

    pub fn as_bytes(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.data.as_ptr(), self.len) }
    }

    pub fn as_slice<T: Pod>(&self) -> Result<&[T]> {
        bytemuck::try_cast_slice(self.as_bytes())
            .map_err(|e| eyre!("Cannot view mapped memory as [{}]: {:?}", type_name::<T>(), e))
    }

    pub fn as_mut_slice<T: Pod>(&mut self) -> Result<&mut [T]> {
        self.ensure_writable()?;
        let bytes = unsafe { slice::from_raw_parts_mut(self.data.as_ptr(), self.len) };
        bytemuck::try_cast_slice_mut(bytes)
            .map_err(|e| eyre!("Cannot view mapped memory as [{}]: {:?}", type_name::<T>(), e))
    }

    pub fn write<T>(&mut self, data: &[T], start_offset: usize) -> Result<presser::CopyRecord>
    where
        T: Copy,
    {
        self.ensure_writable()?;
        let mut raw = unsafe { presser::RawAllocation::from_raw_parts(self.data, self.len) };
        let mut slab = unsafe { raw.borrow_as_slab() };
        Ok(presser::copy_from_slice_to_offset(data, &mut slab, start_offset)?)
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.access.writes() {
            Ok(())
        } else {
            Err(eyre!("Memory was mapped with {:?} access", self.access))
        }
    }
}

impl fmt::Debug for MemoryMap<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryMap")
            .field("access", &self.access)
            .field("len", &self.len)
            .finish_non_exhaustive()
    }
}

impl Drop for MemoryMap<'_> {
    fn drop(&mut self) {
        let allocation = self.region.allocation();
        let driver = self.region.allocator().driver();

        if self.access.writes() {
            if let Err(e) = driver.flush_memory(allocation.raw(), allocation.offset(), allocation.size()) {
                log::warn!("Failed to flush mapped memory: {:?}", e);
            }
        }
        driver.unmap_memory(allocation.raw());
    }
}
