//! Recording [`Driver`] double for unit tests. Host mappings are backed by
//! real heap memory so map/write/read paths can be exercised end to end.

use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex};
use ash::vk;
use ash::vk::Handle;
use color_eyre::Result;
use color_eyre::eyre::{OptionExt, eyre};
use crate::backend::driver::{DeviceHandles, Driver, RawAllocation, RawAllocationDesc};

pub const DEVICE_LOCAL_TYPE: u32 = 0;
pub const HOST_COHERENT_TYPE: u32 = 1;
pub const HOST_CACHED_TYPE: u32 = 2;
pub const UNIFIED_TYPE: u32 = 3;

const REQUIREMENT_ALIGNMENT: vk::DeviceSize = 256;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MockCalls {
    pub buffers_created: usize,
    pub buffers_destroyed: usize,
    pub images_created: usize,
    pub images_destroyed: usize,
    pub views_created: usize,
    pub views_destroyed: usize,
    pub samplers_created: usize,
    pub samplers_destroyed: usize,
    pub fences_created: usize,
    pub fences_destroyed: usize,
    pub fence_waits: usize,
    pub fence_resets: usize,
    pub allocations: usize,
    pub frees: usize,
    pub binds: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemoryEvent {
    Map,
    Flush,
    Invalidate,
    Unmap,
}

#[derive(Default)]
struct MockState {
    calls: MockCalls,
    events: Vec<MemoryEvent>,
    waited: Vec<vk::Fence>,
    next_handle: u64,
    memory: HashMap<u64, Box<[u8]>>,
    fail_waits: bool,
    fail_views: bool,
}

impl MockState {
    fn next_handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }
}

type WaitHook = Box<dyn Fn() + Send + Sync>;

pub struct MockDriver {
    state: Mutex<MockState>,
    wait_hook: Mutex<Option<WaitHook>>,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
}

impl MockDriver {
    pub fn new() -> Arc<Self> {
        let mut memory_properties = vk::PhysicalDeviceMemoryProperties::default();
        memory_properties.memory_heap_count = 2;
        memory_properties.memory_heaps[0] = vk::MemoryHeap {
            size: 1 << 30,
            flags: vk::MemoryHeapFlags::DEVICE_LOCAL,
        };
        memory_properties.memory_heaps[1] = vk::MemoryHeap {
            size: 1 << 30,
            flags: vk::MemoryHeapFlags::empty(),
        };

        let types = [
            (vk::MemoryPropertyFlags::DEVICE_LOCAL, 0),
            (vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT, 1),
            (vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_CACHED, 1),
            (
                vk::MemoryPropertyFlags::DEVICE_LOCAL
                    | vk::MemoryPropertyFlags::HOST_VISIBLE
                    | vk::MemoryPropertyFlags::HOST_COHERENT,
                0,
            ),
        ];
        memory_properties.memory_type_count = types.len() as u32;
        for (i, (property_flags, heap_index)) in types.into_iter().enumerate() {
            memory_properties.memory_types[i] = vk::MemoryType {
                property_flags,
                heap_index,
            };
        }

        Arc::new(Self {
            state: Mutex::new(MockState::default()),
            wait_hook: Mutex::new(None),
            memory_properties,
        })
    }

    /// Makes every subsequent image view creation fail.
    pub fn fail_image_views(&self, fail: bool) {
        self.state.lock().unwrap().fail_views = fail;
    }

    /// Runs `hook` at the start of every fence wait, as if the device were
    /// still busy.
    pub fn on_wait(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.wait_hook.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn calls(&self) -> MockCalls {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn events(&self) -> Vec<MemoryEvent> {
        self.state.lock().unwrap().events.clone()
    }

    pub fn waited_fences(&self) -> Vec<vk::Fence> {
        self.state.lock().unwrap().waited.clone()
    }

    pub fn live_allocations(&self) -> usize {
        self.state.lock().unwrap().memory.len()
    }

    /// Makes every subsequent fence wait report a timeout.
    pub fn fail_waits(&self, fail: bool) {
        self.state.lock().unwrap().fail_waits = fail;
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    fn requirements(size: vk::DeviceSize) -> vk::MemoryRequirements {
        vk::MemoryRequirements {
            size: size.div_ceil(REQUIREMENT_ALIGNMENT) * REQUIREMENT_ALIGNMENT,
            alignment: REQUIREMENT_ALIGNMENT,
            memory_type_bits: 0b1111,
        }
    }
}

impl Driver for MockDriver {
    fn handles(&self) -> DeviceHandles {
        DeviceHandles {
            instance: vk::Instance::from_raw(0x1),
            physical_device: vk::PhysicalDevice::from_raw(0x2),
            device: vk::Device::from_raw(0x3),
        }
    }

    fn memory_properties(&self) -> vk::PhysicalDeviceMemoryProperties {
        self.memory_properties
    }

    fn create_buffer(&self, info: &vk::BufferCreateInfo<'_>) -> Result<vk::Buffer> {
        let size = info.size;
        self.with_state(|s| {
            s.calls.buffers_created += 1;
            // Encode the size in the upper bits so requirements can be derived.
            Ok(vk::Buffer::from_raw((size << 24) | s.next_handle()))
        })
    }

    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements {
        Self::requirements(buffer.as_raw() >> 24)
    }

    fn bind_buffer_memory(
        &self,
        _buffer: vk::Buffer,
        _memory: vk::DeviceMemory,
        _offset: vk::DeviceSize,
    ) -> Result<()> {
        self.with_state(|s| s.calls.binds += 1);
        Ok(())
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        if buffer != vk::Buffer::null() {
            self.with_state(|s| s.calls.buffers_destroyed += 1);
        }
    }

    fn create_image(&self, info: &vk::ImageCreateInfo<'_>) -> Result<vk::Image> {
        let texels = u64::from(info.extent.width)
            * u64::from(info.extent.height)
            * u64::from(info.extent.depth);
        self.with_state(|s| {
            s.calls.images_created += 1;
            Ok(vk::Image::from_raw(((texels * 16) << 24) | s.next_handle()))
        })
    }

    fn image_memory_requirements(&self, image: vk::Image) -> vk::MemoryRequirements {
        Self::requirements(image.as_raw() >> 24)
    }

    fn bind_image_memory(
        &self,
        _image: vk::Image,
        _memory: vk::DeviceMemory,
        _offset: vk::DeviceSize,
    ) -> Result<()> {
        self.with_state(|s| s.calls.binds += 1);
        Ok(())
    }

    fn destroy_image(&self, image: vk::Image) {
        if image != vk::Image::null() {
            self.with_state(|s| s.calls.images_destroyed += 1);
        }
    }

    fn create_image_view(&self, _info: &vk::ImageViewCreateInfo<'_>) -> Result<vk::ImageView> {
        self.with_state(|s| {
            if s.fail_views {
                return Err(eyre!(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY));
            }
            s.calls.views_created += 1;
            Ok(vk::ImageView::from_raw(s.next_handle()))
        })
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        if view != vk::ImageView::null() {
            self.with_state(|s| s.calls.views_destroyed += 1);
        }
    }

    fn create_sampler(&self, _info: &vk::SamplerCreateInfo<'_>) -> Result<vk::Sampler> {
        self.with_state(|s| {
            s.calls.samplers_created += 1;
            Ok(vk::Sampler::from_raw(s.next_handle()))
        })
    }

    fn destroy_sampler(&self, sampler: vk::Sampler) {
        if sampler != vk::Sampler::null() {
            self.with_state(|s| s.calls.samplers_destroyed += 1);
        }
    }

    fn create_fence(&self, _info: &vk::FenceCreateInfo<'_>) -> Result<vk::Fence> {
        self.with_state(|s| {
            s.calls.fences_created += 1;
            Ok(vk::Fence::from_raw(s.next_handle()))
        })
    }

    fn wait_for_fences(&self, fences: &[vk::Fence], _timeout_ns: u64) -> Result<()> {
        if let Some(hook) = self.wait_hook.lock().unwrap().as_ref() {
            hook();
        }
        self.with_state(|s| {
            s.calls.fence_waits += 1;
            if s.fail_waits {
                return Err(eyre!(vk::Result::TIMEOUT));
            }
            s.waited.extend_from_slice(fences);
            Ok(())
        })
    }

    fn reset_fences(&self, _fences: &[vk::Fence]) -> Result<()> {
        self.with_state(|s| s.calls.fence_resets += 1);
        Ok(())
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        if fence != vk::Fence::null() {
            self.with_state(|s| s.calls.fences_destroyed += 1);
        }
    }

    fn allocate_memory(&self, desc: &RawAllocationDesc<'_>) -> Result<RawAllocation> {
        self.with_state(|s| {
            s.calls.allocations += 1;
            let id = s.next_handle();
            s.memory.insert(id, vec![0u8; desc.size as usize].into_boxed_slice());
            Ok(RawAllocation {
                id,
                memory: vk::DeviceMemory::from_raw(id),
                offset: 0,
                size: desc.size,
                memory_type_index: desc.memory_type_index,
            })
        })
    }

    fn free_memory(&self, allocation: RawAllocation) -> Result<()> {
        self.with_state(|s| {
            s.calls.frees += 1;
            s.memory
                .remove(&allocation.id)
                .map(|_| ())
                .ok_or_else(|| eyre!("Unknown allocation {}", allocation.id))
        })
    }

    fn map_memory(&self, allocation: &RawAllocation) -> Result<NonNull<u8>> {
        let host_visible = self.memory_properties.memory_types[allocation.memory_type_index as usize]
            .property_flags
            .contains(vk::MemoryPropertyFlags::HOST_VISIBLE);
        self.with_state(|s| {
            if !host_visible {
                return Err(eyre!("Allocation is not host visible"));
            }
            s.events.push(MemoryEvent::Map);
            let bytes = s.memory
                .get_mut(&allocation.id)
                .ok_or_eyre("Unknown allocation")?;
            NonNull::new(bytes.as_mut_ptr()).ok_or_eyre("Null mapping")
        })
    }

    fn unmap_memory(&self, _allocation: &RawAllocation) {
        self.with_state(|s| s.events.push(MemoryEvent::Unmap));
    }

    fn flush_memory(
        &self,
        _allocation: &RawAllocation,
        _offset: vk::DeviceSize,
        _size: vk::DeviceSize,
    ) -> Result<()> {
        self.with_state(|s| s.events.push(MemoryEvent::Flush));
        Ok(())
    }

    fn invalidate_memory(
        &self,
        _allocation: &RawAllocation,
        _offset: vk::DeviceSize,
        _size: vk::DeviceSize,
    ) -> Result<()> {
        self.with_state(|s| s.events.push(MemoryEvent::Invalidate));
        Ok(())
    }
}
