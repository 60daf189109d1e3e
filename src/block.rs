//! A single device memory allocation shared by many suballocations.

use std::ffi::c_void;
use std::ptr::NonNull;
use std::sync::{Arc, Weak};

use ash::vk;
use parking_lot::Mutex;

use crate::device::DeviceContext;
use crate::error::{Error, Result};
use crate::list::BlockList;
use crate::metadata::BlockMetadata;

/// Map refcount and base pointer of one device memory. Also used by
/// dedicated allocations, which carry the same mapping contract.
#[derive(Debug)]
pub(crate) struct MapState {
    count: u32,
    ptr: *mut c_void,
}

impl MapState {
    pub fn new() -> MapState {
        MapState {
            count: 0,
            ptr: std::ptr::null_mut(),
        }
    }

    /// Add `count` map references, calling `do_map` only on the 0 → n
    /// transition. `count == 0` is a no-op returning the current pointer.
    pub fn map(
        &mut self,
        count: u32,
        do_map: impl FnOnce() -> Result<*mut c_void>,
    ) -> Result<*mut u8> {
        if count == 0 {
            return Ok(self.ptr as *mut u8);
        }
        if self.count > 0 {
            self.count += count;
            return Ok(self.ptr as *mut u8);
        }
        let ptr = do_map()?;
        self.count = count;
        self.ptr = ptr;
        Ok(ptr as *mut u8)
    }

    /// Drop `count` map references, calling `do_unmap` on the n → 0
    /// transition. Releasing more references than held is a misuse.
    pub fn unmap(&mut self, count: u32, do_unmap: impl FnOnce()) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        if self.count < count {
            return Err(Error::Validation(
                "device memory unmapped more times than mapped",
            ));
        }
        self.count -= count;
        if self.count == 0 {
            do_unmap();
            self.ptr = std::ptr::null_mut();
        }
        Ok(())
    }

    pub fn mapped_ptr(&self) -> Option<NonNull<u8>> {
        NonNull::new(self.ptr as *mut u8)
    }

    pub fn is_mapped(&self) -> bool {
        self.count > 0
    }
}

/// One `VkDeviceMemory` plus the metadata describing its interior layout.
///
/// The metadata mutex is the block's exclusive lock: every metadata mutation
/// happens under it. The map lock serialises map/unmap/bind against each
/// other.
#[derive(Debug)]
pub(crate) struct MemoryBlock {
    ctx: Arc<DeviceContext>,
    owner: Weak<BlockList>,
    memory: vk::DeviceMemory,
    memory_type_index: u32,
    size: u64,
    id: u64,
    pub(crate) metadata: Mutex<BlockMetadata>,
    map_state: Mutex<MapState>,
}

// The mapped pointer inside MapState travels with the block; dereferencing
// it is the caller's contract with Vulkan.
unsafe impl Send for MemoryBlock {}
unsafe impl Sync for MemoryBlock {}

impl MemoryBlock {
    pub fn new(
        ctx: Arc<DeviceContext>,
        owner: Weak<BlockList>,
        memory: vk::DeviceMemory,
        memory_type_index: u32,
        size: u64,
        id: u64,
    ) -> MemoryBlock {
        MemoryBlock {
            ctx,
            owner,
            memory,
            memory_type_index,
            size,
            id,
            metadata: Mutex::new(BlockMetadata::new(size)),
            map_state: Mutex::new(MapState::new()),
        }
    }

    pub fn memory(&self) -> vk::DeviceMemory {
        self.memory
    }

    pub fn memory_type_index(&self) -> u32 {
        self.memory_type_index
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// The block list this block belongs to, if it still exists.
    pub fn owner(&self) -> Option<Arc<BlockList>> {
        self.owner.upgrade()
    }

    /// Acquire `count` map references and return the base pointer.
    pub unsafe fn map(&self, count: u32) -> Result<*mut u8> {
        let mut state = self.map_state.lock();
        state.map(count, || {
            self.ctx
                .device
                .map_memory(self.memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
                .map_err(Error::MapFailed)
        })
    }

    /// Release `count` map references.
    pub unsafe fn unmap(&self, count: u32) -> Result<()> {
        let mut state = self.map_state.lock();
        state.unmap(count, || self.ctx.device.unmap_memory(self.memory))
    }

    pub fn mapped_ptr(&self) -> Option<NonNull<u8>> {
        self.map_state.lock().mapped_ptr()
    }

    /// Bind `buffer` at the given absolute offset within this block.
    pub unsafe fn bind_buffer(&self, offset: u64, buffer: vk::Buffer) -> Result<()> {
        debug_assert!(offset <= self.size);
        let _serialise = self.map_state.lock();
        self.ctx
            .device
            .bind_buffer_memory(buffer, self.memory, offset)
            .map_err(Error::from)
    }

    /// Bind `image` at the given absolute offset within this block.
    pub unsafe fn bind_image(&self, offset: u64, image: vk::Image) -> Result<()> {
        debug_assert!(offset <= self.size);
        let _serialise = self.map_state.lock();
        self.ctx
            .device
            .bind_image_memory(image, self.memory, offset)
            .map_err(Error::from)
    }

    /// Release the device memory. Called exactly once by the owning list.
    pub unsafe fn destroy(&self) {
        let state = self.map_state.lock();
        if state.is_mapped() {
            log::warn!(
                "destroying block {} of memory type {} while still mapped",
                self.id,
                self.memory_type_index
            );
            self.ctx.device.unmap_memory(self.memory);
        }
        drop(state);
        self.ctx
            .free_device_memory(self.memory_type_index, self.memory, self.size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_state_refcounts() {
        let mut state = MapState::new();
        assert!(!state.is_mapped());
        let fake = 0x1000usize as *mut c_void;

        // 0 is a no-op even when unmapped
        assert!(state.map(0, || unreachable!()).unwrap().is_null());

        let ptr = state.map(2, || Ok(fake)).unwrap();
        assert_eq!(ptr as usize, 0x1000);
        // second map must not call the device again
        let ptr = state.map(1, || unreachable!()).unwrap();
        assert_eq!(ptr as usize, 0x1000);
        assert!(state.is_mapped());

        state.unmap(2, || unreachable!()).unwrap();
        let mut unmapped = false;
        state.unmap(1, || unmapped = true).unwrap();
        assert!(unmapped);
        assert!(!state.is_mapped());

        // underflow is reported, not ignored
        assert!(state.unmap(1, || unreachable!()).is_err());
    }
}
