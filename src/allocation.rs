//! The client-visible allocation handle and its shared frame-tracking state.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use ash::vk;

use crate::block::{MapState, MemoryBlock};
use crate::error::{Error, Result};
use crate::types::SuballocationType;

use parking_lot::Mutex;

/// Sentinel value of `last_use_frame` marking an allocation as lost. Once
/// stored it is never overwritten.
pub(crate) const FRAME_INDEX_LOST: u32 = u32::MAX;

/// High bit of the map counter: the allocation is persistently mapped and
/// holds one extra map reference on its memory.
pub(crate) const MAP_COUNT_PERSISTENT: u32 = 1 << 31;

/// State shared between an [`Allocation`] handle and the suballocation record
/// inside its block's metadata. Keeping it behind one `Arc` breaks the
/// handle-to-block-to-handle reference cycle: the metadata only ever sees
/// this record, never the `Allocation` itself.
#[derive(Debug)]
pub(crate) struct AllocRecord {
    /// Frame index of the most recent touch, or [`FRAME_INDEX_LOST`].
    last_use_frame: AtomicU32,
    can_become_lost: bool,
    /// Low 31 bits: explicit map refcount. High bit: persistently mapped.
    map_count: AtomicU32,
}

impl AllocRecord {
    pub fn new(current_frame: u32, can_become_lost: bool, persistent_map: bool) -> AllocRecord {
        AllocRecord {
            last_use_frame: AtomicU32::new(current_frame),
            can_become_lost,
            map_count: AtomicU32::new(if persistent_map { MAP_COUNT_PERSISTENT } else { 0 }),
        }
    }

    pub fn can_become_lost(&self) -> bool {
        self.can_become_lost
    }

    pub fn is_lost(&self) -> bool {
        self.last_use_frame.load(Ordering::Acquire) == FRAME_INDEX_LOST
    }

    /// Whether the allocation has gone untouched long enough to be evicted.
    pub fn is_stale(&self, current_frame: u32, frame_in_use_count: u32) -> bool {
        let frame = self.last_use_frame.load(Ordering::Acquire);
        frame != FRAME_INDEX_LOST
            && (frame as u64 + frame_in_use_count as u64) < current_frame as u64
    }

    /// Record a use in `current_frame`. Returns false if the allocation is
    /// already lost. A racing [`AllocRecord::make_lost`] and a racing touch
    /// cannot both succeed.
    pub fn touch(&self, current_frame: u32, _frame_in_use_count: u32) -> bool {
        if !self.can_become_lost {
            self.last_use_frame.store(current_frame, Ordering::Release);
            return true;
        }
        let mut frame = self.last_use_frame.load(Ordering::Acquire);
        loop {
            if frame == FRAME_INDEX_LOST {
                return false;
            }
            if frame == current_frame {
                return true;
            }
            match self.last_use_frame.compare_exchange_weak(
                frame,
                current_frame,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => frame = observed,
            }
        }
    }

    /// Transition to lost if still stale. Returns false if the allocation was
    /// touched since it was selected as a victim, or is lost already.
    pub fn make_lost(&self, current_frame: u32, frame_in_use_count: u32) -> bool {
        debug_assert!(self.can_become_lost);
        let mut frame = self.last_use_frame.load(Ordering::Acquire);
        loop {
            if frame == FRAME_INDEX_LOST {
                return false;
            }
            if (frame as u64 + frame_in_use_count as u64) >= current_frame as u64 {
                return false;
            }
            match self.last_use_frame.compare_exchange_weak(
                frame,
                FRAME_INDEX_LOST,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => frame = observed,
            }
        }
    }

    /// Map references held on the underlying memory, counting the persistent
    /// bit as one.
    pub fn map_refs(&self) -> u32 {
        let count = self.map_count.load(Ordering::Acquire);
        (count & !MAP_COUNT_PERSISTENT) + u32::from(count & MAP_COUNT_PERSISTENT != 0)
    }

    pub fn add_map_ref(&self) {
        self.map_count.fetch_add(1, Ordering::AcqRel);
    }

    pub fn remove_map_ref(&self) -> Result<()> {
        let mut count = self.map_count.load(Ordering::Acquire);
        loop {
            if count & !MAP_COUNT_PERSISTENT == 0 {
                return Err(Error::Validation(
                    "allocation unmapped more times than mapped",
                ));
            }
            match self.map_count.compare_exchange_weak(
                count,
                count - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(observed) => count = observed,
            }
        }
    }
}

/// A dedicated `VkDeviceMemory` owned by exactly one allocation.
#[derive(Debug)]
pub(crate) struct DedicatedMemory {
    pub memory: vk::DeviceMemory,
    pub memory_type_index: u32,
    pub size: u64,
    pub map_state: Mutex<MapState>,
}

// The raw mapped pointer is only dereferenced by the caller; handing it
// across threads is the caller's contract with Vulkan.
unsafe impl Send for DedicatedMemory {}
unsafe impl Sync for DedicatedMemory {}

impl DedicatedMemory {
    pub unsafe fn map(&self, device: &ash::Device, count: u32) -> Result<*mut u8> {
        let mut state = self.map_state.lock();
        state.map(count, || {
            device
                .map_memory(self.memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
                .map_err(Error::MapFailed)
        })
    }

    pub unsafe fn unmap(&self, device: &ash::Device, count: u32) -> Result<()> {
        let mut state = self.map_state.lock();
        state.unmap(count, || device.unmap_memory(self.memory))
    }
}

#[derive(Debug)]
pub(crate) enum AllocationKind {
    /// A suballocation inside a shared block.
    Block {
        block: Arc<MemoryBlock>,
        offset: u64,
    },
    /// A whole device memory of its own.
    Dedicated { memory: Arc<DedicatedMemory> },
}

/// A committed region of device memory, either a suballocation within a
/// shared block or a dedicated device allocation. Obtained from
/// [`Allocator`](crate::Allocator) and returned to it via
/// [`Allocator::free_memory`](crate::Allocator::free_memory).
#[derive(Debug)]
pub struct Allocation {
    pub(crate) kind: AllocationKind,
    pub(crate) size: u64,
    pub(crate) memory_type_index: u32,
    pub(crate) suballoc_type: SuballocationType,
    pub(crate) record: Arc<AllocRecord>,
}

impl Allocation {
    /// The size of this allocation.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Offset within the underlying device memory. Always 0 for dedicated
    /// allocations.
    pub fn offset(&self) -> u64 {
        match &self.kind {
            AllocationKind::Block { offset, .. } => *offset,
            AllocationKind::Dedicated { .. } => 0,
        }
    }

    /// The underlying device memory handle.
    pub fn device_memory(&self) -> vk::DeviceMemory {
        match &self.kind {
            AllocationKind::Block { block, .. } => block.memory(),
            AllocationKind::Dedicated { memory } => memory.memory,
        }
    }

    /// Index of the memory type this allocation lives in.
    pub fn memory_type_index(&self) -> u32 {
        self.memory_type_index
    }

    /// Whether the allocator has reclaimed this allocation.
    pub fn is_lost(&self) -> bool {
        self.record.is_lost()
    }

    pub(crate) fn is_dedicated(&self) -> bool {
        matches!(self.kind, AllocationKind::Dedicated { .. })
    }
}

/// Snapshot of an allocation, as reported by
/// [`Allocator::get_allocation_info`](crate::Allocator::get_allocation_info).
#[derive(Debug, Clone, Copy)]
pub struct AllocationInfo {
    pub memory_type_index: u32,
    pub device_memory: vk::DeviceMemory,
    pub offset: u64,
    pub size: u64,
    /// Base pointer of the allocation if its memory is currently mapped.
    pub mapped_ptr: Option<std::ptr::NonNull<u8>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn touch_tracks_frames() {
        let rec = AllocRecord::new(4, true, false);
        assert!(!rec.is_lost());
        assert!(rec.touch(5, 2));
        assert!(!rec.is_stale(6, 2));
        assert!(rec.is_stale(8, 2));
    }

    #[test]
    fn make_lost_respects_recent_use() {
        let rec = AllocRecord::new(0, true, false);
        // still inside the in-use window
        assert!(!rec.make_lost(2, 2));
        assert!(!rec.is_lost());
        // stale now
        assert!(rec.make_lost(3, 2));
        assert!(rec.is_lost());
        // lost is terminal
        assert!(!rec.touch(10, 2));
        assert!(!rec.make_lost(10, 2));
    }

    #[test]
    fn touch_non_lost_eligible_always_succeeds() {
        let rec = AllocRecord::new(0, false, false);
        assert!(rec.touch(100, 0));
        assert!(rec.touch(3, 0));
    }

    #[test]
    fn map_refcounting() {
        let rec = AllocRecord::new(0, false, true);
        assert_eq!(rec.map_refs(), 1);
        rec.add_map_ref();
        rec.add_map_ref();
        assert_eq!(rec.map_refs(), 3);
        rec.remove_map_ref().unwrap();
        rec.remove_map_ref().unwrap();
        assert_eq!(rec.map_refs(), 1);
        // the persistent reference is not released by unmap
        assert!(rec.remove_map_ref().is_err());
    }
}
