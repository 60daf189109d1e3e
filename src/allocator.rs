//! The top-level allocator facade.

use std::ptr::NonNull;
use std::sync::Arc;

use ash::vk;
use log::{debug, warn};
use parking_lot::{Mutex, RwLock};

use crate::align::{align_down, align_up};
use crate::allocation::{
    AllocRecord, Allocation, AllocationInfo, AllocationKind, DedicatedMemory, FRAME_INDEX_LOST,
};
use crate::block::MapState;
use crate::budget::HeapBudget;
use crate::device::DeviceContext;
use crate::error::{Error, Result};
use crate::list::BlockList;
use crate::pool::Pool;
use crate::types::{
    AllocationCreateFlags, AllocationCreateInfo, AllocatorCreateInfo, MemoryUsage,
    PoolCreateFlags, PoolCreateInfo, SuballocationType,
};

/// Dedicated-allocation hints attached to a request: what the driver said
/// about the resource, and the resource itself for the allocate-info chain.
#[derive(Debug, Clone, Copy, Default)]
struct DedicatedHints {
    requires: bool,
    prefers: bool,
    buffer: Option<vk::Buffer>,
    /// Usage of `buffer` when known; `None` means unknown, which is treated
    /// as permitting a device address.
    buffer_usage: Option<vk::BufferUsageFlags>,
    image: Option<vk::Image>,
}

/// General-purpose device memory allocator. One default block list per
/// memory type, user pools, dedicated allocations, per-heap budgets and
/// lost-allocation tracking.
///
/// All device-touching operations are `unsafe`: the caller keeps the device
/// alive and honours Vulkan's external synchronisation rules for the raw
/// handles it passes in.
pub struct Allocator {
    ctx: Arc<DeviceContext>,
    preferred_large_heap_block_size: u64,
    frame_in_use_count: u32,
    global_memory_type_bits: u32,
    block_lists: Vec<Arc<BlockList>>,
    dedicated: Vec<RwLock<Vec<Arc<DedicatedMemory>>>>,
    pools: RwLock<Vec<Arc<Pool>>>,
    released: bool,
}

impl Allocator {
    pub unsafe fn new(info: AllocatorCreateInfo) -> Result<Allocator> {
        let ctx = Arc::new(DeviceContext::new(&info)?);
        let global_memory_type_bits = ctx.global_memory_type_bits(info.flags);
        let type_count = ctx.memory_type_count() as usize;

        let mut block_lists = Vec::with_capacity(type_count);
        let mut dedicated = Vec::with_capacity(type_count);
        for index in 0..type_count as u32 {
            block_lists.push(Arc::new(BlockList::new(
                ctx.clone(),
                index,
                ctx.preferred_block_size(index, info.preferred_large_heap_block_size),
                0,
                usize::MAX,
                ctx.buffer_image_granularity,
                info.frame_in_use_count,
                false,
            )));
            dedicated.push(RwLock::new(Vec::new()));
        }

        if ctx.use_ext_memory_budget {
            ctx.update_budget();
        }

        Ok(Allocator {
            ctx,
            preferred_large_heap_block_size: info.preferred_large_heap_block_size,
            frame_in_use_count: info.frame_in_use_count,
            global_memory_type_bits,
            block_lists,
            dedicated,
            pools: RwLock::new(Vec::new()),
            released: false,
        })
    }

    /// The memory properties snapshot taken at construction.
    pub fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.ctx.memory_properties
    }

    /// Frame counter used for lost-allocation decisions. Written by the host
    /// once per frame while no allocations race.
    pub fn current_frame_index(&self) -> u32 {
        self.ctx.current_frame()
    }

    pub fn set_current_frame_index(&self, frame: u32) {
        debug_assert!(frame != FRAME_INDEX_LOST);
        self.ctx.set_current_frame(frame);
    }

    /// Current usage and budget of one heap.
    pub unsafe fn heap_budget(&self, heap_index: u32) -> Result<HeapBudget> {
        if heap_index >= self.ctx.heap_count() {
            return Err(Error::InvalidArgument("heap index out of range"));
        }
        Ok(self.ctx.heap_budget(heap_index))
    }

    /// Pick the cheapest memory type admissible for `memory_type_bits` and
    /// the given options.
    pub fn find_memory_type_index(
        &self,
        memory_type_bits: u32,
        info: &AllocationCreateInfo,
    ) -> Result<u32> {
        let mut bits = memory_type_bits & self.global_memory_type_bits;
        if info.memory_type_bits != 0 {
            bits &= info.memory_type_bits;
        }
        let (required, preferred, not_preferred) = self.derive_property_sets(info);

        let mut best: Option<(u32, u32)> = None;
        for index in 0..self.ctx.memory_type_count() {
            if bits & (1 << index) == 0 {
                continue;
            }
            let flags = self.ctx.memory_type_flags(index);
            if !flags.contains(required) {
                continue;
            }
            let cost = memory_type_cost(preferred, not_preferred, flags);
            if cost == 0 {
                return Ok(index);
            }
            if best.map_or(true, |(_, best_cost)| cost < best_cost) {
                best = Some((index, cost));
            }
        }
        best.map(|(index, _)| index).ok_or(Error::FeatureNotPresent(
            "no memory type matches the requested properties",
        ))
    }

    /// Memory type selection for a buffer that would be created with
    /// `buffer_info`. Creates and destroys a throwaway buffer to query the
    /// driver's requirements.
    pub unsafe fn find_memory_type_index_for_buffer_info(
        &self,
        buffer_info: &vk::BufferCreateInfo,
        info: &AllocationCreateInfo,
    ) -> Result<u32> {
        let device = &self.ctx.device;
        let buffer = device.create_buffer(buffer_info, None).map_err(Error::from)?;
        let requirements = device.get_buffer_memory_requirements(buffer);
        device.destroy_buffer(buffer, None);
        self.find_memory_type_index(requirements.memory_type_bits, info)
    }

    /// Memory type selection for an image that would be created with
    /// `image_info`.
    pub unsafe fn find_memory_type_index_for_image_info(
        &self,
        image_info: &vk::ImageCreateInfo,
        info: &AllocationCreateInfo,
    ) -> Result<u32> {
        let device = &self.ctx.device;
        let image = device.create_image(image_info, None).map_err(Error::from)?;
        let requirements = device.get_image_memory_requirements(image);
        device.destroy_image(image, None);
        self.find_memory_type_index(requirements.memory_type_bits, info)
    }

    /// Allocate memory for requirements the caller queried themselves.
    pub unsafe fn allocate_memory(
        &self,
        requirements: &vk::MemoryRequirements,
        info: &AllocationCreateInfo,
    ) -> Result<Allocation> {
        self.allocate_internal(
            requirements,
            DedicatedHints::default(),
            info,
            SuballocationType::Unknown,
        )
    }

    /// Allocate memory fitting `buffer` and optionally bind it.
    pub unsafe fn allocate_memory_for_buffer(
        &self,
        buffer: vk::Buffer,
        info: &AllocationCreateInfo,
        bind: bool,
    ) -> Result<Allocation> {
        let (requirements, requires, prefers) = self.buffer_requirements(buffer);
        let hints = DedicatedHints {
            requires,
            prefers,
            buffer: Some(buffer),
            buffer_usage: None,
            image: None,
        };
        let allocation =
            self.allocate_internal(&requirements, hints, info, SuballocationType::Buffer)?;
        if bind {
            if let Err(err) = self.bind_buffer_memory(&allocation, buffer) {
                self.free_memory(allocation);
                return Err(err);
            }
        }
        Ok(allocation)
    }

    /// Allocate memory fitting `image` and optionally bind it.
    pub unsafe fn allocate_memory_for_image(
        &self,
        image: vk::Image,
        info: &AllocationCreateInfo,
        bind: bool,
    ) -> Result<Allocation> {
        let (requirements, requires, prefers) = self.image_requirements(image);
        let hints = DedicatedHints {
            requires,
            prefers,
            buffer: None,
            buffer_usage: None,
            image: Some(image),
        };
        let allocation =
            self.allocate_internal(&requirements, hints, info, SuballocationType::ImageUnknown)?;
        if bind {
            if let Err(err) = self.bind_image_memory(&allocation, image) {
                self.free_memory(allocation);
                return Err(err);
            }
        }
        Ok(allocation)
    }

    /// Create a buffer, allocate memory for it and bind the two together
    /// (unless `DONT_BIND` is set). Rolls back on any partial failure.
    pub unsafe fn create_buffer(
        &self,
        buffer_info: &vk::BufferCreateInfo,
        alloc_info: &AllocationCreateInfo,
    ) -> Result<(vk::Buffer, Allocation)> {
        if buffer_info.size == 0 {
            return Err(Error::InvalidArgument("buffer size is zero"));
        }
        let device = &self.ctx.device;
        let buffer = device.create_buffer(buffer_info, None).map_err(Error::from)?;
        let (requirements, requires, prefers) = self.buffer_requirements(buffer);
        let hints = DedicatedHints {
            requires,
            prefers,
            buffer: Some(buffer),
            buffer_usage: Some(buffer_info.usage),
            image: None,
        };
        let allocation =
            match self.allocate_internal(&requirements, hints, alloc_info, SuballocationType::Buffer)
            {
                Ok(allocation) => allocation,
                Err(err) => {
                    device.destroy_buffer(buffer, None);
                    return Err(err);
                }
            };
        if !alloc_info.flags.contains(AllocationCreateFlags::DONT_BIND) {
            if let Err(err) = self.bind_buffer_memory(&allocation, buffer) {
                self.free_memory(allocation);
                device.destroy_buffer(buffer, None);
                return Err(err);
            }
        }
        Ok((buffer, allocation))
    }

    /// Create an image, allocate memory for it and bind the two together
    /// (unless `DONT_BIND` is set). Rolls back on any partial failure.
    pub unsafe fn create_image(
        &self,
        image_info: &vk::ImageCreateInfo,
        alloc_info: &AllocationCreateInfo,
    ) -> Result<(vk::Image, Allocation)> {
        if image_info.extent.width == 0
            || image_info.extent.height == 0
            || image_info.extent.depth == 0
            || image_info.mip_levels == 0
            || image_info.array_layers == 0
        {
            return Err(Error::InvalidArgument(
                "image has zero extent, mip count or layer count",
            ));
        }
        let device = &self.ctx.device;
        let image = device.create_image(image_info, None).map_err(Error::from)?;
        let suballoc_type = if image_info.tiling == vk::ImageTiling::OPTIMAL {
            SuballocationType::ImageOptimal
        } else {
            SuballocationType::ImageLinear
        };
        let (requirements, requires, prefers) = self.image_requirements(image);
        let hints = DedicatedHints {
            requires,
            prefers,
            buffer: None,
            buffer_usage: None,
            image: Some(image),
        };
        let allocation = match self.allocate_internal(&requirements, hints, alloc_info, suballoc_type)
        {
            Ok(allocation) => allocation,
            Err(err) => {
                device.destroy_image(image, None);
                return Err(err);
            }
        };
        if !alloc_info.flags.contains(AllocationCreateFlags::DONT_BIND) {
            if let Err(err) = self.bind_image_memory(&allocation, image) {
                self.free_memory(allocation);
                device.destroy_image(image, None);
                return Err(err);
            }
        }
        Ok((image, allocation))
    }

    /// Bind `buffer` at the start of `allocation`.
    pub unsafe fn bind_buffer_memory(
        &self,
        allocation: &Allocation,
        buffer: vk::Buffer,
    ) -> Result<()> {
        self.bind_buffer_memory2(allocation, 0, buffer)
    }

    /// Bind `buffer` at `local_offset` bytes into `allocation`.
    pub unsafe fn bind_buffer_memory2(
        &self,
        allocation: &Allocation,
        local_offset: u64,
        buffer: vk::Buffer,
    ) -> Result<()> {
        match &allocation.kind {
            AllocationKind::Block { block, offset } => {
                block.bind_buffer(offset + local_offset, buffer)
            }
            AllocationKind::Dedicated { memory } => self
                .ctx
                .device
                .bind_buffer_memory(buffer, memory.memory, local_offset)
                .map_err(Error::from),
        }
    }

    /// Bind `image` at the start of `allocation`.
    pub unsafe fn bind_image_memory(
        &self,
        allocation: &Allocation,
        image: vk::Image,
    ) -> Result<()> {
        self.bind_image_memory2(allocation, 0, image)
    }

    /// Bind `image` at `local_offset` bytes into `allocation`.
    pub unsafe fn bind_image_memory2(
        &self,
        allocation: &Allocation,
        local_offset: u64,
        image: vk::Image,
    ) -> Result<()> {
        match &allocation.kind {
            AllocationKind::Block { block, offset } => {
                block.bind_image(offset + local_offset, image)
            }
            AllocationKind::Dedicated { memory } => self
                .ctx
                .device
                .bind_image_memory(image, memory.memory, local_offset)
                .map_err(Error::from),
        }
    }

    /// Return an allocation to the allocator. Freeing a lost allocation only
    /// releases bookkeeping; the underlying range was reclaimed already.
    pub unsafe fn free_memory(&self, allocation: Allocation) {
        let live = allocation
            .record
            .touch(self.ctx.current_frame(), self.frame_in_use_count);
        if live {
            match &allocation.kind {
                AllocationKind::Block { block, .. } => match block.owner() {
                    Some(list) => list.free(&allocation),
                    None => warn!("freeing an allocation whose block list no longer exists"),
                },
                AllocationKind::Dedicated { memory } => {
                    let map_refs = allocation.record.map_refs();
                    if map_refs > 0 {
                        if let Err(err) = memory.unmap(&self.ctx.device, map_refs) {
                            log::error!("releasing map references on free failed: {err}");
                        }
                    }
                    let index = memory.memory_type_index;
                    {
                        let mut registry = self.dedicated[index as usize].write();
                        match registry.iter().position(|entry| Arc::ptr_eq(entry, memory)) {
                            Some(position) => {
                                registry.remove(position);
                            }
                            None => debug_assert!(false, "dedicated allocation not registered"),
                        }
                    }
                    self.ctx.free_device_memory(index, memory.memory, memory.size);
                    debug!("freed dedicated allocation of {} bytes, type {index}", memory.size);
                }
            }
        }
        let heap = self.ctx.heap_index(allocation.memory_type_index) as usize;
        self.ctx.budget.remove_allocation(heap, allocation.size);
    }

    /// Map the allocation and return a pointer to its first byte. Each
    /// successful map must be balanced by an
    /// [`unmap_memory`](Allocator::unmap_memory).
    pub unsafe fn map_memory(&self, allocation: &Allocation) -> Result<*mut u8> {
        if allocation.is_lost() {
            return Err(Error::MapFailed(vk::Result::ERROR_MEMORY_MAP_FAILED));
        }
        let ptr = match &allocation.kind {
            AllocationKind::Block { block, offset } => {
                let base = block.map(1)?;
                base.add(*offset as usize)
            }
            AllocationKind::Dedicated { memory } => memory.map(&self.ctx.device, 1)?,
        };
        allocation.record.add_map_ref();
        Ok(ptr)
    }

    pub unsafe fn unmap_memory(&self, allocation: &Allocation) -> Result<()> {
        allocation.record.remove_map_ref()?;
        match &allocation.kind {
            AllocationKind::Block { block, .. } => block.unmap(1),
            AllocationKind::Dedicated { memory } => memory.unmap(&self.ctx.device, 1),
        }
    }

    /// Flush a range of a host-visible allocation. A no-op on host-coherent
    /// memory.
    pub unsafe fn flush_allocation(
        &self,
        allocation: &Allocation,
        offset: u64,
        size: u64,
    ) -> Result<()> {
        if let Some(range) = self.host_range(allocation, offset, size)? {
            self.ctx
                .device
                .flush_mapped_memory_ranges(&[range])
                .map_err(Error::from)?;
        }
        Ok(())
    }

    /// Invalidate a range of a host-visible allocation. A no-op on
    /// host-coherent memory.
    pub unsafe fn invalidate_allocation(
        &self,
        allocation: &Allocation,
        offset: u64,
        size: u64,
    ) -> Result<()> {
        if let Some(range) = self.host_range(allocation, offset, size)? {
            self.ctx
                .device
                .invalidate_mapped_memory_ranges(&[range])
                .map_err(Error::from)?;
        }
        Ok(())
    }

    /// Record a use of the allocation in the current frame. Returns false if
    /// it is lost.
    pub fn touch_allocation(&self, allocation: &Allocation) -> bool {
        allocation
            .record
            .touch(self.ctx.current_frame(), self.frame_in_use_count)
    }

    /// Snapshot the allocation. Counts as a touch.
    pub fn get_allocation_info(&self, allocation: &Allocation) -> AllocationInfo {
        let _ = self.touch_allocation(allocation);
        let mapped_ptr = if allocation.record.map_refs() > 0 {
            match &allocation.kind {
                AllocationKind::Block { block, offset } => block
                    .mapped_ptr()
                    .and_then(|base| NonNull::new(base.as_ptr().wrapping_add(*offset as usize))),
                AllocationKind::Dedicated { memory } => memory.map_state.lock().mapped_ptr(),
            }
        } else {
            None
        };
        AllocationInfo {
            memory_type_index: allocation.memory_type_index,
            device_memory: allocation.device_memory(),
            offset: allocation.offset(),
            size: allocation.size,
            mapped_ptr,
        }
    }

    /// Create a pool with its own block configuration.
    pub unsafe fn create_pool(&self, info: &PoolCreateInfo) -> Result<Arc<Pool>> {
        if info.memory_type_index >= self.ctx.memory_type_count() {
            return Err(Error::InvalidArgument("memory type index out of range"));
        }
        if self.global_memory_type_bits & (1 << info.memory_type_index) == 0 {
            return Err(Error::InvalidArgument(
                "memory type is excluded on this allocator",
            ));
        }
        if info
            .flags
            .intersects(PoolCreateFlags::LINEAR_ALGORITHM | PoolCreateFlags::BUDDY_ALGORITHM)
        {
            return Err(Error::FeatureNotPresent(
                "alternative pool algorithms are not implemented",
            ));
        }
        if info.max_block_count != 0 && info.min_block_count > info.max_block_count {
            return Err(Error::InvalidArgument(
                "pool min block count exceeds max block count",
            ));
        }
        let explicit_block_size = info.block_size != 0;
        let block_size = if explicit_block_size {
            info.block_size
        } else {
            self.ctx
                .preferred_block_size(info.memory_type_index, self.preferred_large_heap_block_size)
        };
        let granularity = if info
            .flags
            .contains(PoolCreateFlags::IGNORE_BUFFER_IMAGE_GRANULARITY)
        {
            1
        } else {
            self.ctx.buffer_image_granularity
        };
        let max_block_count = if info.max_block_count == 0 {
            usize::MAX
        } else {
            info.max_block_count
        };
        let list = Arc::new(BlockList::new(
            self.ctx.clone(),
            info.memory_type_index,
            block_size,
            info.min_block_count,
            max_block_count,
            granularity,
            info.frame_in_use_count,
            explicit_block_size,
        ));
        list.create_min_blocks()?;
        let pool = Arc::new(Pool { list });
        self.pools.write().push(pool.clone());
        debug!(
            "created pool on memory type {} with block size {block_size}",
            info.memory_type_index
        );
        Ok(pool)
    }

    /// Tear a pool down and release its blocks. Live allocations from the
    /// pool become dangling and may only be freed, not used.
    pub unsafe fn destroy_pool(&self, pool: &Arc<Pool>) {
        {
            let mut pools = self.pools.write();
            match pools.iter().position(|entry| Arc::ptr_eq(entry, pool)) {
                Some(position) => {
                    pools.remove(position);
                }
                None => {
                    warn!("destroying a pool this allocator does not own");
                    return;
                }
            }
        }
        let live = pool.allocation_count();
        if live > 0 {
            warn!("destroying pool with {live} live allocations");
        }
        pool.list.destroy_blocks();
    }

    /// Release every default block. Fails while pools or dedicated
    /// allocations remain.
    pub unsafe fn dispose(&mut self) -> Result<()> {
        if !self.pools.read().is_empty() {
            return Err(Error::Validation("pools remain at allocator disposal"));
        }
        if self.dedicated.iter().any(|list| !list.read().is_empty()) {
            return Err(Error::Validation(
                "dedicated allocations remain at allocator disposal",
            ));
        }
        self.release();
        Ok(())
    }

    unsafe fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        for list in &self.block_lists {
            let live = list.allocation_count();
            if live > 0 {
                warn!(
                    "memory type {}: {live} allocations leaked",
                    list.memory_type_index()
                );
            }
            list.destroy_blocks();
        }
    }

    fn derive_property_sets(
        &self,
        info: &AllocationCreateInfo,
    ) -> (
        vk::MemoryPropertyFlags,
        vk::MemoryPropertyFlags,
        vk::MemoryPropertyFlags,
    ) {
        let mut required = info.required_flags;
        let mut preferred = info.preferred_flags;
        let mut not_preferred = vk::MemoryPropertyFlags::empty();
        match info.usage {
            MemoryUsage::Unknown => {}
            MemoryUsage::GpuOnly => {
                // on integrated GPUs a host-visible preference already names
                // the only memory there is; forcing DEVICE_LOCAL on top
                // would skew the scoring for nothing
                if !self.ctx.is_integrated_gpu()
                    || !preferred.contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
                {
                    preferred |= vk::MemoryPropertyFlags::DEVICE_LOCAL;
                }
            }
            MemoryUsage::CpuOnly => {
                required |= vk::MemoryPropertyFlags::HOST_VISIBLE
                    | vk::MemoryPropertyFlags::HOST_COHERENT;
            }
            MemoryUsage::CpuToGpu => {
                required |= vk::MemoryPropertyFlags::HOST_VISIBLE;
                if !self.ctx.is_integrated_gpu()
                    || !preferred.contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
                {
                    preferred |= vk::MemoryPropertyFlags::DEVICE_LOCAL;
                }
            }
            MemoryUsage::GpuToCpu => {
                required |= vk::MemoryPropertyFlags::HOST_VISIBLE;
                preferred |= vk::MemoryPropertyFlags::HOST_CACHED;
            }
            MemoryUsage::CpuCopy => {
                not_preferred |= vk::MemoryPropertyFlags::DEVICE_LOCAL;
            }
            MemoryUsage::GpuLazilyAllocated => {
                required |= vk::MemoryPropertyFlags::LAZILY_ALLOCATED;
            }
        }
        (required, preferred, not_preferred)
    }

    unsafe fn allocate_internal(
        &self,
        requirements: &vk::MemoryRequirements,
        hints: DedicatedHints,
        info: &AllocationCreateInfo,
        suballoc_type: SuballocationType,
    ) -> Result<Allocation> {
        if requirements.size == 0 {
            return Err(Error::InvalidArgument("allocation size is zero"));
        }
        if requirements.alignment != 0 && !requirements.alignment.is_power_of_two() {
            return Err(Error::InvalidArgument("alignment is not a power of two"));
        }
        let flags = info.flags;
        if flags.contains(
            AllocationCreateFlags::DEDICATED_MEMORY | AllocationCreateFlags::NEVER_ALLOCATE,
        ) {
            return Err(Error::InvalidArgument(
                "DEDICATED_MEMORY and NEVER_ALLOCATE are mutually exclusive",
            ));
        }
        if flags.contains(AllocationCreateFlags::MAPPED | AllocationCreateFlags::CAN_BECOME_LOST) {
            return Err(Error::InvalidArgument(
                "MAPPED and CAN_BECOME_LOST are mutually exclusive",
            ));
        }
        if info.pool.is_some() && flags.contains(AllocationCreateFlags::DEDICATED_MEMORY) {
            return Err(Error::InvalidArgument(
                "DEDICATED_MEMORY cannot be combined with a pool",
            ));
        }
        if hints.requires && flags.contains(AllocationCreateFlags::NEVER_ALLOCATE) {
            return Err(Error::InvalidArgument(
                "resource requires a dedicated allocation but NEVER_ALLOCATE is set",
            ));
        }
        if flags.contains(AllocationCreateFlags::UPPER_ADDRESS) {
            return Err(Error::FeatureNotPresent(
                "upper-address placement requires the linear algorithm",
            ));
        }

        if let Some(pool) = &info.pool {
            let type_index = pool.list.memory_type_index();
            if requirements.memory_type_bits & (1 << type_index) == 0 {
                return Err(Error::InvalidArgument(
                    "pool memory type is not allowed by the resource requirements",
                ));
            }
            let alignment = requirements
                .alignment
                .max(self.ctx.min_alignment(type_index))
                .max(1);
            return pool
                .list
                .allocate(requirements.size, alignment, info, suballoc_type);
        }

        let mut bits = requirements.memory_type_bits & self.global_memory_type_bits;
        if info.memory_type_bits != 0 {
            bits &= info.memory_type_bits;
        }
        let mut last_error: Option<Error> = None;
        loop {
            let index = match self.find_memory_type_index(bits, info) {
                Ok(index) => index,
                Err(err) => return Err(last_error.unwrap_or(err)),
            };
            match self.allocate_of_type(index, requirements, hints, info, suballoc_type) {
                Ok(allocation) => return Ok(allocation),
                Err(err) => {
                    last_error = Some(err);
                    bits &= !(1 << index);
                }
            }
        }
    }

    unsafe fn allocate_of_type(
        &self,
        index: u32,
        requirements: &vk::MemoryRequirements,
        hints: DedicatedHints,
        info: &AllocationCreateInfo,
        suballoc_type: SuballocationType,
    ) -> Result<Allocation> {
        let list = &self.block_lists[index as usize];
        let flags = info.flags;
        let size = requirements.size;
        let alignment = requirements
            .alignment
            .max(self.ctx.min_alignment(index))
            .max(1);

        if flags.contains(AllocationCreateFlags::CAN_BECOME_LOST) {
            // lost-eligible allocations live in blocks, where reclaiming a
            // range is meaningful
            return list.allocate(size, alignment, info, suballoc_type);
        }

        let dedicated_only = flags.contains(AllocationCreateFlags::DEDICATED_MEMORY)
            || info.usage == MemoryUsage::GpuLazilyAllocated;
        let prefer_dedicated =
            hints.requires || hints.prefers || size > list.preferred_block_size() / 2;

        let mut tried_dedicated = false;
        if dedicated_only || prefer_dedicated {
            if flags.contains(AllocationCreateFlags::NEVER_ALLOCATE) {
                if dedicated_only {
                    return Err(Error::OutOfDeviceMemory);
                }
            } else {
                match self.allocate_dedicated(index, size, hints, info, suballoc_type) {
                    Ok(allocation) => return Ok(allocation),
                    Err(err) => {
                        if dedicated_only {
                            return Err(err);
                        }
                        tried_dedicated = true;
                    }
                }
            }
        }

        match list.allocate(size, alignment, info, suballoc_type) {
            Ok(allocation) => Ok(allocation),
            Err(err) => {
                if flags.contains(AllocationCreateFlags::NEVER_ALLOCATE) || tried_dedicated {
                    Err(err)
                } else {
                    self.allocate_dedicated(index, size, hints, info, suballoc_type)
                }
            }
        }
    }

    unsafe fn allocate_dedicated(
        &self,
        index: u32,
        size: u64,
        hints: DedicatedHints,
        info: &AllocationCreateInfo,
        suballoc_type: SuballocationType,
    ) -> Result<Allocation> {
        let heap = self.ctx.heap_index(index);
        if info.flags.contains(AllocationCreateFlags::WITHIN_BUDGET) {
            let budget = self.ctx.heap_budget(heap);
            if budget.usage.saturating_add(size) > budget.budget {
                return Err(Error::OutOfDeviceMemory);
            }
        }

        let mut dedicated_info = vk::MemoryDedicatedAllocateInfo::default();
        let mut flags_info = vk::MemoryAllocateFlagsInfo::default()
            .flags(vk::MemoryAllocateFlags::DEVICE_ADDRESS);
        let mut alloc_info = vk::MemoryAllocateInfo::default()
            .allocation_size(size)
            .memory_type_index(index);
        if let Some(buffer) = hints.buffer {
            dedicated_info = dedicated_info.buffer(buffer);
            alloc_info = alloc_info.push_next(&mut dedicated_info);
        } else if let Some(image) = hints.image {
            dedicated_info = dedicated_info.image(image);
            alloc_info = alloc_info.push_next(&mut dedicated_info);
        }
        let permits_device_address = hints.image.is_none()
            && hints.buffer_usage.map_or(true, |usage| {
                usage.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS)
            });
        if self.ctx.use_buffer_device_address && permits_device_address {
            alloc_info = alloc_info.push_next(&mut flags_info);
        }

        let memory = self.ctx.allocate_device_memory(&alloc_info)?;
        let persistent_map = info.flags.contains(AllocationCreateFlags::MAPPED)
            && self.ctx.is_host_visible(index);
        let dedicated = Arc::new(DedicatedMemory {
            memory,
            memory_type_index: index,
            size,
            map_state: Mutex::new(MapState::new()),
        });
        if persistent_map {
            if let Err(err) = dedicated.map(&self.ctx.device, 1) {
                self.ctx.free_device_memory(index, memory, size);
                return Err(err);
            }
        }
        self.dedicated[index as usize].write().push(dedicated.clone());
        self.ctx.budget.add_allocation(heap as usize, size);
        debug!("allocated dedicated memory of {size} bytes, type {index}");

        let record = Arc::new(AllocRecord::new(
            self.ctx.current_frame(),
            false,
            persistent_map,
        ));
        Ok(Allocation {
            kind: AllocationKind::Dedicated { memory: dedicated },
            size,
            memory_type_index: index,
            suballoc_type,
            record,
        })
    }

    unsafe fn buffer_requirements(
        &self,
        buffer: vk::Buffer,
    ) -> (vk::MemoryRequirements, bool, bool) {
        let info = vk::BufferMemoryRequirementsInfo2::default().buffer(buffer);
        let mut dedicated = vk::MemoryDedicatedRequirements::default();
        let mut out = vk::MemoryRequirements2::default().push_next(&mut dedicated);
        self.ctx
            .device
            .get_buffer_memory_requirements2(&info, &mut out);
        let requirements = out.memory_requirements;
        drop(out);
        (
            requirements,
            dedicated.requires_dedicated_allocation == vk::TRUE,
            dedicated.prefers_dedicated_allocation == vk::TRUE,
        )
    }

    unsafe fn image_requirements(&self, image: vk::Image) -> (vk::MemoryRequirements, bool, bool) {
        let info = vk::ImageMemoryRequirementsInfo2::default().image(image);
        let mut dedicated = vk::MemoryDedicatedRequirements::default();
        let mut out = vk::MemoryRequirements2::default().push_next(&mut dedicated);
        self.ctx
            .device
            .get_image_memory_requirements2(&info, &mut out);
        let requirements = out.memory_requirements;
        drop(out);
        (
            requirements,
            dedicated.requires_dedicated_allocation == vk::TRUE,
            dedicated.prefers_dedicated_allocation == vk::TRUE,
        )
    }

    /// Range to flush or invalidate for `[offset, offset+size)` of the
    /// allocation, aligned to `nonCoherentAtomSize`. `None` when the memory
    /// is host-coherent and needs neither.
    fn host_range(
        &self,
        allocation: &Allocation,
        offset: u64,
        size: u64,
    ) -> Result<Option<vk::MappedMemoryRange>> {
        let flags = self.ctx.memory_type_flags(allocation.memory_type_index);
        if !flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE) {
            return Err(Error::InvalidArgument("memory is not host-visible"));
        }
        if flags.contains(vk::MemoryPropertyFlags::HOST_COHERENT) {
            return Ok(None);
        }
        if offset > allocation.size {
            return Err(Error::InvalidArgument("range starts outside the allocation"));
        }
        let size = if size == vk::WHOLE_SIZE {
            allocation.size - offset
        } else {
            if offset + size > allocation.size {
                return Err(Error::InvalidArgument("range ends outside the allocation"));
            }
            size
        };
        let atom = self.ctx.non_coherent_atom_size.max(1);
        let base = allocation.offset();
        let memory_size = match &allocation.kind {
            AllocationKind::Block { block, .. } => block.size(),
            AllocationKind::Dedicated { memory } => memory.size,
        };
        let start = align_down(base + offset, atom);
        let aligned_end = align_up(base + offset + size, atom);
        let range_size = if aligned_end >= memory_size {
            vk::WHOLE_SIZE
        } else {
            aligned_end - start
        };
        Ok(Some(
            vk::MappedMemoryRange::default()
                .memory(allocation.device_memory())
                .offset(start)
                .size(range_size),
        ))
    }
}

impl Drop for Allocator {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        unsafe {
            let pools: Vec<Arc<Pool>> = self.pools.write().drain(..).collect();
            if !pools.is_empty() {
                warn!("allocator dropped with {} live pools", pools.len());
                for pool in pools {
                    pool.list.destroy_blocks();
                }
            }
            for (index, registry) in self.dedicated.iter().enumerate() {
                for entry in registry.write().drain(..) {
                    warn!(
                        "allocator dropped with a live dedicated allocation of {} bytes, type {index}",
                        entry.size
                    );
                    self.ctx
                        .free_device_memory(index as u32, entry.memory, entry.size);
                }
            }
            self.release();
        }
    }
}

/// Cost of placing an allocation in a memory type with `flags`: one point
/// per missing preferred bit plus one per present not-preferred bit.
fn memory_type_cost(
    preferred: vk::MemoryPropertyFlags,
    not_preferred: vk::MemoryPropertyFlags,
    flags: vk::MemoryPropertyFlags,
) -> u32 {
    (preferred & !flags).as_raw().count_ones() + (flags & not_preferred).as_raw().count_ones()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cost_counts_missing_preferred_and_present_avoided() {
        let dl = vk::MemoryPropertyFlags::DEVICE_LOCAL;
        let hv = vk::MemoryPropertyFlags::HOST_VISIBLE;
        let hc = vk::MemoryPropertyFlags::HOST_COHERENT;

        assert_eq!(memory_type_cost(dl, vk::MemoryPropertyFlags::empty(), dl), 0);
        assert_eq!(memory_type_cost(dl, vk::MemoryPropertyFlags::empty(), hv), 1);
        assert_eq!(
            memory_type_cost(dl | hc, vk::MemoryPropertyFlags::empty(), hv),
            2
        );
        // a present not-preferred bit costs as much as a missing preferred
        assert_eq!(memory_type_cost(vk::MemoryPropertyFlags::empty(), dl, dl | hv), 1);
        assert_eq!(memory_type_cost(hv, dl, dl), 2);
    }
}
