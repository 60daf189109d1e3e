//! A growable set of memory blocks of one memory type.

use std::sync::Arc;

use ash::vk;
use log::{debug, warn};
use parking_lot::RwLock;

use crate::allocation::{AllocRecord, Allocation, AllocationKind};
use crate::block::MemoryBlock;
use crate::device::DeviceContext;
use crate::error::{Error, Result};
use crate::metadata::{AllocationRequest, BlockMetadata, RequestContext};
use crate::types::{AllocationCreateFlags, AllocationCreateInfo, Strategy, SuballocationType};

/// How many times a failed device allocation may halve the new block size
/// before giving up.
const NEW_BLOCK_SIZE_SHIFT_MAX: u32 = 3;

#[derive(Debug)]
struct BlocksState {
    blocks: Vec<Arc<MemoryBlock>>,
    /// Whether an empty block is being kept around for reuse. At most one
    /// empty block is retained beyond `min_block_count`.
    has_empty_block: bool,
    next_block_id: u64,
}

/// Owns the memory blocks of one memory type, applies placement strategy
/// across them, grows on demand and shrinks lazily on free.
pub(crate) struct BlockList {
    pub(crate) ctx: Arc<DeviceContext>,
    memory_type_index: u32,
    preferred_block_size: u64,
    min_block_count: usize,
    max_block_count: usize,
    buffer_image_granularity: u64,
    frame_in_use_count: u32,
    /// Pools carry a caller-chosen block size that is never adapted.
    explicit_block_size: bool,
    state: RwLock<BlocksState>,
}

impl BlockList {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ctx: Arc<DeviceContext>,
        memory_type_index: u32,
        preferred_block_size: u64,
        min_block_count: usize,
        max_block_count: usize,
        buffer_image_granularity: u64,
        frame_in_use_count: u32,
        explicit_block_size: bool,
    ) -> BlockList {
        BlockList {
            ctx,
            memory_type_index,
            preferred_block_size,
            min_block_count,
            max_block_count,
            buffer_image_granularity,
            frame_in_use_count,
            explicit_block_size,
            state: RwLock::new(BlocksState {
                blocks: Vec::new(),
                has_empty_block: false,
                next_block_id: 0,
            }),
        }
    }

    pub fn memory_type_index(&self) -> u32 {
        self.memory_type_index
    }

    pub fn preferred_block_size(&self) -> u64 {
        self.preferred_block_size
    }

    pub fn block_count(&self) -> usize {
        self.state.read().blocks.len()
    }

    /// Live suballocations across every block.
    pub fn allocation_count(&self) -> usize {
        self.state
            .read()
            .blocks
            .iter()
            .map(|block| block.metadata.lock().allocation_count())
            .sum()
    }

    /// Eagerly create the configured minimum number of blocks.
    pub unsafe fn create_min_blocks(self: &Arc<Self>) -> Result<()> {
        let mut state = self.state.write();
        while state.blocks.len() < self.min_block_count {
            self.new_block(&mut state, self.preferred_block_size)?;
        }
        Ok(())
    }

    fn request_context(
        &self,
        size: u64,
        alignment: u64,
        suballoc_type: SuballocationType,
        strategy: Strategy,
        can_make_other_lost: bool,
    ) -> RequestContext {
        RequestContext {
            current_frame: self.ctx.current_frame(),
            frame_in_use_count: self.frame_in_use_count,
            buffer_image_granularity: self.buffer_image_granularity,
            alloc_size: size,
            alloc_alignment: alignment,
            alloc_type: suballoc_type,
            can_make_other_lost,
            strategy,
        }
    }

    pub unsafe fn allocate(
        self: &Arc<Self>,
        size: u64,
        alignment: u64,
        info: &AllocationCreateInfo,
        suballoc_type: SuballocationType,
    ) -> Result<Allocation> {
        let mut flags = info.flags;
        // mapping is meaningless on non-host-visible memory
        if !self.ctx.is_host_visible(self.memory_type_index) {
            flags.remove(AllocationCreateFlags::MAPPED);
        }
        let strategy = Strategy::from_flags(flags)?;

        if flags.contains(AllocationCreateFlags::WITHIN_BUDGET) {
            let heap = self.ctx.heap_index(self.memory_type_index);
            let budget = self.ctx.heap_budget(heap);
            if budget.usage.saturating_add(size) > budget.budget {
                return Err(Error::OutOfDeviceMemory);
            }
        }

        let request_ctx = self.request_context(size, alignment, suballoc_type, strategy, false);

        // 1. Search existing blocks.
        {
            let state = self.state.read();
            if flags.contains(AllocationCreateFlags::NEVER_ALLOCATE)
                && state.blocks.is_empty()
                && self.min_block_count == 0
            {
                return Err(Error::OutOfDeviceMemory);
            }
            for block in self.candidate_order(&state.blocks, strategy) {
                let mut meta = block.metadata.lock();
                if let Some(request) = meta.try_create_request(&request_ctx) {
                    return self.commit(&block, &mut meta, &request, size, suballoc_type, flags);
                }
            }
        }

        // 2. Grow the list.
        let mut growth_error = None;
        if !flags.contains(AllocationCreateFlags::NEVER_ALLOCATE) {
            let mut state = self.state.write();
            // another thread may have grown the list while we waited
            for block in state.blocks.clone() {
                let mut meta = block.metadata.lock();
                if let Some(request) = meta.try_create_request(&request_ctx) {
                    return self.commit(&block, &mut meta, &request, size, suballoc_type, flags);
                }
            }
            if state.blocks.len() < self.max_block_count {
                match self.grow(&mut state, size) {
                    Ok(block) => {
                        let mut meta = block.metadata.lock();
                        match meta.try_create_request(&request_ctx) {
                            Some(request) => {
                                return self.commit(
                                    &block,
                                    &mut meta,
                                    &request,
                                    size,
                                    suballoc_type,
                                    flags,
                                );
                            }
                            None => return Err(Error::OutOfDeviceMemory),
                        }
                    }
                    Err(err) => growth_error = Some(err),
                }
            }
        }

        // 3. Evict stale lost-eligible allocations.
        if flags.contains(AllocationCreateFlags::CAN_MAKE_OTHER_LOST) {
            let lost_ctx = self.request_context(size, alignment, suballoc_type, strategy, true);
            let current_frame = lost_ctx.current_frame;
            let state = self.state.read();

            if strategy == Strategy::FirstFit {
                for block in state.blocks.iter() {
                    let mut meta = block.metadata.lock();
                    if let Some(mut request) = meta.try_create_request(&lost_ctx) {
                        if request.items_to_make_lost_count == 0
                            || meta.make_requested_lost(
                                &mut request,
                                current_frame,
                                self.frame_in_use_count,
                            )
                        {
                            return self.commit(
                                block,
                                &mut meta,
                                &request,
                                size,
                                suballoc_type,
                                flags,
                            );
                        }
                    }
                }
            } else {
                // score every block first, then re-verify cheapest-first
                // under the block lock since victims may get touched
                let mut candidates: Vec<(usize, u64)> = Vec::new();
                for (index, block) in state.blocks.iter().enumerate() {
                    let meta = block.metadata.lock();
                    if let Some(request) = meta.try_create_request(&lost_ctx) {
                        candidates.push((index, request.calc_cost()));
                    }
                }
                candidates.sort_by_key(|entry| entry.1);
                for (index, _) in candidates {
                    let block = &state.blocks[index];
                    let mut meta = block.metadata.lock();
                    if let Some(mut request) = meta.try_create_request(&lost_ctx) {
                        if request.items_to_make_lost_count == 0
                            || meta.make_requested_lost(
                                &mut request,
                                current_frame,
                                self.frame_in_use_count,
                            )
                        {
                            return self.commit(
                                block,
                                &mut meta,
                                &request,
                                size,
                                suballoc_type,
                                flags,
                            );
                        }
                    }
                }
            }
        }

        Err(growth_error.unwrap_or(Error::OutOfDeviceMemory))
    }

    /// Blocks in the order the strategy wants them tried: tightest first for
    /// best-fit, insertion order otherwise.
    fn candidate_order(
        &self,
        blocks: &[Arc<MemoryBlock>],
        strategy: Strategy,
    ) -> Vec<Arc<MemoryBlock>> {
        match strategy {
            Strategy::BestFit => {
                let mut scored: Vec<(u64, Arc<MemoryBlock>)> = blocks
                    .iter()
                    .map(|block| (block.metadata.lock().sum_free_size(), block.clone()))
                    .collect();
                scored.sort_by_key(|entry| entry.0);
                scored.into_iter().map(|entry| entry.1).collect()
            }
            _ => blocks.to_vec(),
        }
    }

    /// Commit a placement on `block` under its metadata lock.
    unsafe fn commit(
        &self,
        block: &Arc<MemoryBlock>,
        meta: &mut BlockMetadata,
        request: &AllocationRequest,
        size: u64,
        suballoc_type: SuballocationType,
        flags: AllocationCreateFlags,
    ) -> Result<Allocation> {
        let persistent_map = flags.contains(AllocationCreateFlags::MAPPED);
        let record = Arc::new(AllocRecord::new(
            self.ctx.current_frame(),
            flags.contains(AllocationCreateFlags::CAN_BECOME_LOST),
            persistent_map,
        ));
        meta.alloc(request, suballoc_type, size, record.clone());
        if persistent_map {
            if let Err(err) = block.map(1) {
                meta.free_at_offset(request.offset);
                return Err(err);
            }
        }
        let heap = self.ctx.heap_index(self.memory_type_index) as usize;
        self.ctx.budget.add_allocation(heap, size);
        debug!(
            "memory type {}: placed {size} bytes at offset {} of block {}",
            self.memory_type_index,
            request.offset,
            block.id()
        );
        Ok(Allocation {
            kind: AllocationKind::Block {
                block: block.clone(),
                offset: request.offset,
            },
            size,
            memory_type_index: self.memory_type_index,
            suballoc_type,
            record,
        })
    }

    /// Create a block sized for `alloc_size`, halving on device failure.
    unsafe fn grow(
        self: &Arc<Self>,
        state: &mut BlocksState,
        alloc_size: u64,
    ) -> Result<Arc<MemoryBlock>> {
        let mut new_block_size = self.preferred_block_size;
        let mut shift = 0u32;
        if self.explicit_block_size {
            if alloc_size > new_block_size {
                return Err(Error::OutOfDeviceMemory);
            }
        } else if alloc_size > new_block_size {
            new_block_size = alloc_size;
        } else {
            // start smaller while the list is young so light workloads do
            // not commit a full-size block up front
            let max_existing = state
                .blocks
                .iter()
                .map(|block| block.size())
                .max()
                .unwrap_or(0);
            while shift < NEW_BLOCK_SIZE_SHIFT_MAX {
                let smaller = new_block_size / 2;
                if smaller > max_existing && smaller >= alloc_size.saturating_mul(2) {
                    new_block_size = smaller;
                    shift += 1;
                } else {
                    break;
                }
            }
        }

        loop {
            match self.new_block(state, new_block_size) {
                Ok(block) => return Ok(block),
                Err(err) => {
                    if self.explicit_block_size || shift >= NEW_BLOCK_SIZE_SHIFT_MAX {
                        return Err(err);
                    }
                    let smaller = new_block_size / 2;
                    if smaller >= alloc_size {
                        new_block_size = smaller;
                        shift += 1;
                    } else {
                        return Err(err);
                    }
                }
            }
        }
    }

    unsafe fn new_block(
        self: &Arc<Self>,
        state: &mut BlocksState,
        block_size: u64,
    ) -> Result<Arc<MemoryBlock>> {
        let info = vk::MemoryAllocateInfo::default()
            .allocation_size(block_size)
            .memory_type_index(self.memory_type_index);
        let memory = self.ctx.allocate_device_memory(&info)?;
        let id = state.next_block_id;
        state.next_block_id += 1;
        let block = Arc::new(MemoryBlock::new(
            self.ctx.clone(),
            Arc::downgrade(self),
            memory,
            self.memory_type_index,
            block_size,
            id,
        ));
        debug!(
            "memory type {}: created block {id} of {block_size} bytes",
            self.memory_type_index
        );
        state.blocks.push(block.clone());
        Ok(block)
    }

    /// Return a suballocation to its block and shrink the list if that left
    /// surplus empty blocks behind.
    pub unsafe fn free(&self, allocation: &Allocation) {
        let (block, offset) = match &allocation.kind {
            AllocationKind::Block { block, offset } => (block.clone(), *offset),
            AllocationKind::Dedicated { .. } => {
                debug_assert!(false, "dedicated allocation routed to a block list");
                return;
            }
        };
        let map_refs = allocation.record.map_refs();
        if map_refs > 0 {
            if let Err(err) = block.unmap(map_refs) {
                log::error!("releasing map references on free failed: {err}");
            }
        }

        let mut state = self.state.write();
        let became_empty = {
            let mut meta = block.metadata.lock();
            meta.free_at_offset(offset);
            meta.is_empty()
        };

        let mut destroyed: Option<Arc<MemoryBlock>> = None;
        if became_empty {
            if state.has_empty_block && state.blocks.len() > self.min_block_count {
                if let Some(position) = state
                    .blocks
                    .iter()
                    .position(|candidate| Arc::ptr_eq(candidate, &block))
                {
                    destroyed = Some(state.blocks.remove(position));
                }
            } else {
                state.has_empty_block = true;
            }
        } else if state.has_empty_block && state.blocks.len() > self.min_block_count {
            // drop the newest block if it is the idle one
            if state
                .blocks
                .last()
                .map_or(false, |last| last.metadata.lock().is_empty())
            {
                destroyed = state.blocks.pop();
                state.has_empty_block = false;
            }
        }
        drop(state);

        if let Some(block) = destroyed {
            debug!(
                "memory type {}: destroying empty block {}",
                self.memory_type_index,
                block.id()
            );
            block.destroy();
        }
    }

    /// Evict every stale lost-eligible allocation in every block.
    pub fn make_allocations_lost(&self, current_frame: u32) -> usize {
        let state = self.state.read();
        let mut lost = 0;
        for block in state.blocks.iter() {
            lost += block
                .metadata
                .lock()
                .make_allocations_lost(current_frame, self.frame_in_use_count);
        }
        lost
    }

    /// Release every block. Called on allocator or pool teardown.
    pub unsafe fn destroy_blocks(&self) {
        let mut state = self.state.write();
        for block in state.blocks.drain(..) {
            let live = block.metadata.lock().allocation_count();
            if live > 0 {
                warn!(
                    "memory type {}: destroying block {} with {live} live allocations",
                    self.memory_type_index,
                    block.id()
                );
            }
            block.destroy();
        }
        state.has_empty_block = false;
    }
}
