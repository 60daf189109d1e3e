//! User-created memory pools.

use std::sync::Arc;

use crate::list::BlockList;

/// A set of blocks with its own configuration, separate from the allocator's
/// default block lists. Created with
/// [`Allocator::create_pool`](crate::Allocator::create_pool) and destroyed
/// with [`Allocator::destroy_pool`](crate::Allocator::destroy_pool); the
/// allocator keeps the pool alive until then.
pub struct Pool {
    pub(crate) list: Arc<BlockList>,
}

impl Pool {
    /// Index of the memory type every block of this pool lives in.
    pub fn memory_type_index(&self) -> u32 {
        self.list.memory_type_index()
    }

    /// Size of each block of this pool.
    pub fn block_size(&self) -> u64 {
        self.list.preferred_block_size()
    }

    pub fn block_count(&self) -> usize {
        self.list.block_count()
    }

    /// Live allocations across the pool.
    pub fn allocation_count(&self) -> usize {
        self.list.allocation_count()
    }

    /// Evict every stale lost-eligible allocation in the pool. Returns how
    /// many were reclaimed.
    pub fn make_allocations_lost(&self) -> usize {
        let current_frame = self.list.ctx.current_frame();
        self.list.make_allocations_lost(current_frame)
    }
}
