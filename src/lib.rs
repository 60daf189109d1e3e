//! General-purpose suballocator for Vulkan device memory.
//!
//! Device memory is expensive to allocate and available only in small
//! numbers, so this crate amortises a few large `VkDeviceMemory` blocks into
//! many fine-grained allocations: an [`Allocator`] keeps one growable block
//! list per memory type, routes oversized or driver-hinted resources to
//! dedicated allocations, tracks per-heap budgets, and can reclaim
//! allocations the client marked as expendable once they go untouched for a
//! configured number of frames. A [`WaitScheduler`] batches many fence
//! waiters onto a single background thread.

mod align;
mod allocation;
mod allocator;
mod block;
mod budget;
mod device;
mod error;
mod list;
mod metadata;
mod pool;
mod types;
mod wait;

pub use allocation::{Allocation, AllocationInfo};
pub use allocator::Allocator;
pub use budget::HeapBudget;
pub use error::{Error, Result};
pub use pool::Pool;
pub use types::{
    AllocationCreateFlags, AllocationCreateInfo, AllocatorCreateFlags, AllocatorCreateInfo,
    MemoryUsage, PoolCreateFlags, PoolCreateInfo, SuballocationType,
};
pub use wait::{FenceDevice, FenceFuture, WaitScheduler};
