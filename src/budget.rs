//! Per-heap accounting of committed blocks and live allocations.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use ash::vk;
use parking_lot::RwLock;

/// After this many allocation operations the budget snapshot is refetched
/// from the driver.
pub(crate) const BUDGET_FETCH_INTERVAL: u32 = 30;

/// Usage and budget of one heap as seen by this allocator.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeapBudget {
    /// Bytes of device memory committed by this allocator (blocks and
    /// dedicated allocations).
    pub block_bytes: u64,
    /// Bytes handed out to live allocations. Always ≤ `block_bytes`.
    pub allocation_bytes: u64,
    /// Estimated heap usage of the whole process.
    pub usage: u64,
    /// Estimated bytes available to the process before allocations start to
    /// fail or degrade.
    pub budget: u64,
}

/// Snapshot fetched from `VK_EXT_memory_budget`, plus the block byte counts
/// observed at fetch time so later reads can be extrapolated.
#[derive(Debug)]
pub(crate) struct FetchedBudget {
    pub usage: [u64; vk::MAX_MEMORY_HEAPS],
    pub budget: [u64; vk::MAX_MEMORY_HEAPS],
    pub block_bytes_at_fetch: [u64; vk::MAX_MEMORY_HEAPS],
}

impl FetchedBudget {
    fn zeroed() -> FetchedBudget {
        FetchedBudget {
            usage: [0; vk::MAX_MEMORY_HEAPS],
            budget: [0; vk::MAX_MEMORY_HEAPS],
            block_bytes_at_fetch: [0; vk::MAX_MEMORY_HEAPS],
        }
    }
}

/// Lock-free per-heap counters plus the guarded driver snapshot.
#[derive(Debug)]
pub(crate) struct Budget {
    block_bytes: [AtomicU64; vk::MAX_MEMORY_HEAPS],
    allocation_bytes: [AtomicU64; vk::MAX_MEMORY_HEAPS],
    operations_since_fetch: AtomicU32,
    pub(crate) fetched: RwLock<FetchedBudget>,
}

impl Budget {
    pub fn new() -> Budget {
        Budget {
            block_bytes: std::array::from_fn(|_| AtomicU64::new(0)),
            allocation_bytes: std::array::from_fn(|_| AtomicU64::new(0)),
            operations_since_fetch: AtomicU32::new(BUDGET_FETCH_INTERVAL),
            fetched: RwLock::new(FetchedBudget::zeroed()),
        }
    }

    pub fn block_bytes(&self, heap: usize) -> u64 {
        self.block_bytes[heap].load(Ordering::Acquire)
    }

    pub fn allocation_bytes(&self, heap: usize) -> u64 {
        self.allocation_bytes[heap].load(Ordering::Acquire)
    }

    /// Reserve `size` block bytes on `heap` unless that would exceed
    /// `limit`. Lock-free; a failed reservation leaves the counter untouched.
    pub fn try_add_block(&self, heap: usize, size: u64, limit: u64) -> bool {
        let counter = &self.block_bytes[heap];
        let mut current = counter.load(Ordering::Acquire);
        loop {
            let next = match current.checked_add(size) {
                Some(next) if next <= limit => next,
                _ => return false,
            };
            match counter.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    pub fn remove_block(&self, heap: usize, size: u64) {
        let previous = self.block_bytes[heap].fetch_sub(size, Ordering::AcqRel);
        debug_assert!(previous >= size);
    }

    pub fn add_allocation(&self, heap: usize, size: u64) {
        self.allocation_bytes[heap].fetch_add(size, Ordering::AcqRel);
        self.operations_since_fetch.fetch_add(1, Ordering::AcqRel);
    }

    pub fn remove_allocation(&self, heap: usize, size: u64) {
        let previous = self.allocation_bytes[heap].fetch_sub(size, Ordering::AcqRel);
        debug_assert!(previous >= size);
        self.operations_since_fetch.fetch_add(1, Ordering::AcqRel);
    }

    /// Whether enough allocation operations have happened since the last
    /// driver fetch to warrant a refresh.
    pub fn wants_fetch(&self) -> bool {
        self.operations_since_fetch.load(Ordering::Acquire) >= BUDGET_FETCH_INTERVAL
    }

    pub fn reset_fetch_counter(&self) {
        self.operations_since_fetch.store(0, Ordering::Release);
    }

    /// Current view of `heap`, extrapolated from the last driver snapshot:
    /// the process usage observed at fetch time plus whatever this allocator
    /// has committed since.
    pub fn extrapolated(&self, heap: usize) -> HeapBudget {
        let fetched = self.fetched.read();
        let block_bytes = self.block_bytes(heap);
        let grown = block_bytes.saturating_sub(fetched.block_bytes_at_fetch[heap]);
        HeapBudget {
            block_bytes,
            allocation_bytes: self.allocation_bytes(heap),
            usage: fetched.usage[heap] + grown,
            budget: fetched.budget[heap],
        }
    }

    /// Heuristic view of `heap` when `VK_EXT_memory_budget` is absent:
    /// usage is what this allocator committed, budget is 80% of the heap.
    pub fn estimated(&self, heap: usize, heap_size: u64) -> HeapBudget {
        let block_bytes = self.block_bytes(heap);
        HeapBudget {
            block_bytes,
            allocation_bytes: self.allocation_bytes(heap),
            usage: block_bytes,
            budget: heap_size * 8 / 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_reservation_honours_limit() {
        let budget = Budget::new();
        assert!(budget.try_add_block(0, 600, 1000));
        assert!(!budget.try_add_block(0, 600, 1000));
        assert!(budget.try_add_block(0, 400, 1000));
        assert_eq!(budget.block_bytes(0), 1000);
        budget.remove_block(0, 600);
        assert_eq!(budget.block_bytes(0), 400);
    }

    #[test]
    fn allocation_ops_drive_fetch_cadence() {
        let budget = Budget::new();
        // a fresh budget wants an initial fetch
        assert!(budget.wants_fetch());
        budget.reset_fetch_counter();
        assert!(!budget.wants_fetch());
        for _ in 0..BUDGET_FETCH_INTERVAL - 1 {
            budget.add_allocation(0, 16);
        }
        assert!(!budget.wants_fetch());
        budget.remove_allocation(0, 16);
        assert!(budget.wants_fetch());
    }

    #[test]
    fn estimated_budget_is_80_percent_of_heap() {
        let budget = Budget::new();
        assert!(budget.try_add_block(1, 512, u64::MAX));
        let view = budget.estimated(1, 1000);
        assert_eq!(view.usage, 512);
        assert_eq!(view.budget, 800);
    }

    #[test]
    fn extrapolation_adds_growth_since_fetch() {
        let budget = Budget::new();
        assert!(budget.try_add_block(0, 100, u64::MAX));
        {
            let mut fetched = budget.fetched.write();
            fetched.usage[0] = 5000;
            fetched.budget[0] = 8000;
            fetched.block_bytes_at_fetch[0] = 100;
        }
        assert!(budget.try_add_block(0, 50, u64::MAX));
        let view = budget.extrapolated(0);
        assert_eq!(view.usage, 5050);
        assert_eq!(view.budget, 8000);
    }
}
