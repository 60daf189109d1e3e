//! Flags, enums and creation records of the public API.

use std::sync::Arc;

use ash::vk;
use bitflags::bitflags;

use crate::error::{Error, Result};
use crate::pool::Pool;

bitflags! {
    /// Global behaviour switches for an [`Allocator`](crate::Allocator).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AllocatorCreateFlags: u32 {
        /// The caller guarantees external synchronisation of every call.
        /// Internal locking is kept regardless; the flag is accepted for
        /// source compatibility.
        const EXTERNALLY_SYNCHRONIZED = 0x0000_0001;
        /// VK_EXT_memory_budget is enabled on the device; heap budgets are
        /// fetched from the driver instead of estimated.
        const EXT_MEMORY_BUDGET = 0x0000_0002;
        /// Allow use of memory types carrying
        /// `DEVICE_COHERENT_AMD`; such types are otherwise excluded.
        const AMD_DEVICE_COHERENT_MEMORY = 0x0000_0004;
        /// The device was created with the bufferDeviceAddress feature;
        /// device allocations are chained with
        /// `VkMemoryAllocateFlagsInfo { DEVICE_ADDRESS }` where the resource
        /// permits it.
        const BUFFER_DEVICE_ADDRESS = 0x0000_0008;
    }
}

bitflags! {
    /// Per-allocation behaviour switches.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AllocationCreateFlags: u32 {
        /// Allocate a whole `VkDeviceMemory` dedicated to this allocation.
        const DEDICATED_MEMORY = 0x0000_0001;
        /// Only use already-existing blocks; never call the device allocator.
        const NEVER_ALLOCATE = 0x0000_0002;
        /// Keep the allocation persistently mapped.
        const MAPPED = 0x0000_0004;
        /// The allocation may be reclaimed when unused for
        /// `frame_in_use_count` frames.
        const CAN_BECOME_LOST = 0x0000_0008;
        /// This request may evict stale lost-eligible allocations.
        const CAN_MAKE_OTHER_LOST = 0x0000_0010;
        /// Place the allocation at the upper end of the block (linear
        /// algorithm only).
        const UPPER_ADDRESS = 0x0000_0020;
        /// For `create_buffer`/`create_image`: allocate but do not bind.
        const DONT_BIND = 0x0000_0040;
        /// Fail the allocation rather than exceed the heap budget.
        const WITHIN_BUDGET = 0x0000_0080;

        /// Prefer the smallest free range that fits.
        const STRATEGY_BEST_FIT = 0x0001_0000;
        /// Prefer the largest free range.
        const STRATEGY_WORST_FIT = 0x0002_0000;
        /// Take the first fitting candidate.
        const STRATEGY_FIRST_FIT = 0x0004_0000;

        /// Alias: minimise memory usage.
        const STRATEGY_MIN_MEMORY = Self::STRATEGY_BEST_FIT.bits();
        /// Alias: minimise allocation time.
        const STRATEGY_MIN_TIME = Self::STRATEGY_FIRST_FIT.bits();
        /// Alias: minimise fragmentation.
        const STRATEGY_MIN_FRAGMENTATION = Self::STRATEGY_WORST_FIT.bits();

        const STRATEGY_MASK = Self::STRATEGY_BEST_FIT.bits()
            | Self::STRATEGY_WORST_FIT.bits()
            | Self::STRATEGY_FIRST_FIT.bits();
    }
}

bitflags! {
    /// Behaviour switches for a user-created [`Pool`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PoolCreateFlags: u32 {
        /// Treat buffers and images placed in this pool as never conflicting
        /// at buffer-image granularity. Only safe when the pool hosts a
        /// single resource kind.
        const IGNORE_BUFFER_IMAGE_GRANULARITY = 0x0000_0002;
        /// Use a linear (ring/stack) placement algorithm.
        const LINEAR_ALGORITHM = 0x0000_0004;
        /// Use a buddy placement algorithm.
        const BUDDY_ALGORITHM = 0x0000_0008;
    }
}

impl Default for AllocatorCreateFlags {
    fn default() -> Self {
        Self::empty()
    }
}

impl Default for AllocationCreateFlags {
    fn default() -> Self {
        Self::empty()
    }
}

impl Default for PoolCreateFlags {
    fn default() -> Self {
        Self::empty()
    }
}

/// Describes the intended usage of a memory allocation.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum MemoryUsage {
    /// No intended usage specified; only `required_flags`,
    /// `preferred_flags` and the resource requirements steer type selection.
    #[default]
    Unknown,
    /// Memory will be used on device only and having it mappable on host is
    /// not requested (although it is possible on some devices).
    /// Usage:
    ///     - Resources written and read by device, e.g. images used as attachments.
    ///     - Resources transferred from host once or infrequently and read by
    ///        device multiple times, e.g. textures, vertex buffers, uniforms etc.
    GpuOnly,
    /// Memory will be mappable on host. It usually means CPU (system) memory.
    /// Resources created for this usage may still be accessible to the device,
    /// but access to them can be slower. Guaranteed to be host-visible and
    /// host-coherent.
    /// Usage:
    ///     - Staging copy of resources used as transfer source.
    CpuOnly,
    /// Memory that is both mappable on host and preferably fast to access by
    /// GPU. CPU reads may be uncached and very slow.
    /// Usage:
    ///     - Resources written frequently by host (dynamic), read by device.
    ///         E.g. vertex or uniform buffers updated every frame.
    CpuToGpu,
    /// Memory mappable on host and cached.
    /// Usage:
    ///     - Resources written by device, read by host - results of some
    ///          computations, e.g. screen capture, average scene luminance.
    GpuToCpu,
    /// Memory used for staging on the CPU side, explicitly steering away from
    /// device-local types.
    CpuCopy,
    /// Memory for transient attachments, lazily allocated by the driver.
    GpuLazilyAllocated,
}

/// Tag carried by every suballocation inside a block. The pairwise conflict
/// relation drives buffer-image granularity handling.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum SuballocationType {
    Free,
    Unknown,
    Buffer,
    ImageUnknown,
    ImageLinear,
    ImageOptimal,
}

impl SuballocationType {
    /// Whether two distinct neighbouring suballocations of these types must
    /// not share a buffer-image granularity page.
    pub(crate) fn conflicts_with(self, other: SuballocationType) -> bool {
        use SuballocationType::*;
        let (a, b) = if self <= other {
            (self, other)
        } else {
            (other, self)
        };
        match a {
            Free => false,
            Unknown => true,
            Buffer => b == ImageUnknown || b == ImageOptimal,
            ImageUnknown => b == ImageUnknown || b == ImageLinear || b == ImageOptimal,
            ImageLinear => b == ImageOptimal,
            ImageOptimal => false,
        }
    }
}

/// Placement strategy derived from the strategy bits of
/// [`AllocationCreateFlags`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Strategy {
    BestFit,
    WorstFit,
    /// Default. Behaves like [`Strategy::WorstFit`] when enumerating free
    /// ranges and takes the first viable candidate in eviction scans.
    FirstFit,
    /// Internal: smallest offset first, used when packing matters more than
    /// fit quality.
    #[allow(dead_code)]
    MinOffset,
}

impl Strategy {
    pub(crate) fn from_flags(flags: AllocationCreateFlags) -> Result<Strategy> {
        let strategy = flags & AllocationCreateFlags::STRATEGY_MASK;
        if strategy.is_empty() {
            Ok(Strategy::FirstFit)
        } else if strategy == AllocationCreateFlags::STRATEGY_BEST_FIT {
            Ok(Strategy::BestFit)
        } else if strategy == AllocationCreateFlags::STRATEGY_WORST_FIT {
            Ok(Strategy::WorstFit)
        } else if strategy == AllocationCreateFlags::STRATEGY_FIRST_FIT {
            Ok(Strategy::FirstFit)
        } else {
            Err(Error::InvalidArgument(
                "more than one allocation strategy requested",
            ))
        }
    }
}

/// Structure controlling an allocation of memory.
#[derive(Clone, Default)]
pub struct AllocationCreateInfo {
    /// Behaviour flags.
    pub flags: AllocationCreateFlags,
    /// Intended usage. Translated into required and preferred property flags.
    pub usage: MemoryUsage,
    /// Property bits that must be set on the chosen memory type.
    pub required_flags: vk::MemoryPropertyFlags,
    /// Property bits that are optional but preferred. Type selection favours
    /// memory types with these bits but may fall back to others.
    pub preferred_flags: vk::MemoryPropertyFlags,
    /// Mask of acceptable memory type indices (bit `i` = type `i`). Zero
    /// means no constraint.
    pub memory_type_bits: u32,
    /// Allocate from this pool instead of the allocator's default block
    /// lists. Mutually exclusive with `DEDICATED_MEMORY`.
    pub pool: Option<Arc<Pool>>,
}

impl AllocationCreateInfo {
    /// Initializes an `AllocationCreateInfo` with an intended usage.
    pub fn for_usage(usage: MemoryUsage) -> AllocationCreateInfo {
        AllocationCreateInfo {
            usage,
            ..Default::default()
        }
    }
    /// set flags
    pub fn with_flags(mut self, flags: AllocationCreateFlags) -> AllocationCreateInfo {
        self.flags = flags;
        self
    }
    /// set required property flags
    pub fn with_required_flags(mut self, flags: vk::MemoryPropertyFlags) -> AllocationCreateInfo {
        self.required_flags = flags;
        self
    }
    /// set preferred property flags
    pub fn with_preferred_flags(mut self, flags: vk::MemoryPropertyFlags) -> AllocationCreateInfo {
        self.preferred_flags = flags;
        self
    }
    /// set the memory type index mask
    pub fn with_memory_type_bits(mut self, bits: u32) -> AllocationCreateInfo {
        self.memory_type_bits = bits;
        self
    }
    /// route the allocation to a pool
    pub fn with_pool(mut self, pool: Arc<Pool>) -> AllocationCreateInfo {
        self.pool = Some(pool);
        self
    }
}

/// Parameters of a new [`Allocator`](crate::Allocator).
pub struct AllocatorCreateInfo {
    pub flags: AllocatorCreateFlags,
    pub instance: ash::Instance,
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    /// The Vulkan API version the device was created with. Must be ≥ 1.1 so
    /// the `*2` query entry points and dedicated allocations are core.
    pub vulkan_api_version: u32,
    /// Preferred size of a block allocated on large heaps, in bytes.
    /// 0 means the default of 256 MiB.
    pub preferred_large_heap_block_size: u64,
    /// Optional per-heap caps on the bytes this allocator may commit.
    /// Missing entries mean "whole heap".
    pub heap_size_limits: Option<Vec<u64>>,
    /// How many frames an untouched lost-eligible allocation survives.
    pub frame_in_use_count: u32,
}

/// Parameters of a user-created [`Pool`].
#[derive(Debug, Clone, Default)]
pub struct PoolCreateInfo {
    /// The memory type index every block of the pool is allocated from.
    pub memory_type_index: u32,
    pub flags: PoolCreateFlags,
    /// Size of each block. 0 means the allocator's preferred size for the
    /// owning heap.
    pub block_size: u64,
    /// Blocks created eagerly and never destroyed.
    pub min_block_count: usize,
    /// Upper bound on the block count. 0 means unbounded.
    pub max_block_count: usize,
    /// Overrides the allocator-wide `frame_in_use_count` for this pool.
    pub frame_in_use_count: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn granularity_conflict_table() {
        use SuballocationType::*;
        let conflicting = [
            (Buffer, ImageUnknown),
            (Buffer, ImageOptimal),
            (ImageUnknown, ImageUnknown),
            (ImageUnknown, ImageLinear),
            (ImageUnknown, ImageOptimal),
            (ImageLinear, ImageOptimal),
        ];
        for (a, b) in conflicting {
            assert!(a.conflicts_with(b), "{a:?} vs {b:?}");
            assert!(b.conflicts_with(a), "{b:?} vs {a:?}");
        }
        let compatible = [
            (Buffer, Buffer),
            (Buffer, ImageLinear),
            (ImageLinear, ImageLinear),
            (ImageOptimal, ImageOptimal),
        ];
        for (a, b) in compatible {
            assert!(!a.conflicts_with(b), "{a:?} vs {b:?}");
            assert!(!b.conflicts_with(a), "{b:?} vs {a:?}");
        }
        // Unknown conflicts with every occupied type, Free with none
        for t in [Unknown, Buffer, ImageUnknown, ImageLinear, ImageOptimal] {
            assert!(Unknown.conflicts_with(t));
            assert!(!Free.conflicts_with(t));
        }
    }

    #[test]
    fn strategy_selection() {
        assert_eq!(
            Strategy::from_flags(AllocationCreateFlags::empty()).unwrap(),
            Strategy::FirstFit
        );
        assert_eq!(
            Strategy::from_flags(AllocationCreateFlags::STRATEGY_MIN_MEMORY).unwrap(),
            Strategy::BestFit
        );
        assert!(Strategy::from_flags(
            AllocationCreateFlags::STRATEGY_BEST_FIT | AllocationCreateFlags::STRATEGY_WORST_FIT
        )
        .is_err());
    }
}
