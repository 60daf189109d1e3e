//! Shared device state: property snapshots, budget-aware device memory
//! allocation and the frame counter.

use std::sync::atomic::{AtomicU32, Ordering};

use ash::vk;
use log::debug;

use crate::budget::{Budget, HeapBudget};
use crate::error::{Error, Result};
use crate::types::{AllocatorCreateFlags, AllocatorCreateInfo};

/// Heaps at or below this size use an eighth of the heap as block size
/// instead of the configured large-heap block size.
const SMALL_HEAP_MAX_SIZE: u64 = 1024 * 1024 * 1024;

/// Default preferred block size on large heaps.
const DEFAULT_LARGE_HEAP_BLOCK_SIZE: u64 = 256 * 1024 * 1024;

/// Everything the allocator, its block lists and its blocks share: the raw
/// device handles, immutable property snapshots, the budget counters and the
/// externally-driven frame index.
pub(crate) struct DeviceContext {
    pub device: ash::Device,
    pub instance: ash::Instance,
    pub physical_device: vk::PhysicalDevice,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    device_type: vk::PhysicalDeviceType,
    pub buffer_image_granularity: u64,
    pub non_coherent_atom_size: u64,
    max_memory_allocation_count: u32,
    pub use_ext_memory_budget: bool,
    pub use_buffer_device_address: bool,
    heap_size_limits: [u64; vk::MAX_MEMORY_HEAPS],
    pub budget: Budget,
    device_memory_count: AtomicU32,
    current_frame: AtomicU32,
}

impl std::fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceContext")
            .field("device", &self.device.handle())
            .field("instance", &self.instance.handle())
            .field("physical_device", &self.physical_device)
            .field("memory_properties", &self.memory_properties)
            .field("device_type", &self.device_type)
            .field("buffer_image_granularity", &self.buffer_image_granularity)
            .field("non_coherent_atom_size", &self.non_coherent_atom_size)
            .field("max_memory_allocation_count", &self.max_memory_allocation_count)
            .field("use_ext_memory_budget", &self.use_ext_memory_budget)
            .field("use_buffer_device_address", &self.use_buffer_device_address)
            .field("heap_size_limits", &self.heap_size_limits)
            .field("budget", &self.budget)
            .field("device_memory_count", &self.device_memory_count)
            .field("current_frame", &self.current_frame)
            .finish()
    }
}

impl DeviceContext {
    pub unsafe fn new(info: &AllocatorCreateInfo) -> Result<DeviceContext> {
        if info.vulkan_api_version < vk::API_VERSION_1_1 {
            return Err(Error::InvalidArgument(
                "allocator requires Vulkan API version 1.1 or later",
            ));
        }
        let memory_properties = info
            .instance
            .get_physical_device_memory_properties(info.physical_device);
        let properties = info
            .instance
            .get_physical_device_properties(info.physical_device);

        let mut heap_size_limits = [u64::MAX; vk::MAX_MEMORY_HEAPS];
        if let Some(limits) = &info.heap_size_limits {
            if limits.len() > memory_properties.memory_heap_count as usize {
                return Err(Error::InvalidArgument(
                    "more heap size limits than heaps on the device",
                ));
            }
            for (slot, &limit) in heap_size_limits.iter_mut().zip(limits) {
                *slot = limit;
            }
        }

        Ok(DeviceContext {
            device: info.device.clone(),
            instance: info.instance.clone(),
            physical_device: info.physical_device,
            memory_properties,
            device_type: properties.device_type,
            buffer_image_granularity: properties.limits.buffer_image_granularity,
            non_coherent_atom_size: properties.limits.non_coherent_atom_size,
            max_memory_allocation_count: properties.limits.max_memory_allocation_count,
            use_ext_memory_budget: info.flags.contains(AllocatorCreateFlags::EXT_MEMORY_BUDGET),
            use_buffer_device_address: info
                .flags
                .contains(AllocatorCreateFlags::BUFFER_DEVICE_ADDRESS),
            heap_size_limits,
            budget: Budget::new(),
            device_memory_count: AtomicU32::new(0),
            current_frame: AtomicU32::new(0),
        })
    }

    pub fn memory_type_count(&self) -> u32 {
        self.memory_properties.memory_type_count
    }

    pub fn heap_count(&self) -> u32 {
        self.memory_properties.memory_heap_count
    }

    pub fn memory_type_flags(&self, memory_type_index: u32) -> vk::MemoryPropertyFlags {
        self.memory_properties.memory_types[memory_type_index as usize].property_flags
    }

    pub fn heap_index(&self, memory_type_index: u32) -> u32 {
        self.memory_properties.memory_types[memory_type_index as usize].heap_index
    }

    pub fn heap_size(&self, heap_index: u32) -> u64 {
        self.memory_properties.memory_heaps[heap_index as usize].size
    }

    pub fn is_integrated_gpu(&self) -> bool {
        self.device_type == vk::PhysicalDeviceType::INTEGRATED_GPU
    }

    pub fn is_host_visible(&self, memory_type_index: u32) -> bool {
        self.memory_type_flags(memory_type_index)
            .contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
    }

    /// Minimum alignment of any allocation in this memory type. Host-visible
    /// non-coherent memory must respect `nonCoherentAtomSize` so flush and
    /// invalidate ranges of neighbouring allocations never overlap.
    pub fn min_alignment(&self, memory_type_index: u32) -> u64 {
        let flags = self.memory_type_flags(memory_type_index);
        if flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
            && !flags.contains(vk::MemoryPropertyFlags::HOST_COHERENT)
        {
            self.non_coherent_atom_size.max(1)
        } else {
            1
        }
    }

    /// Preferred block size for the heap owning `memory_type_index`.
    pub fn preferred_block_size(&self, memory_type_index: u32, large_heap_block_size: u64) -> u64 {
        let heap_size = self.heap_size(self.heap_index(memory_type_index));
        let large = if large_heap_block_size != 0 {
            large_heap_block_size
        } else {
            DEFAULT_LARGE_HEAP_BLOCK_SIZE
        };
        let raw = if heap_size <= SMALL_HEAP_MAX_SIZE {
            heap_size / 8
        } else {
            large
        };
        crate::align::align_up(raw, 32)
    }

    pub fn current_frame(&self) -> u32 {
        self.current_frame.load(Ordering::Acquire)
    }

    pub fn set_current_frame(&self, frame: u32) {
        self.current_frame.store(frame, Ordering::Release);
    }

    /// Allocate device memory, charging the heap counters first. `info` must
    /// carry the final pNext chain; its size and memory type index drive the
    /// accounting.
    pub unsafe fn allocate_device_memory(
        &self,
        info: &vk::MemoryAllocateInfo,
    ) -> Result<vk::DeviceMemory> {
        let memory_type_index = info.memory_type_index;
        let size = info.allocation_size;
        let heap = self.heap_index(memory_type_index) as usize;

        let count = self.device_memory_count.fetch_add(1, Ordering::AcqRel) + 1;
        if count > self.max_memory_allocation_count {
            self.device_memory_count.fetch_sub(1, Ordering::AcqRel);
            return Err(Error::Driver(vk::Result::ERROR_TOO_MANY_OBJECTS));
        }

        let limit = self.heap_size_limits[heap].min(self.heap_size(heap as u32));
        if !self.budget.try_add_block(heap, size, limit) {
            self.device_memory_count.fetch_sub(1, Ordering::AcqRel);
            return Err(Error::OutOfDeviceMemory);
        }

        match self.device.allocate_memory(info, None) {
            Ok(memory) => {
                debug!(
                    "allocated {size} bytes of device memory, type {memory_type_index}, heap {heap}"
                );
                Ok(memory)
            }
            Err(result) => {
                self.budget.remove_block(heap, size);
                self.device_memory_count.fetch_sub(1, Ordering::AcqRel);
                Err(Error::from(result))
            }
        }
    }

    pub unsafe fn free_device_memory(
        &self,
        memory_type_index: u32,
        memory: vk::DeviceMemory,
        size: u64,
    ) {
        let heap = self.heap_index(memory_type_index) as usize;
        self.device.free_memory(memory, None);
        self.budget.remove_block(heap, size);
        self.device_memory_count.fetch_sub(1, Ordering::AcqRel);
        debug!("freed {size} bytes of device memory, type {memory_type_index}, heap {heap}");
    }

    /// Current usage and budget of one heap, refreshed from the driver when
    /// the extension is enabled and enough operations have accumulated.
    pub unsafe fn heap_budget(&self, heap_index: u32) -> HeapBudget {
        if self.use_ext_memory_budget {
            if self.budget.wants_fetch() {
                self.update_budget();
            }
            self.budget.extrapolated(heap_index as usize)
        } else {
            self.budget
                .estimated(heap_index as usize, self.heap_size(heap_index))
        }
    }

    /// Refetch the driver's usage/budget numbers.
    pub unsafe fn update_budget(&self) {
        debug_assert!(self.use_ext_memory_budget);
        let mut budget_props = vk::PhysicalDeviceMemoryBudgetPropertiesEXT::default();
        let mut props2 =
            vk::PhysicalDeviceMemoryProperties2::default().push_next(&mut budget_props);
        self.instance
            .get_physical_device_memory_properties2(self.physical_device, &mut props2);

        let mut fetched = self.budget.fetched.write();
        for heap in 0..self.heap_count() as usize {
            fetched.usage[heap] = budget_props.heap_usage[heap];
            // guard against drivers reporting a zero or shrunken budget
            fetched.budget[heap] = if budget_props.heap_budget[heap] != 0 {
                budget_props.heap_budget[heap].min(self.heap_size(heap as u32))
            } else {
                self.heap_size(heap as u32) * 8 / 10
            };
            fetched.block_bytes_at_fetch[heap] = self.budget.block_bytes(heap);
        }
        self.budget.reset_fetch_counter();
        debug!("refreshed heap budgets from driver");
    }

    /// Memory types this allocator may ever use. Types carrying
    /// `DEVICE_COHERENT_AMD` are opt-in.
    pub fn global_memory_type_bits(&self, flags: AllocatorCreateFlags) -> u32 {
        let mut bits = 0u32;
        for index in 0..self.memory_type_count() {
            let props = self.memory_type_flags(index);
            if props.contains(vk::MemoryPropertyFlags::DEVICE_COHERENT_AMD)
                && !flags.contains(AllocatorCreateFlags::AMD_DEVICE_COHERENT_MEMORY)
            {
                continue;
            }
            bits |= 1 << index;
        }
        bits
    }
}
