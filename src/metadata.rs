//! Free/used bookkeeping of a single device memory block.
//!
//! A block is described as a gap-free, ascending-by-offset sequence of
//! suballocations, each either free or occupied, plus an auxiliary index of
//! the larger free ranges ordered by size. The sequence is an intrusive
//! doubly-linked list over slab-allocated nodes so that a node index is a
//! stable handle across unrelated insertions and removals.

use std::sync::Arc;

use crate::align::{align_up, blocks_on_same_page};
use crate::allocation::AllocRecord;
use crate::types::{Strategy, SuballocationType};

/// Free ranges at least this large are tracked in the by-size index.
pub(crate) const MIN_FREE_SUBALLOCATION_SIZE_TO_REGISTER: u64 = 16;

/// Cost charged per evicted allocation when comparing eviction candidates.
pub(crate) const LOST_ALLOCATION_COST: u64 = 1_048_576;

/// Bytes of guard space kept around every allocation. Kept in the formulas
/// so a corruption-detection build is a one-constant change.
pub(crate) const DEBUG_MARGIN: u64 = 0;

pub(crate) type NodeIndex = usize;

/// One contiguous range within a block.
#[derive(Debug)]
pub(crate) struct Suballocation {
    pub offset: u64,
    pub size: u64,
    pub ty: SuballocationType,
    /// Frame-tracking record of the owning allocation. `None` iff free.
    pub record: Option<Arc<AllocRecord>>,
}

#[derive(Debug)]
struct Node {
    prev: Option<NodeIndex>,
    next: Option<NodeIndex>,
    suballoc: Suballocation,
}

/// Doubly-linked list of suballocations ordered by offset, backed by a slab
/// so node handles stay valid while the node is in the list.
#[derive(Debug)]
pub(crate) struct SuballocationList {
    nodes: Vec<Node>,
    free_slots: Vec<NodeIndex>,
    head: Option<NodeIndex>,
    tail: Option<NodeIndex>,
    len: usize,
}

impl SuballocationList {
    fn new() -> SuballocationList {
        SuballocationList {
            nodes: Vec::new(),
            free_slots: Vec::new(),
            head: None,
            tail: None,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn head(&self) -> Option<NodeIndex> {
        self.head
    }

    pub fn next(&self, index: NodeIndex) -> Option<NodeIndex> {
        self.nodes[index].next
    }

    pub fn prev(&self, index: NodeIndex) -> Option<NodeIndex> {
        self.nodes[index].prev
    }

    pub fn get(&self, index: NodeIndex) -> &Suballocation {
        &self.nodes[index].suballoc
    }

    pub fn get_mut(&mut self, index: NodeIndex) -> &mut Suballocation {
        &mut self.nodes[index].suballoc
    }

    fn new_node(&mut self, suballoc: Suballocation) -> NodeIndex {
        let node = Node {
            prev: None,
            next: None,
            suballoc,
        };
        match self.free_slots.pop() {
            Some(slot) => {
                self.nodes[slot] = node;
                slot
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        }
    }

    fn push_back(&mut self, suballoc: Suballocation) -> NodeIndex {
        let index = self.new_node(suballoc);
        self.nodes[index].prev = self.tail;
        match self.tail {
            Some(tail) => self.nodes[tail].next = Some(index),
            None => self.head = Some(index),
        }
        self.tail = Some(index);
        self.len += 1;
        index
    }

    fn insert_before(&mut self, at: NodeIndex, suballoc: Suballocation) -> NodeIndex {
        let index = self.new_node(suballoc);
        let prev = self.nodes[at].prev;
        self.nodes[index].prev = prev;
        self.nodes[index].next = Some(at);
        self.nodes[at].prev = Some(index);
        match prev {
            Some(prev) => self.nodes[prev].next = Some(index),
            None => self.head = Some(index),
        }
        self.len += 1;
        index
    }

    fn insert_after(&mut self, at: NodeIndex, suballoc: Suballocation) -> NodeIndex {
        let index = self.new_node(suballoc);
        let next = self.nodes[at].next;
        self.nodes[index].next = next;
        self.nodes[index].prev = Some(at);
        self.nodes[at].next = Some(index);
        match next {
            Some(next) => self.nodes[next].prev = Some(index),
            None => self.tail = Some(index),
        }
        self.len += 1;
        index
    }

    fn remove(&mut self, index: NodeIndex) {
        let Node { prev, next, .. } = self.nodes[index];
        match prev {
            Some(prev) => self.nodes[prev].next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => self.nodes[next].prev = prev,
            None => self.tail = prev,
        }
        self.free_slots.push(index);
        self.len -= 1;
    }

    pub fn iter(&self) -> ListIter<'_> {
        ListIter {
            list: self,
            cursor: self.head,
        }
    }
}

pub(crate) struct ListIter<'a> {
    list: &'a SuballocationList,
    cursor: Option<NodeIndex>,
}

impl<'a> Iterator for ListIter<'a> {
    type Item = (NodeIndex, &'a Suballocation);

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.cursor?;
        self.cursor = self.list.next(index);
        Some((index, self.list.get(index)))
    }
}

/// Inputs of a placement query.
#[derive(Debug, Clone)]
pub(crate) struct RequestContext {
    pub current_frame: u32,
    pub frame_in_use_count: u32,
    pub buffer_image_granularity: u64,
    pub alloc_size: u64,
    pub alloc_alignment: u64,
    pub alloc_type: SuballocationType,
    pub can_make_other_lost: bool,
    pub strategy: Strategy,
}

/// A placement candidate produced by [`BlockMetadata::try_create_request`]
/// and consumed by [`BlockMetadata::alloc`]. Valid only while the metadata is
/// not mutated in between, except through
/// [`BlockMetadata::make_requested_lost`] which updates it in place.
#[derive(Debug, Clone)]
pub(crate) struct AllocationRequest {
    pub item: NodeIndex,
    pub offset: u64,
    pub sum_free_size: u64,
    pub sum_item_size: u64,
    pub items_to_make_lost_count: usize,
}

impl AllocationRequest {
    pub fn calc_cost(&self) -> u64 {
        self.sum_item_size + self.items_to_make_lost_count as u64 * LOST_ALLOCATION_COST
    }
}

struct CheckResult {
    offset: u64,
    sum_free_size: u64,
    sum_item_size: u64,
    items_to_make_lost: usize,
}

/// The free/used map of one block.
#[derive(Debug)]
pub(crate) struct BlockMetadata {
    size: u64,
    free_count: usize,
    sum_free_size: u64,
    suballocations: SuballocationList,
    /// Handles of free suballocations of registerable size, ascending by
    /// size. Ties keep insertion order.
    free_by_size: Vec<NodeIndex>,
}

impl BlockMetadata {
    pub fn new(size: u64) -> BlockMetadata {
        let mut suballocations = SuballocationList::new();
        let whole = suballocations.push_back(Suballocation {
            offset: 0,
            size,
            ty: SuballocationType::Free,
            record: None,
        });
        let mut free_by_size = Vec::new();
        if size >= MIN_FREE_SUBALLOCATION_SIZE_TO_REGISTER {
            free_by_size.push(whole);
        }
        BlockMetadata {
            size,
            free_count: 1,
            sum_free_size: size,
            suballocations,
            free_by_size,
        }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn sum_free_size(&self) -> u64 {
        self.sum_free_size
    }

    pub fn allocation_count(&self) -> usize {
        self.suballocations.len() - self.free_count
    }

    pub fn is_empty(&self) -> bool {
        self.suballocations.len() == 1 && self.free_count == 1
    }

    /// Size of the largest registered free range.
    pub fn unused_range_size_max(&self) -> u64 {
        self.free_by_size
            .last()
            .map_or(0, |&index| self.suballocations.get(index).size)
    }

    /// Search for a placement. Does not mutate; the returned request stays
    /// valid until the next mutation.
    pub fn try_create_request(&self, ctx: &RequestContext) -> Option<AllocationRequest> {
        debug_assert!(ctx.alloc_size > 0);
        debug_assert!(ctx.alloc_type != SuballocationType::Free);

        if !ctx.can_make_other_lost
            && self.sum_free_size < ctx.alloc_size + 2 * DEBUG_MARGIN
        {
            return None;
        }

        let free_count = self.free_by_size.len();
        if free_count > 0 {
            match ctx.strategy {
                Strategy::BestFit => {
                    let suballocations = &self.suballocations;
                    let threshold = ctx.alloc_size + 2 * DEBUG_MARGIN;
                    let start = self
                        .free_by_size
                        .partition_point(|&index| suballocations.get(index).size < threshold);
                    for position in start..free_count {
                        let item = self.free_by_size[position];
                        if let Some(found) = self.check_allocation(ctx, item, false) {
                            return Some(Self::request_from(item, found));
                        }
                    }
                }
                Strategy::MinOffset => {
                    let mut cursor = self.suballocations.head();
                    while let Some(item) = cursor {
                        if self.suballocations.get(item).ty == SuballocationType::Free {
                            if let Some(found) = self.check_allocation(ctx, item, false) {
                                return Some(Self::request_from(item, found));
                            }
                        }
                        cursor = self.suballocations.next(item);
                    }
                }
                Strategy::WorstFit | Strategy::FirstFit => {
                    // largest free ranges first
                    for position in (0..free_count).rev() {
                        let item = self.free_by_size[position];
                        if let Some(found) = self.check_allocation(ctx, item, false) {
                            return Some(Self::request_from(item, found));
                        }
                    }
                }
            }
        }

        if ctx.can_make_other_lost {
            // Brute force over every suballocation, tolerating eviction of
            // stale lost-eligible occupants. Cheapest candidate wins, or the
            // first one under the FirstFit strategy.
            let mut best: Option<AllocationRequest> = None;
            let mut cursor = self.suballocations.head();
            while let Some(item) = cursor {
                let suballoc = self.suballocations.get(item);
                let eligible = suballoc.ty == SuballocationType::Free
                    || suballoc
                        .record
                        .as_ref()
                        .is_some_and(|record| record.can_become_lost());
                if eligible {
                    if let Some(found) = self.check_allocation(ctx, item, true) {
                        let request = Self::request_from(item, found);
                        if ctx.strategy == Strategy::FirstFit {
                            return Some(request);
                        }
                        if best
                            .as_ref()
                            .map_or(true, |current| request.calc_cost() < current.calc_cost())
                        {
                            best = Some(request);
                        }
                    }
                }
                cursor = self.suballocations.next(item);
            }
            return best;
        }

        None
    }

    fn request_from(item: NodeIndex, found: CheckResult) -> AllocationRequest {
        AllocationRequest {
            item,
            offset: found.offset,
            sum_free_size: found.sum_free_size,
            sum_item_size: found.sum_item_size,
            items_to_make_lost_count: found.items_to_make_lost,
        }
    }

    /// Whether the allocation described by `ctx` fits at `item`, and where.
    ///
    /// With `can_make_other_lost` the placement may span several
    /// suballocations past `item`, each either free or a stale lost-eligible
    /// occupant; without it, `item` must be a free suballocation containing
    /// the whole placement.
    fn check_allocation(
        &self,
        ctx: &RequestContext,
        item: NodeIndex,
        can_make_other_lost: bool,
    ) -> Option<CheckResult> {
        debug_assert!(ctx.alloc_size > 0);
        let suballocations = &self.suballocations;
        let suballoc = suballocations.get(item);

        let mut sum_free_size = 0u64;
        let mut sum_item_size = 0u64;
        let mut items_to_make_lost = 0usize;

        if can_make_other_lost {
            if suballoc.ty == SuballocationType::Free {
                sum_free_size = suballoc.size;
            } else {
                let record = suballoc.record.as_ref()?;
                if record.can_become_lost()
                    && record.is_stale(ctx.current_frame, ctx.frame_in_use_count)
                {
                    sum_item_size = suballoc.size;
                    items_to_make_lost = 1;
                } else {
                    return None;
                }
            }
        } else {
            debug_assert!(suballoc.ty == SuballocationType::Free);
            if suballoc.size < ctx.alloc_size {
                return None;
            }
            sum_free_size = suballoc.size;
        }

        let mut offset = suballoc.offset;
        if DEBUG_MARGIN > 0 {
            offset += DEBUG_MARGIN;
        }
        offset = align_up(offset, ctx.alloc_alignment);

        // A prior suballocation of conflicting kind on the same granularity
        // page pushes the placement to the next page.
        if ctx.buffer_image_granularity > 1 {
            let mut conflict = false;
            let mut cursor = suballocations.prev(item);
            while let Some(prev) = cursor {
                let prev_suballoc = suballocations.get(prev);
                if blocks_on_same_page(
                    prev_suballoc.offset,
                    prev_suballoc.size,
                    offset,
                    ctx.buffer_image_granularity,
                ) {
                    if prev_suballoc.ty.conflicts_with(ctx.alloc_type) {
                        conflict = true;
                        break;
                    }
                } else {
                    break;
                }
                cursor = suballocations.prev(prev);
            }
            if conflict {
                offset = align_up(offset, ctx.buffer_image_granularity);
            }
        }

        let padding_begin = offset - suballoc.offset;
        let required_end_margin = DEBUG_MARGIN;

        if can_make_other_lost {
            if suballoc.offset + padding_begin + ctx.alloc_size + required_end_margin > self.size {
                return None;
            }
            // Consume following suballocations until the placement is
            // covered; every spanned occupant must be evictable.
            let total_end = offset + ctx.alloc_size + required_end_margin;
            let mut last = item;
            loop {
                let last_suballoc = suballocations.get(last);
                if total_end <= last_suballoc.offset + last_suballoc.size {
                    break;
                }
                let next = suballocations.next(last)?;
                let next_suballoc = suballocations.get(next);
                if next_suballoc.ty != SuballocationType::Free {
                    let record = next_suballoc.record.as_ref()?;
                    if record.can_become_lost()
                        && record.is_stale(ctx.current_frame, ctx.frame_in_use_count)
                    {
                        sum_item_size += next_suballoc.size;
                        items_to_make_lost += 1;
                    } else {
                        return None;
                    }
                }
                last = next;
            }
            // Later suballocations on the same page: a conflicting occupant
            // is fatal unless it too can be evicted.
            if ctx.buffer_image_granularity > 1 {
                let mut cursor = suballocations.next(last);
                while let Some(next) = cursor {
                    let next_suballoc = suballocations.get(next);
                    if !blocks_on_same_page(
                        offset,
                        ctx.alloc_size,
                        next_suballoc.offset,
                        ctx.buffer_image_granularity,
                    ) {
                        break;
                    }
                    if ctx.alloc_type.conflicts_with(next_suballoc.ty) {
                        let record = next_suballoc.record.as_ref()?;
                        if record.can_become_lost()
                            && record.is_stale(ctx.current_frame, ctx.frame_in_use_count)
                        {
                            items_to_make_lost += 1;
                        } else {
                            return None;
                        }
                    }
                    cursor = suballocations.next(next);
                }
            }
        } else {
            if padding_begin + ctx.alloc_size + required_end_margin > suballoc.size {
                return None;
            }
            // Later suballocations on the same page must not conflict.
            if ctx.buffer_image_granularity > 1 {
                let mut cursor = suballocations.next(item);
                while let Some(next) = cursor {
                    let next_suballoc = suballocations.get(next);
                    if !blocks_on_same_page(
                        offset,
                        ctx.alloc_size,
                        next_suballoc.offset,
                        ctx.buffer_image_granularity,
                    ) {
                        break;
                    }
                    if ctx.alloc_type.conflicts_with(next_suballoc.ty) {
                        return None;
                    }
                    cursor = suballocations.next(next);
                }
            }
        }

        Some(CheckResult {
            offset,
            sum_free_size,
            sum_item_size,
            items_to_make_lost,
        })
    }

    /// Commit a placement produced by a preceding successful
    /// [`BlockMetadata::try_create_request`] with no intervening mutation.
    pub fn alloc(
        &mut self,
        request: &AllocationRequest,
        ty: SuballocationType,
        alloc_size: u64,
        record: Arc<AllocRecord>,
    ) {
        debug_assert!(ty != SuballocationType::Free);
        let item = request.item;
        let (old_offset, old_size) = {
            let suballoc = self.suballocations.get(item);
            debug_assert!(suballoc.ty == SuballocationType::Free);
            (suballoc.offset, suballoc.size)
        };
        debug_assert!(request.offset >= old_offset);
        let padding_begin = request.offset - old_offset;
        debug_assert!(old_size >= padding_begin + alloc_size);
        let padding_end = old_size - padding_begin - alloc_size;

        self.unregister_free(item);
        {
            let suballoc = self.suballocations.get_mut(item);
            suballoc.offset = request.offset;
            suballoc.size = alloc_size;
            suballoc.ty = ty;
            suballoc.record = Some(record);
        }
        if padding_end > 0 {
            let index = self.suballocations.insert_after(
                item,
                Suballocation {
                    offset: request.offset + alloc_size,
                    size: padding_end,
                    ty: SuballocationType::Free,
                    record: None,
                },
            );
            self.register_free(index);
        }
        if padding_begin > 0 {
            let index = self.suballocations.insert_before(
                item,
                Suballocation {
                    offset: old_offset,
                    size: padding_begin,
                    ty: SuballocationType::Free,
                    record: None,
                },
            );
            self.register_free(index);
        }
        self.free_count = self.free_count - 1
            + usize::from(padding_begin > 0)
            + usize::from(padding_end > 0);
        self.sum_free_size -= alloc_size;
        debug_assert!(self.validate().is_ok());
    }

    /// Release the suballocation owned by `record`.
    pub fn free(&mut self, record: &Arc<AllocRecord>) {
        let found = self
            .suballocations
            .iter()
            .find(|(_, suballoc)| {
                suballoc
                    .record
                    .as_ref()
                    .map_or(false, |r| Arc::ptr_eq(r, record))
            })
            .map(|(item, _)| item);
        match found {
            Some(item) => {
                self.free_suballocation(item);
                debug_assert!(self.validate().is_ok());
            }
            None => debug_assert!(false, "allocation not found in block"),
        }
    }

    /// Release the suballocation starting at `offset`.
    pub fn free_at_offset(&mut self, offset: u64) {
        let found = self
            .suballocations
            .iter()
            .find(|(_, suballoc)| {
                suballoc.ty != SuballocationType::Free && suballoc.offset == offset
            })
            .map(|(item, _)| item);
        match found {
            Some(item) => {
                self.free_suballocation(item);
                debug_assert!(self.validate().is_ok());
            }
            None => debug_assert!(false, "no allocation at offset {offset}"),
        }
    }

    /// Evict every stale lost-eligible allocation. Returns how many were
    /// reclaimed. Idempotent within a frame.
    pub fn make_allocations_lost(&mut self, current_frame: u32, frame_in_use_count: u32) -> usize {
        let mut lost = 0;
        let mut cursor = self.suballocations.head();
        while let Some(item) = cursor {
            let suballoc = self.suballocations.get(item);
            let evict = suballoc.ty != SuballocationType::Free
                && suballoc.record.as_ref().is_some_and(|record| {
                    record.can_become_lost()
                        && record.make_lost(current_frame, frame_in_use_count)
                });
            cursor = if evict {
                let merged = self.free_suballocation(item);
                lost += 1;
                self.suballocations.next(merged)
            } else {
                self.suballocations.next(item)
            };
        }
        debug_assert!(self.validate().is_ok());
        lost
    }

    /// Evict the victims of a request whose `items_to_make_lost_count` is
    /// non-zero, updating the request to the merged free range. Fails if any
    /// victim was touched since the request was created.
    pub fn make_requested_lost(
        &mut self,
        request: &mut AllocationRequest,
        current_frame: u32,
        frame_in_use_count: u32,
    ) -> bool {
        while request.items_to_make_lost_count > 0 {
            if self.suballocations.get(request.item).ty == SuballocationType::Free {
                match self.suballocations.next(request.item) {
                    Some(next) => request.item = next,
                    None => return false,
                }
            }
            let suballoc = self.suballocations.get(request.item);
            debug_assert!(suballoc.ty != SuballocationType::Free);
            let record = match &suballoc.record {
                Some(record) => record.clone(),
                None => return false,
            };
            if record.can_become_lost() && record.make_lost(current_frame, frame_in_use_count) {
                request.item = self.free_suballocation(request.item);
                request.items_to_make_lost_count -= 1;
            } else {
                return false;
            }
        }
        debug_assert!(self.validate().is_ok());
        debug_assert!(self.suballocations.get(request.item).ty == SuballocationType::Free);
        true
    }

    /// Confirm every structural invariant. Used by tests and debug
    /// assertions.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.suballocations.len() == 0 {
            return Err("suballocation list is empty");
        }
        let mut calculated_offset = 0u64;
        let mut calculated_free_count = 0usize;
        let mut calculated_sum_free = 0u64;
        let mut registerable_free = 0usize;
        let mut prev_free = false;
        for (_, suballoc) in self.suballocations.iter() {
            if suballoc.offset != calculated_offset {
                return Err("suballocation offsets are not contiguous");
            }
            let is_free = suballoc.ty == SuballocationType::Free;
            if is_free && prev_free {
                return Err("two adjacent free suballocations");
            }
            if is_free != suballoc.record.is_none() {
                return Err("free flag and back-record disagree");
            }
            if is_free {
                calculated_sum_free += suballoc.size;
                calculated_free_count += 1;
                if suballoc.size >= MIN_FREE_SUBALLOCATION_SIZE_TO_REGISTER {
                    registerable_free += 1;
                }
            }
            calculated_offset += suballoc.size;
            prev_free = is_free;
        }
        if calculated_offset != self.size {
            return Err("suballocations do not span the block");
        }
        if calculated_sum_free != self.sum_free_size {
            return Err("sum of free sizes out of sync");
        }
        if calculated_free_count != self.free_count {
            return Err("free count out of sync");
        }
        if registerable_free != self.free_by_size.len() {
            return Err("free index size out of sync");
        }
        let mut last_size = 0u64;
        for &index in &self.free_by_size {
            let suballoc = self.suballocations.get(index);
            if suballoc.ty != SuballocationType::Free {
                return Err("free index entry points at an occupied suballocation");
            }
            if suballoc.size < MIN_FREE_SUBALLOCATION_SIZE_TO_REGISTER {
                return Err("free index entry below registerable size");
            }
            if suballoc.size < last_size {
                return Err("free index not sorted by size");
            }
            last_size = suballoc.size;
        }
        Ok(())
    }

    /// Flip `item` to free, merge with free neighbours, re-index. Returns
    /// the handle of the resulting free range.
    fn free_suballocation(&mut self, item: NodeIndex) -> NodeIndex {
        {
            let suballoc = self.suballocations.get_mut(item);
            suballoc.ty = SuballocationType::Free;
            suballoc.record = None;
        }
        self.free_count += 1;
        self.sum_free_size += self.suballocations.get(item).size;

        let next = self.suballocations.next(item);
        let prev = self.suballocations.prev(item);
        let merge_next =
            next.is_some_and(|n| self.suballocations.get(n).ty == SuballocationType::Free);
        let merge_prev =
            prev.is_some_and(|p| self.suballocations.get(p).ty == SuballocationType::Free);

        if merge_next {
            let next = next.expect("checked above");
            self.unregister_free(next);
            self.merge_free_with_next(item);
        }
        if merge_prev {
            let prev = prev.expect("checked above");
            self.unregister_free(prev);
            self.merge_free_with_next(prev);
            self.register_free(prev);
            prev
        } else {
            self.register_free(item);
            item
        }
    }

    /// Merge the free suballocation after `item` into `item`.
    fn merge_free_with_next(&mut self, item: NodeIndex) {
        let next = self
            .suballocations
            .next(item)
            .expect("merge target has no successor");
        debug_assert!(self.suballocations.get(next).ty == SuballocationType::Free);
        let next_size = self.suballocations.get(next).size;
        self.suballocations.get_mut(item).size += next_size;
        self.free_count -= 1;
        self.suballocations.remove(next);
    }

    fn register_free(&mut self, item: NodeIndex) {
        let size = self.suballocations.get(item).size;
        if size < MIN_FREE_SUBALLOCATION_SIZE_TO_REGISTER {
            return;
        }
        let suballocations = &self.suballocations;
        let position = self
            .free_by_size
            .partition_point(|&index| suballocations.get(index).size <= size);
        self.free_by_size.insert(position, item);
    }

    fn unregister_free(&mut self, item: NodeIndex) {
        let size = self.suballocations.get(item).size;
        if size < MIN_FREE_SUBALLOCATION_SIZE_TO_REGISTER {
            return;
        }
        let suballocations = &self.suballocations;
        let mut position = self
            .free_by_size
            .partition_point(|&index| suballocations.get(index).size < size);
        while position < self.free_by_size.len() {
            if self.free_by_size[position] == item {
                self.free_by_size.remove(position);
                return;
            }
            debug_assert!(self.suballocations.get(self.free_by_size[position]).size == size);
            position += 1;
        }
        debug_assert!(false, "free suballocation was not registered");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_ctx(size: u64, alignment: u64, ty: SuballocationType) -> RequestContext {
        RequestContext {
            current_frame: 0,
            frame_in_use_count: 0,
            buffer_image_granularity: 1,
            alloc_size: size,
            alloc_alignment: alignment,
            alloc_type: ty,
            can_make_other_lost: false,
            strategy: Strategy::FirstFit,
        }
    }

    fn record() -> Arc<AllocRecord> {
        Arc::new(AllocRecord::new(0, false, false))
    }

    fn lost_eligible_record(frame: u32) -> Arc<AllocRecord> {
        Arc::new(AllocRecord::new(frame, true, false))
    }

    fn alloc_at(meta: &mut BlockMetadata, ctx: &RequestContext) -> u64 {
        let request = meta.try_create_request(ctx).expect("request must fit");
        meta.alloc(&request, ctx.alloc_type, ctx.alloc_size, record());
        request.offset
    }

    #[test]
    fn empty_block_exact_fit() {
        let mut meta = BlockMetadata::new(1024);
        assert!(meta.is_empty());
        let ctx = request_ctx(1024, 1, SuballocationType::Buffer);
        let request = meta.try_create_request(&ctx).unwrap();
        assert_eq!(request.offset, 0);
        assert_eq!(request.sum_free_size, 1024);
        meta.alloc(&request, SuballocationType::Buffer, 1024, record());
        assert_eq!(meta.sum_free_size(), 0);
        assert_eq!(meta.allocation_count(), 1);
        assert!(!meta.is_empty());
        meta.validate().unwrap();
    }

    #[test]
    fn oversized_request_is_rejected() {
        let meta = BlockMetadata::new(1024);
        let ctx = request_ctx(1025, 1, SuballocationType::Buffer);
        assert!(meta.try_create_request(&ctx).is_none());
    }

    #[test]
    fn best_fit_vs_worst_fit() {
        // build: used gaps at [256..384) and [640..768), free elsewhere
        let mut meta = BlockMetadata::new(1024);
        let offsets: Vec<u64> = [256u64, 128, 256, 128, 256]
            .iter()
            .map(|&size| alloc_at(&mut meta, &request_ctx(size, 1, SuballocationType::Buffer)))
            .collect();
        assert_eq!(offsets, [0, 256, 384, 640, 768]);
        meta.free_at_offset(0);
        meta.free_at_offset(768);
        meta.free_at_offset(384);
        meta.validate().unwrap();
        assert_eq!(meta.sum_free_size(), 768);

        let mut ctx = request_ctx(128, 1, SuballocationType::Buffer);
        ctx.strategy = Strategy::BestFit;
        let request = meta.try_create_request(&ctx).unwrap();
        assert_eq!(request.offset, 0);

        ctx.strategy = Strategy::WorstFit;
        let request = meta.try_create_request(&ctx).unwrap();
        assert_eq!(request.offset, 384);
    }

    #[test]
    fn alignment_padding() {
        let mut meta = BlockMetadata::new(4096);
        let ctx = request_ctx(100, 256, SuballocationType::Buffer);
        assert_eq!(alloc_at(&mut meta, &ctx), 0);
        // next placement must skip to the alignment boundary, leaving the
        // range [100..256) free
        assert_eq!(alloc_at(&mut meta, &ctx), 256);
        meta.validate().unwrap();
        assert_eq!(meta.sum_free_size(), 4096 - 200);
        assert_eq!(meta.allocation_count(), 2);
        // the [100..256) leading pad exists and is below registerable use
        // for a 256-byte aligned follow-up
        let request = meta.try_create_request(&ctx).unwrap();
        assert_eq!(request.offset, 512);
    }

    #[test]
    fn granularity_conflict_pushes_offset() {
        let mut meta = BlockMetadata::new(4096);
        let mut ctx = request_ctx(200, 1, SuballocationType::Buffer);
        ctx.buffer_image_granularity = 256;
        assert_eq!(alloc_at(&mut meta, &ctx), 0);

        let mut ctx = request_ctx(100, 1, SuballocationType::ImageOptimal);
        ctx.buffer_image_granularity = 256;
        let request = meta.try_create_request(&ctx).unwrap();
        assert_eq!(request.offset, 256);
        meta.alloc(&request, ctx.alloc_type, ctx.alloc_size, record());
        meta.validate().unwrap();
    }

    #[test]
    fn granularity_compatible_types_pack_tightly() {
        let mut meta = BlockMetadata::new(4096);
        let mut ctx = request_ctx(200, 1, SuballocationType::Buffer);
        ctx.buffer_image_granularity = 256;
        assert_eq!(alloc_at(&mut meta, &ctx), 0);
        // a second buffer may share the page
        assert_eq!(alloc_at(&mut meta, &ctx), 200);
    }

    #[test]
    fn forward_granularity_conflict_rejects() {
        let mut meta = BlockMetadata::new(512);
        // two optimal images pack back to back, [0..300) and [300..512)
        let mut img = request_ctx(300, 1, SuballocationType::ImageOptimal);
        img.buffer_image_granularity = 256;
        assert_eq!(alloc_at(&mut meta, &img), 0);
        let mut img = request_ctx(212, 1, SuballocationType::ImageOptimal);
        img.buffer_image_granularity = 256;
        assert_eq!(alloc_at(&mut meta, &img), 300);
        meta.free_at_offset(0);

        // a buffer ending on the surviving image's page is rejected
        let mut buf = request_ctx(260, 1, SuballocationType::Buffer);
        buf.buffer_image_granularity = 256;
        assert!(meta.try_create_request(&buf).is_none());
        // one confined to the first page is accepted
        let mut buf = request_ctx(200, 1, SuballocationType::Buffer);
        buf.buffer_image_granularity = 256;
        let request = meta.try_create_request(&buf).unwrap();
        assert_eq!(request.offset, 0);
    }

    #[test]
    fn free_merges_both_neighbours() {
        let mut meta = BlockMetadata::new(1024);
        let ctx = request_ctx(256, 1, SuballocationType::Buffer);
        let first = alloc_at(&mut meta, &ctx);
        let second = alloc_at(&mut meta, &ctx);
        let third = alloc_at(&mut meta, &ctx);
        assert_eq!((first, second, third), (0, 256, 512));
        meta.free_at_offset(first);
        meta.free_at_offset(third);
        // freeing the middle one merges left, middle, right and the block
        // tail into a single range
        meta.free_at_offset(second);
        assert!(meta.is_empty());
        assert_eq!(meta.sum_free_size(), 1024);
        assert_eq!(meta.unused_range_size_max(), 1024);
        meta.validate().unwrap();
    }

    #[test]
    fn alternating_alloc_free_is_canonical() {
        let mut meta = BlockMetadata::new(2048);
        let ctx = request_ctx(512, 64, SuballocationType::Buffer);
        for _ in 0..8 {
            let a = alloc_at(&mut meta, &ctx);
            let b = alloc_at(&mut meta, &ctx);
            meta.free_at_offset(a);
            meta.free_at_offset(b);
            assert!(meta.is_empty());
            assert_eq!(meta.sum_free_size(), 2048);
            meta.validate().unwrap();
        }
    }

    #[test]
    fn commit_and_free_round_trip_sum_free_size() {
        let mut meta = BlockMetadata::new(4096);
        let ctx = request_ctx(100, 128, SuballocationType::Buffer);
        let before = meta.sum_free_size();
        let request = meta.try_create_request(&ctx).unwrap();
        assert_eq!(request.offset % 128, 0);
        meta.alloc(&request, ctx.alloc_type, ctx.alloc_size, record());
        assert!(meta.sum_free_size() <= before);
        meta.free_at_offset(request.offset);
        assert_eq!(meta.sum_free_size(), before);
        meta.validate().unwrap();
    }

    #[test]
    fn lost_reclamation() {
        let mut meta = BlockMetadata::new(3072);
        let ctx = request_ctx(1024, 1, SuballocationType::Buffer);
        let records: Vec<_> = (0..3).map(|_| lost_eligible_record(0)).collect();
        for record in &records {
            let request = meta.try_create_request(&ctx).unwrap();
            meta.alloc(&request, ctx.alloc_type, ctx.alloc_size, record.clone());
        }
        assert_eq!(meta.sum_free_size(), 0);

        // untouched for 3 frames with frame_in_use_count = 2: evictable
        let mut ctx = request_ctx(1024, 1, SuballocationType::Buffer);
        ctx.current_frame = 3;
        ctx.frame_in_use_count = 2;
        ctx.can_make_other_lost = true;
        let mut request = meta.try_create_request(&ctx).unwrap();
        assert_eq!(request.sum_item_size, 1024);
        assert_eq!(request.items_to_make_lost_count, 1);

        assert!(meta.make_requested_lost(&mut request, ctx.current_frame, ctx.frame_in_use_count));
        meta.alloc(&request, ctx.alloc_type, ctx.alloc_size, record());
        meta.validate().unwrap();
        assert_eq!(meta.allocation_count(), 3);
        assert_eq!(records.iter().filter(|r| r.is_lost()).count(), 1);
    }

    #[test]
    fn touched_victim_fails_make_requested_lost() {
        let mut meta = BlockMetadata::new(1024);
        let victim = lost_eligible_record(0);
        let ctx = request_ctx(1024, 1, SuballocationType::Buffer);
        let request = meta.try_create_request(&ctx).unwrap();
        meta.alloc(&request, ctx.alloc_type, ctx.alloc_size, victim.clone());

        let mut ctx = request_ctx(1024, 1, SuballocationType::Buffer);
        ctx.current_frame = 5;
        ctx.frame_in_use_count = 1;
        ctx.can_make_other_lost = true;
        let mut request = meta.try_create_request(&ctx).unwrap();
        assert_eq!(request.items_to_make_lost_count, 1);
        // the owner touches the allocation between request and commit
        assert!(victim.touch(5, 1));
        assert!(!meta.make_requested_lost(&mut request, 5, 1));
        assert!(!victim.is_lost());
    }

    #[test]
    fn make_allocations_lost_is_idempotent_and_monotonic() {
        let mut meta = BlockMetadata::new(2048);
        let ctx = request_ctx(512, 1, SuballocationType::Buffer);
        let records: Vec<_> = (0..2)
            .map(|_| {
                let record = lost_eligible_record(0);
                let request = meta.try_create_request(&ctx).unwrap();
                meta.alloc(&request, ctx.alloc_type, ctx.alloc_size, record.clone());
                record
            })
            .collect();
        // keep one allocation alive past the window
        assert!(records[1].touch(4, 2));

        assert_eq!(meta.make_allocations_lost(4, 2), 1);
        assert_eq!(meta.make_allocations_lost(4, 2), 0);
        // later frame reclaims the survivor too
        assert_eq!(meta.make_allocations_lost(8, 2), 1);
        assert!(meta.is_empty());
        meta.validate().unwrap();
    }

    #[test]
    fn free_index_tracks_registerable_ranges() {
        let mut meta = BlockMetadata::new(256);
        let ctx = request_ctx(120, 1, SuballocationType::Buffer);
        let first = alloc_at(&mut meta, &ctx);
        let ctx = request_ctx(128, 1, SuballocationType::Buffer);
        let second = alloc_at(&mut meta, &ctx);
        assert_eq!((first, second), (0, 120));
        // remaining free tail [248..256) is below the registerable minimum
        assert_eq!(meta.sum_free_size(), 8);
        assert_eq!(meta.unused_range_size_max(), 0);
        meta.validate().unwrap();
        meta.free_at_offset(first);
        meta.free_at_offset(second);
        assert!(meta.is_empty());
    }

    #[test]
    fn min_offset_strategy_prefers_low_addresses() {
        let mut meta = BlockMetadata::new(1024);
        let ctx = request_ctx(128, 1, SuballocationType::Buffer);
        let offsets: Vec<u64> = (0..4).map(|_| alloc_at(&mut meta, &ctx)).collect();
        assert_eq!(offsets, [0, 128, 256, 384]);
        meta.free_at_offset(128);
        meta.free_at_offset(384);
        let mut ctx = request_ctx(64, 1, SuballocationType::Buffer);
        ctx.strategy = Strategy::MinOffset;
        let request = meta.try_create_request(&ctx).unwrap();
        assert_eq!(request.offset, 128);
    }
}
