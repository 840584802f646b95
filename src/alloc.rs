//! The placement/free-list engine: the four public operations and the
//! best-fit/coalesce/split machinery that backs them.

use core::ptr;

use crate::block::{BlockList, Header, Status};
use crate::layout::{align8, header_footprint, DEFAULT_MAP_THRESHOLD, PREALLOC_SIZE};
use crate::os::{fatal, OsBackend};

/// Returns the smaller of two lengths.
///
/// Standalone (rather than inlined into `resize`'s copy-length computation)
/// because the original implementation this design is modeled on exposed it
/// as its own function; kept that way here so it stays independently
/// testable.
#[inline]
pub fn min(a: usize, b: usize) -> usize {
    if a < b {
        a
    } else {
        b
    }
}

/// Snapshot of the allocator's bookkeeping, for diagnostics and tests.
/// Read-only: computing it never mutates the list or takes the allocator's
/// lock reentrantly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Stats {
    pub live_blocks: usize,
    pub free_blocks: usize,
    pub mapped_blocks: usize,
    pub live_payload_bytes: usize,
}

/// Owns the block list and the OS backend it pulls fresh pages from.
///
/// Generic over [`OsBackend`] so the policy below can be driven by an
/// in-process fake in tests (see `os::test_support::FakeBackend`) instead of
/// the real program break.
pub struct Allocator<B: OsBackend> {
    backend: B,
    list: BlockList,
    heap_preallocated: bool,
    /// Payload+header size at or above which a request is served via
    /// mapping. Temporarily lowered to the page size by `zero_allocate`.
    map_threshold: usize,
    /// This allocator's own last-known top of the program break, used only
    /// to `debug_assert` the physical-adjacency assumption coalescing
    /// depends on (§9 of the design log: "Implementations must ... assert
    /// it in debug builds — foreign break usage voids correctness.").
    /// `None` until the first break extension.
    break_top: Option<usize>,
}

impl<B: OsBackend> Allocator<B> {
    pub const fn new(backend: B) -> Self {
        Self {
            backend,
            list: BlockList::new(),
            heap_preallocated: false,
            map_threshold: DEFAULT_MAP_THRESHOLD,
            break_top: None,
        }
    }

    /// `allocate(0)` yields null; otherwise an 8-byte-aligned payload of at
    /// least `align8(size)` bytes, uninitialized.
    pub fn allocate(&mut self, size: usize) -> *mut u8 {
        if size == 0 {
            return ptr::null_mut();
        }

        let header = if self.request_total(size) < self.map_threshold {
            self.allocate_small(size)
        } else {
            let block = self.acquire_mapped(size);
            self.list.insert(block);
            block
        };

        Header::payload(header)
    }

    /// No-op on null or unrecognized handles. Otherwise frees the block:
    /// heap-sourced blocks are marked free and the list is coalesced;
    /// mapped blocks are unmapped and removed from the list.
    pub fn free(&mut self, payload: *mut u8) {
        if payload.is_null() {
            return;
        }
        let header = unsafe { Header::from_payload(payload) };
        if !self.list.contains(header) {
            log::warn!("free() called with a pointer not owned by this allocator");
            return;
        }
        self.free_known(header);
    }

    /// As `allocate`, but the payload is zeroed. Temporarily lowers
    /// `map_threshold` to the page size so any request at least a page
    /// large is served via `mmap` and inherits the OS's pre-zeroed pages;
    /// the final `memset`-equivalent below still runs unconditionally, so
    /// correctness never depends on that optimization.
    pub fn zero_allocate(&mut self, count: usize, size: usize) -> *mut u8 {
        let total = count.saturating_mul(size);
        let saved_threshold = self.map_threshold;
        self.map_threshold = self.backend.page_size();
        let payload = self.allocate(total);
        self.map_threshold = saved_threshold;

        if !payload.is_null() {
            unsafe {
                let header = Header::from_payload(payload);
                ptr::write_bytes(payload, 0, (*header).size);
            }
        }
        payload
    }

    /// Resizes a live allocation, preserving `min(old, new)` bytes. May
    /// move. Null input delegates to `allocate`; `size == 0` delegates to
    /// `free` and returns null; resizing a free (already-released) header
    /// is an invalid-input null return.
    pub fn resize(&mut self, payload: *mut u8, size: usize) -> *mut u8 {
        if payload.is_null() {
            return self.allocate(size);
        }
        if size == 0 {
            self.free(payload);
            return ptr::null_mut();
        }

        let header = unsafe { Header::from_payload(payload) };
        if !self.list.contains(header) {
            log::warn!("resize() called with a pointer not owned by this allocator");
            return ptr::null_mut();
        }
        if unsafe { (*header).status } == Status::Free {
            return ptr::null_mut();
        }

        let requested = align8(size);
        if requested == unsafe { (*header).size } {
            return payload;
        }

        match unsafe { (*header).status } {
            Status::Allocated => self.resize_allocated(header, payload, requested),
            Status::Mapped => self.resize_mapped(header, payload, requested),
            Status::Free => unreachable!("checked above"),
        }
    }

    /// Live bookkeeping, for diagnostics and tests.
    pub fn stats(&self) -> Stats {
        let mut stats = Stats::default();
        let mut current = self.list.head();
        unsafe {
            while !current.is_null() {
                stats.live_blocks += 1;
                stats.live_payload_bytes += (*current).size;
                match (*current).status {
                    Status::Free => stats.free_blocks += 1,
                    Status::Mapped => stats.mapped_blocks += 1,
                    Status::Allocated => {}
                }
                current = (*current).next;
            }
        }
        stats
    }

    // ---- internal: allocate -------------------------------------------

    fn request_total(&self, size: usize) -> usize {
        align8(size) + header_footprint()
    }

    fn allocate_small(&mut self, size: usize) -> *mut Header {
        self.preallocate_heap_if_needed();
        let requested = align8(size);

        if let Some(block) = self.best_fit(requested) {
            self.split_block(block, requested);
            return block;
        }

        if let Some(tail) = self.free_tail() {
            return self.tail_extend(tail, requested);
        }

        let block = self.acquire_heap_block(size);
        self.list.insert(block);
        block
    }

    fn preallocate_heap_if_needed(&mut self) {
        if self.heap_preallocated {
            return;
        }
        self.heap_preallocated = true;

        let address = self
            .backend
            .extend_break(PREALLOC_SIZE)
            .unwrap_or_else(|e| fatal(&format!("preallocating the heap: {e}")));
        self.break_top = Some(address + PREALLOC_SIZE);
        let block = address as *mut Header;
        unsafe {
            (*block).size = PREALLOC_SIZE - header_footprint();
            (*block).next = ptr::null_mut();
            (*block).status = Status::Free;
        }
        self.list.insert(block);
        log::debug!("preallocated {PREALLOC_SIZE} byte heap extent");
    }

    fn acquire_heap_block(&mut self, size: usize) -> *mut Header {
        let total = self.request_total(size);
        let address = self
            .backend
            .extend_break(total)
            .unwrap_or_else(|e| fatal(&format!("extending the heap: {e}")));

        if let Some(expected_top) = self.break_top {
            debug_assert_eq!(
                address, expected_top,
                "program break moved independently of this allocator between two of its \
                 own extensions — foreign break usage voids the physical-adjacency \
                 assumption coalescing relies on"
            );
        }
        self.break_top = Some(address + total);

        let block = address as *mut Header;
        unsafe {
            (*block).size = align8(size);
            (*block).next = ptr::null_mut();
            (*block).status = Status::Allocated;
        }
        block
    }

    fn acquire_mapped(&mut self, size: usize) -> *mut Header {
        let total = self.request_total(size);
        let address = self
            .backend
            .map_anonymous(total)
            .unwrap_or_else(|e| fatal(&format!("mapping a new region: {e}")));
        let block = address as *mut Header;
        unsafe {
            (*block).size = align8(size);
            (*block).next = ptr::null_mut();
            (*block).status = Status::Mapped;
        }
        block
    }

    // ---- internal: coalesce & split ------------------------------------

    /// Merges `right`'s size/next into `left` without touching `left`'s
    /// status. Used by [`coalesce_pair`](Self::coalesce_pair) (where `left`
    /// is free on entry and gets force-marked free again) and by
    /// `resize_allocated`'s grow-absorb path (where `left` is `Allocated`
    /// and stays that way) — the one arithmetic step both share, with the
    /// status decision left to the caller.
    fn merge_sizes(left: *mut Header, right: *mut Header) {
        unsafe {
            (*left).size += (*right).size + header_footprint();
            (*left).next = (*right).next;
        }
    }

    /// Merges `right` (`== left.next`) into `left`. Caller guarantees both
    /// are free and memory-adjacent.
    fn coalesce_pair(left: *mut Header, right: *mut Header) {
        unsafe {
            log::trace!(
                "coalescing free blocks at {left:p} ({} bytes) and {right:p} ({} bytes)",
                (*left).size,
                (*right).size
            );
        }
        Self::merge_sizes(left, right);
        unsafe {
            (*left).status = Status::Free;
        }
    }

    /// Walks the whole list merging adjacent free pairs. Mapped blocks are
    /// never free, so mapped/heap mixing at the head/tail boundary never
    /// triggers a cross-source merge.
    fn coalesce_pass(&mut self) {
        log::trace!("running a coalesce pass over the block list");
        let mut current = self.list.head();
        unsafe {
            while !current.is_null() && !(*current).next.is_null() {
                let next = (*current).next;
                if (*current).status == Status::Free && (*next).status == Status::Free {
                    Self::coalesce_pair(current, next);
                    // re-examine `current` against its new successor
                    continue;
                }
                current = (*current).next;
            }
        }
    }

    /// Carves a free tail off `block` if the remainder would be at least 8
    /// bytes; otherwise just marks the whole (oversized) block allocated.
    fn split_block(&mut self, block: *mut Header, requested: usize) {
        unsafe {
            let footprint = header_footprint();
            if (*block).size >= requested + footprint + 8 {
                let new_block = ((block as *mut u8).add(footprint + requested)) as *mut Header;
                (*new_block).size = (*block).size - requested - footprint;
                (*new_block).next = (*block).next;
                (*new_block).status = Status::Free;

                (*block).size = requested;
                (*block).next = new_block;
                (*block).status = Status::Allocated;
                log::debug!(
                    "split block at {block:p}: kept {requested} bytes, carved a {} byte free tail at {new_block:p}",
                    (*new_block).size
                );
            } else {
                (*block).status = Status::Allocated;
                log::trace!(
                    "block at {block:p} kept oversized ({} bytes) for a {requested}-byte request; remainder below the split floor",
                    (*block).size
                );
            }
        }
    }

    // ---- internal: best-fit & tail extension ---------------------------

    /// Coalesces the whole list, then returns the smallest free block that
    /// still fits `requested`, or `None`. Ties go to the earliest list
    /// position: the replacement test is a strict `>`, so the first
    /// equally-sized candidate found is kept.
    fn best_fit(&mut self, requested: usize) -> Option<*mut Header> {
        self.coalesce_pass();

        let mut best: *mut Header = ptr::null_mut();
        let mut current = self.list.head();
        unsafe {
            while !current.is_null() {
                if (*current).status == Status::Free && (*current).size >= requested {
                    if best.is_null() || (*best).size > (*current).size {
                        best = current;
                    }
                }
                current = (*current).next;
            }
        }
        (!best.is_null()).then_some(best)
    }

    fn free_tail(&self) -> Option<*mut Header> {
        let tail = self.list.tail();
        if tail.is_null() {
            return None;
        }
        (unsafe { (*tail).status } == Status::Free).then_some(tail)
    }

    /// Grows the break just enough to bring `last` (already known free) up
    /// to `requested` bytes, then marks it allocated. Preferred over a fresh
    /// block when best-fit fails, so no permanent free gap is left next to
    /// a brand-new allocation.
    fn tail_extend(&mut self, last: *mut Header, requested: usize) -> *mut Header {
        let last_size = unsafe { (*last).size };
        let footprint = header_footprint();
        // Saturating: when `last_size + footprint` is already within a
        // header's width of `requested`, a zero-payload break extension
        // (just the new header, immediately coalesced away) is enough.
        let extra_payload = requested.saturating_sub(last_size).saturating_sub(footprint);
        log::debug!(
            "extending the break by {extra_payload} payload bytes to grow the free tail at \
             {last:p} from {last_size} to {requested} bytes"
        );

        let fresh = self.acquire_heap_block(extra_payload);
        unsafe {
            (*fresh).status = Status::Free;
        }
        Self::coalesce_pair(last, fresh);
        unsafe {
            (*last).status = Status::Allocated;
        }
        last
    }

    // ---- internal: free -------------------------------------------------

    fn free_known(&mut self, header: *mut Header) {
        match unsafe { (*header).status } {
            Status::Allocated => {
                unsafe {
                    (*header).status = Status::Free;
                }
                self.coalesce_pass();
            }
            Status::Mapped => {
                self.list.remove(header);
                let total = unsafe { (*header).size } + header_footprint();
                self.backend
                    .unmap(header as usize, total)
                    .unwrap_or_else(|e| fatal(&format!("unmapping a region: {e}")));
            }
            Status::Free => {
                // Second free of an already-free header: the coalesce pass
                // is idempotent, so this is silently accepted. Robust
                // double-free detection is explicitly out of scope.
            }
        }
    }

    // ---- internal: resize ------------------------------------------------

    fn resize_allocated(
        &mut self,
        header: *mut Header,
        payload: *mut u8,
        requested: usize,
    ) -> *mut u8 {
        let current_size = unsafe { (*header).size };

        if requested < current_size {
            self.split_block(header, requested);
            return payload;
        }

        // Growing. Try to absorb a free successor first.
        self.coalesce_pass();
        let next = unsafe { (*header).next };
        if !next.is_null() && unsafe { (*next).status } == Status::Free {
            let combined = current_size + unsafe { (*next).size } + header_footprint();
            if combined >= requested {
                // `header` is `Allocated`, not free — `coalesce_pair`'s
                // precondition doesn't hold here, so merge the raw sizes
                // directly and leave `header`'s (already-correct) status
                // alone rather than bouncing it through `Free`.
                log::trace!(
                    "resize: absorbing free successor at {next:p} into {header:p} to grow \
                     in place ({current_size} -> {requested} bytes)"
                );
                Self::merge_sizes(header, next);
                self.split_block(header, requested);
                return payload;
            }
        }

        // Couldn't grow in place. Correct order regardless of tail
        // position: allocate the replacement and copy the old bytes before
        // freeing the old block. (The C implementation this design is
        // modeled on frees the tail-block case first, then reads from it
        // for the copy — a use-after-free once the coalesce pass runs. See
        // the design log for that history; this crate never does that.)
        let new_payload = self.allocate(requested);
        if new_payload.is_null() {
            return ptr::null_mut();
        }
        unsafe {
            ptr::copy_nonoverlapping(payload, new_payload, min(current_size, requested));
        }
        self.free(payload);
        new_payload
    }

    fn resize_mapped(&mut self, _header: *mut Header, payload: *mut u8, requested: usize) -> *mut u8 {
        // Always relocate; a mapped block shrinking below the threshold
        // demotes to a heap block automatically via `allocate`.
        let old_size = unsafe { (*_header).size };
        let new_payload = self.allocate(requested);
        if new_payload.is_null() {
            return ptr::null_mut();
        }
        unsafe {
            ptr::copy_nonoverlapping(payload, new_payload, min(old_size, requested));
        }
        self.free(payload);
        new_payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os::test_support::FakeBackend;

    const ARENA: usize = 4 * 1024 * 1024;
    const PAGE: usize = 4096;

    fn new_allocator() -> Allocator<FakeBackend> {
        let _ = env_logger::try_init();
        Allocator::new(FakeBackend::new(ARENA, PAGE))
    }

    #[test]
    fn allocate_zero_yields_null_and_touches_nothing() {
        let mut a = new_allocator();
        assert!(a.allocate(0).is_null());
        assert_eq!(a.stats(), Stats::default());
    }

    #[test]
    fn first_small_allocation_preallocates_heap() {
        let mut a = new_allocator();
        let p = a.allocate(100);
        assert!(!p.is_null());
        assert_eq!(p as usize % 8, 0);

        let stats = a.stats();
        assert_eq!(stats.live_blocks, 2); // the allocated block + the free tail
        assert_eq!(stats.free_blocks, 1);
        assert_eq!(stats.live_payload_bytes, PREALLOC_SIZE - header_footprint());
    }

    #[test]
    fn round_trip_free_then_realloc_reuses_memory_without_growing_break() {
        let mut a = new_allocator();
        let p = a.allocate(200);
        a.free(p);
        let stats_after_free = a.stats();
        assert_eq!(stats_after_free.live_blocks, 1);
        assert_eq!(stats_after_free.free_blocks, 1);

        let q = a.allocate(200);
        assert!(!q.is_null());
        // Reused the same preallocated extent: still exactly one allocated
        // block plus one free remainder, no fresh break extension happened.
        let stats_after_realloc = a.stats();
        assert_eq!(stats_after_realloc.live_blocks, 2);
        assert_eq!(stats_after_realloc.free_blocks, 1);
    }

    #[test]
    fn two_frees_coalesce_back_to_the_full_preallocation() {
        let mut a = new_allocator();
        let p = a.allocate(200);
        let q = a.allocate(300);
        a.free(p);
        a.free(q);

        let stats = a.stats();
        assert_eq!(stats.live_blocks, 1);
        assert_eq!(stats.free_blocks, 1);
        assert_eq!(stats.live_payload_bytes, PREALLOC_SIZE - header_footprint());
    }

    #[test]
    fn oversized_request_is_mapped_and_sits_at_the_head() {
        let mut a = new_allocator();
        let p = a.allocate(200_000);
        assert!(!p.is_null());

        let header = unsafe { Header::from_payload(p) };
        assert_eq!(unsafe { (*header).status }, Status::Mapped);
        assert_eq!(a.list.head(), header);

        a.free(p);
        assert_eq!(a.stats().live_blocks, 0);
    }

    #[test]
    fn shrinking_resize_keeps_the_same_pointer_and_splits_the_remainder() {
        let mut a = new_allocator();
        let p = a.allocate(100);
        let q = a.resize(p, 50);
        assert_eq!(p, q);

        let header = unsafe { Header::from_payload(q) };
        assert_eq!(unsafe { (*header).size }, align8(50));
    }

    #[test]
    fn resize_to_the_same_aligned_size_is_a_no_op() {
        let mut a = new_allocator();
        let p = a.allocate(100);
        let q = a.resize(p, 100);
        assert_eq!(p, q);
    }

    #[test]
    fn resize_preserves_the_shared_prefix_of_bytes() {
        let mut a = new_allocator();
        let p = a.allocate(16);
        unsafe {
            ptr::write_bytes(p, 0xAB, 16);
        }
        let q = a.resize(p, 4096); // grows well past the original 16-byte block
        assert!(!q.is_null());
        let bytes = unsafe { core::slice::from_raw_parts(q, 16) };
        assert!(bytes.iter().all(|&b| b == 0xAB));
    }

    #[test]
    fn growing_a_block_with_an_allocated_neighbor_relocates_and_copies() {
        let mut a = new_allocator();
        let p1 = a.allocate(64);
        let _p2 = a.allocate(64); // keeps p1's immediate successor allocated, not free
        unsafe {
            ptr::write_bytes(p1, 0x7A, 64);
        }

        let q = a.resize(p1, 512);
        assert_ne!(p1, q, "neighbor was allocated; growth must relocate");
        let bytes = unsafe { core::slice::from_raw_parts(q, 64) };
        assert!(bytes.iter().all(|&b| b == 0x7A));
    }

    #[test]
    fn zero_allocate_returns_zeroed_memory() {
        let mut a = new_allocator();
        let p = a.zero_allocate(1, 4096);
        assert!(!p.is_null());

        let header = unsafe { Header::from_payload(p) };
        assert_eq!(unsafe { (*header).status }, Status::Mapped);

        let bytes = unsafe { core::slice::from_raw_parts(p, 4096) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn freeing_an_unknown_pointer_is_a_silent_no_op() {
        let mut a = new_allocator();
        let mut bogus = 0u64;
        a.free(&mut bogus as *mut u64 as *mut u8);
        assert_eq!(a.stats(), Stats::default());
    }

    #[test]
    fn resize_on_a_freed_block_returns_null() {
        let mut a = new_allocator();
        let p = a.allocate(64);
        a.free(p);
        assert!(a.resize(p, 128).is_null());
    }

    #[test]
    fn no_two_adjacent_blocks_are_ever_both_free() {
        let mut a = new_allocator();
        let p1 = a.allocate(64);
        let p2 = a.allocate(64);
        let p3 = a.allocate(64);
        a.free(p1);
        a.free(p3);
        a.free(p2);

        let mut current = a.list.head();
        unsafe {
            while !current.is_null() && !(*current).next.is_null() {
                let next = (*current).next;
                assert!(
                    !((*current).status == Status::Free && (*next).status == Status::Free),
                    "two adjacent free blocks survived a free()"
                );
                current = next;
            }
        }
    }

    #[test]
    fn best_fit_miss_with_a_free_tail_grows_the_break_in_place() {
        let mut a = new_allocator();

        // Consume almost the whole preallocated pool, leaving a free tail
        // too small to satisfy the next request by itself.
        let prealloc_payload = PREALLOC_SIZE - header_footprint();
        let almost_all = prealloc_payload - header_footprint() - 64;
        let p = a.allocate(almost_all);
        assert!(!p.is_null());
        assert_eq!(a.stats().free_blocks, 1, "split should leave a small free tail");

        // The free tail (64 bytes) can't satisfy this on its own, so
        // best-fit misses; the tail being free forces `tail_extend` rather
        // than a fresh break-extension append.
        let q = a.allocate(4096);
        assert!(!q.is_null());

        let header = unsafe { Header::from_payload(q) };
        assert_eq!(unsafe { (*header).status }, Status::Allocated);
        assert_eq!(unsafe { (*header).size }, align8(4096));
        assert!(a.list.tail() == header, "the extended block is still the list tail");
        assert_eq!(
            a.stats().free_blocks,
            0,
            "tail extension consumed the small free remainder entirely"
        );
    }

    #[test]
    fn best_fit_miss_with_an_allocated_tail_appends_a_fresh_block() {
        let mut a = new_allocator();

        // Consume the entire preallocated pool exactly, leaving the tail
        // `Allocated` rather than `Free`.
        let p = a.allocate(PREALLOC_SIZE - header_footprint());
        assert!(!p.is_null());
        assert_eq!(a.stats().free_blocks, 0);
        assert_eq!(a.stats().live_blocks, 1);

        // No free block anywhere and the tail isn't free either, so this
        // must fall all the way through to a fresh break-extension append.
        let q = a.allocate(256);
        assert!(!q.is_null());
        assert_ne!(p, q);

        let header = unsafe { Header::from_payload(q) };
        assert_eq!(unsafe { (*header).status }, Status::Allocated);
        assert_eq!(unsafe { (*header).size }, align8(256));
        assert_eq!(a.stats().live_blocks, 2);
        assert!(a.list.tail() == header, "the fresh block was appended at the tail");
    }

    #[test]
    fn resizing_a_mapped_allocation_demotes_it_to_a_heap_block() {
        let mut a = new_allocator();
        let p = a.allocate(200_000);
        assert!(!p.is_null());
        let mapped_header = unsafe { Header::from_payload(p) };
        assert_eq!(unsafe { (*mapped_header).status }, Status::Mapped);

        unsafe {
            ptr::write_bytes(p, 0xCD, 56);
        }

        let q = a.resize(p, 50);
        assert!(!q.is_null());
        assert_ne!(p, q, "resize_mapped always relocates");

        let new_header = unsafe { Header::from_payload(q) };
        assert_eq!(
            unsafe { (*new_header).status },
            Status::Allocated,
            "shrinking below the threshold demotes the mapped block to a heap block"
        );
        assert_eq!(unsafe { (*new_header).size }, align8(50));

        let bytes = unsafe { core::slice::from_raw_parts(q, 56) };
        assert!(bytes.iter().all(|&b| b == 0xCD));

        assert_eq!(
            a.stats().mapped_blocks,
            0,
            "the original mapped region was unmapped, not just marked free"
        );
    }
}
