//! A thin substitute for the platform allocator, sitting directly on top of
//! the process's program-break extension primitive (`sbrk`) and its
//! anonymous-mapping primitive (`mmap`).
//!
//! The hard engineering lives in the memory management *policy*, not the
//! syscalls: every live and free region is tracked through an in-band
//! bookkeeping header, small requests and large requests are routed through
//! two different acquisition strategies, fragmentation is kept down with
//! best-fit placement and splitting, adjacent free regions are coalesced,
//! and the heap is grown in place whenever possible rather than abandoned.
//!
//! # Layout
//! - [`block`] — the header record and the intrusive free list.
//! - [`os`] — the syscall boundary (`extend_break` / `map_anonymous` /
//!   `unmap` / `page_size`), behind a small trait so the policy in
//!   [`alloc`] can be driven by an in-process fake in tests.
//! - [`alloc`] — the placement engine: best-fit search, splitting,
//!   coalescing, tail extension, and the four public operations.
//! - [`global`] — an opt-in `GlobalAlloc` adapter.
//!
//! # Concurrency
//! Single-threaded by design (§5 of the design log): there is no internal
//! synchronization for correctness, only a `Mutex` wrapper around the one
//! global instance so the state is never exposed as a bare `static mut`.
//! Calling these functions concurrently from multiple threads is undefined.

mod alloc;
mod block;
mod global;
mod layout;
mod os;

use std::sync::Mutex;

pub use alloc::{min, Stats};
pub use global::SystemHeap;
pub use os::OsError;

use alloc::Allocator;
use os::System;

static GLOBAL: Mutex<Allocator<System>> = Mutex::new(Allocator::new(System));

/// `allocate(0)` returns the null handle; otherwise a valid, uninitialized,
/// 8-byte-aligned payload of at least `align8(size)` bytes.
pub fn allocate(size: usize) -> *mut u8 {
    GLOBAL
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .allocate(size)
}

/// No-op on null or unrecognized handles. Releases memory for known handles.
pub fn free(ptr: *mut u8) {
    GLOBAL
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .free(ptr)
}

/// As [`allocate`], but the payload is zeroed. `count * size` bytes are
/// requested; the threshold for routing through `mmap` is temporarily
/// lowered to the page size for the duration of the call.
pub fn zero_allocate(count: usize, size: usize) -> *mut u8 {
    GLOBAL
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .zero_allocate(count, size)
}

/// Preserves `min(old, new)` payload bytes; may move. Null input delegates
/// to [`allocate`]; `size == 0` delegates to [`free`] and returns null.
pub fn resize(ptr: *mut u8, size: usize) -> *mut u8 {
    GLOBAL
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .resize(ptr, size)
}

/// Snapshot of the global allocator's bookkeeping, for diagnostics.
pub fn stats() -> Stats {
    GLOBAL
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .stats()
}
