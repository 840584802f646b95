//! Alignment constants and the one arithmetic helper everything else builds on.

use core::mem::size_of;

use crate::block::Header;

/// All payload and header sizes are rounded up to a multiple of this.
pub const ALIGNMENT: usize = 8;

/// Threshold below which requests are served from the program break rather
/// than via `mmap`. Mutable because `zero_allocate` temporarily lowers it to
/// the page size (see `Allocator::zero_allocate`).
pub const DEFAULT_MAP_THRESHOLD: usize = 128 * 1024;

/// Size of the one-shot initial heap extent, in bytes (header included).
pub const PREALLOC_SIZE: usize = 128 * 1024;

/// Rounds `value` up to the next multiple of [`ALIGNMENT`].
#[inline]
pub const fn align8(value: usize) -> usize {
    (value + ALIGNMENT - 1) & !(ALIGNMENT - 1)
}

/// The header's footprint once padded to [`ALIGNMENT`].
///
/// `size_of::<Header>()` is already a multiple of 8 on every platform this
/// crate targets (three `usize`/pointer-sized fields), but we round anyway
/// so the invariant holds even if `Header` grows a sub-word field later.
#[inline]
pub fn header_footprint() -> usize {
    align8(size_of::<Header>())
}
