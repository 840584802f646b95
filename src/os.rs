//! OS memory sourcing: the two syscall-backed ways to get fresh pages, and
//! the one way to give mapped pages back.
//!
//! The allocation policy in [`crate::alloc`] never calls `libc` directly; it
//! goes through the [`OsBackend`] trait so the policy can be exercised
//! against an in-process fake in tests without touching the real program
//! break (see `FakeBackend` below, and the design note on global mutable
//! state in the project's design log).

use core::fmt;

/// A failure from one of the three OS primitives this crate consumes.
#[derive(Debug)]
pub enum OsError {
    /// `extend_break` returned its failure sentinel.
    BreakExtensionFailed,
    /// `mmap` returned `MAP_FAILED`.
    MappingFailed,
    /// `munmap` returned a nonzero status.
    UnmapFailed,
}

impl fmt::Display for OsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OsError::BreakExtensionFailed => write!(f, "failed to extend the program break"),
            OsError::MappingFailed => write!(f, "anonymous mapping failed"),
            OsError::UnmapFailed => write!(f, "unmapping a region failed"),
        }
    }
}

/// The three OS primitives §6 of the design calls "external interfaces",
/// plus `page_size`. Implemented for the real OS by [`System`]; implemented
/// for tests by an in-process fake so the free-list policy can be verified
/// without depending on the process's actual break or address space.
pub trait OsBackend {
    /// Appends `delta` bytes to the process data segment and returns the
    /// start address of the new region.
    fn extend_break(&mut self, delta: usize) -> Result<usize, OsError>;

    /// Creates a private, zero-initialized, read+write anonymous mapping of
    /// `length` bytes and returns its start address.
    fn map_anonymous(&mut self, length: usize) -> Result<usize, OsError>;

    /// Releases a mapped region exactly matching a prior `map_anonymous`.
    fn unmap(&mut self, address: usize, length: usize) -> Result<(), OsError>;

    /// The platform page size, in bytes.
    fn page_size(&self) -> usize;
}

/// The real backend: `sbrk`/`mmap`/`munmap` via `libc`.
#[derive(Debug, Default, Clone, Copy)]
pub struct System;

impl OsBackend for System {
    #[allow(deprecated)] // sbrk is the exact primitive the design calls for; no replacement exists.
    fn extend_break(&mut self, delta: usize) -> Result<usize, OsError> {
        // SAFETY: `sbrk` has no preconditions beyond the delta fitting in
        // `intptr_t`, which holds for the sizes this allocator ever requests.
        let previous = unsafe { libc::sbrk(delta as libc::intptr_t) };
        if previous == usize::MAX as *mut libc::c_void {
            log::error!("sbrk({delta}) failed");
            return Err(OsError::BreakExtensionFailed);
        }
        Ok(previous as usize)
    }

    fn map_anonymous(&mut self, length: usize) -> Result<usize, OsError> {
        // SAFETY: a fixed, well-known set of flags; no file descriptor is
        // involved (MAP_ANONYMOUS), so there is no aliasing or lifetime
        // concern beyond the returned region itself.
        let region = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                length,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if region == libc::MAP_FAILED {
            log::error!("mmap({length}) failed");
            return Err(OsError::MappingFailed);
        }
        Ok(region as usize)
    }

    fn unmap(&mut self, address: usize, length: usize) -> Result<(), OsError> {
        // SAFETY: caller guarantees `address`/`length` exactly match a prior
        // successful `map_anonymous` call (upheld by `Allocator::free`).
        let result = unsafe { libc::munmap(address as *mut libc::c_void, length) };
        if result != 0 {
            log::error!("munmap({address:#x}, {length}) failed");
            return Err(OsError::UnmapFailed);
        }
        Ok(())
    }

    fn page_size(&self) -> usize {
        // SAFETY: `sysconf` with a well-known, always-valid name.
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        debug_assert!(size > 0, "sysconf(_SC_PAGESIZE) returned a non-positive value");
        size as usize
    }
}

/// Terminates the process with a diagnostic. Invoked on any OS-primitive
/// failure — this allocator has no recovery path for a failed `sbrk`/`mmap`
/// and does not surface out-of-memory to callers.
#[cold]
pub fn fatal(message: &str) -> ! {
    log::error!("fatal allocator error: {message}");
    eprintln!("fatal allocator error: {message}");
    std::process::abort();
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::{OsBackend, OsError};
    use std::collections::HashMap;

    /// An in-process stand-in for the OS, used only by tests.
    ///
    /// `extend_break` bumps a cursor inside a large, heap-owned arena rather
    /// than touching the real process break, so the free-list policy can be
    /// driven deterministically and in isolation across tests running in
    /// parallel. `map_anonymous`/`unmap` allocate/free a zeroed byte vector
    /// per call and track the live ones by address so `unmap` can validate
    /// its length argument the way real `munmap` would reject a mismatched one.
    pub struct FakeBackend {
        arena: Box<[u8]>,
        cursor: usize,
        mappings: HashMap<usize, Box<[u8]>>,
        page_size: usize,
    }

    impl FakeBackend {
        pub fn new(arena_size: usize, page_size: usize) -> Self {
            Self {
                arena: vec![0u8; arena_size].into_boxed_slice(),
                cursor: 0,
                mappings: HashMap::new(),
                page_size,
            }
        }
    }

    impl OsBackend for FakeBackend {
        fn extend_break(&mut self, delta: usize) -> Result<usize, OsError> {
            let start = self.arena.as_ptr() as usize + self.cursor;
            let new_cursor = self
                .cursor
                .checked_add(delta)
                .filter(|&c| c <= self.arena.len())
                .ok_or(OsError::BreakExtensionFailed)?;
            self.cursor = new_cursor;
            Ok(start)
        }

        fn map_anonymous(&mut self, length: usize) -> Result<usize, OsError> {
            let region = vec![0u8; length].into_boxed_slice();
            let address = region.as_ptr() as usize;
            self.mappings.insert(address, region);
            Ok(address)
        }

        fn unmap(&mut self, address: usize, length: usize) -> Result<(), OsError> {
            match self.mappings.remove(&address) {
                Some(region) if region.len() == length => Ok(()),
                Some(region) => {
                    // Put it back; the caller passed the wrong length.
                    self.mappings.insert(address, region);
                    Err(OsError::UnmapFailed)
                }
                None => Err(OsError::UnmapFailed),
            }
        }

        fn page_size(&self) -> usize {
            self.page_size
        }
    }
}
