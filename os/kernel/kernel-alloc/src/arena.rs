//! # Bootstrap Arena
//!
//! A bump allocator that exists before any heap does. It hands out the
//! bitmap storage of the frame and IO allocators during bootstrap and is
//! never freed into.

use crate::error::{MemoryError, Pool};
use core::sync::atomic::{AtomicBool, Ordering};
use kernel_info::memory::BOOTSTRAP_ARENA_SIZE;

/// Backing storage for the kernel's arena, placed in a dedicated `.bss` section.
#[unsafe(link_section = ".bss.boot")]
static mut ARENA: ArenaMem = ArenaMem([0; BOOTSTRAP_ARENA_SIZE]);

/// One-time hand-out flag for [`ARENA`].
static TAKEN: AtomicBool = AtomicBool::new(false);

#[repr(align(16))]
struct ArenaMem([u8; BOOTSTRAP_ARENA_SIZE]);

pub struct BootstrapArena {
    remaining: &'static mut [u8],
    capacity: usize,
}

impl BootstrapArena {
    /// Bump-allocate out of `memory`.
    #[must_use]
    pub fn new(memory: &'static mut [u8]) -> Self {
        let capacity = memory.len();
        Self {
            remaining: memory,
            capacity,
        }
    }

    /// The kernel's statically reserved arena. Returns `None` after the first call.
    pub fn take_static() -> Option<Self> {
        if TAKEN.swap(true, Ordering::AcqRel) {
            return None;
        }
        // SAFETY: the flag above hands the storage out exactly once.
        let memory = unsafe { &mut (*(&raw mut ARENA)).0 };
        Some(Self::new(memory))
    }

    /// Carve out `count` zeroed words.
    ///
    /// # Errors
    /// [`MemoryError::OutOfMemory`] with [`Pool::BootstrapArena`] when the arena is exhausted.
    pub fn alloc_words(&mut self, count: usize) -> Result<&'static mut [u32], MemoryError> {
        let exhausted = MemoryError::OutOfMemory {
            pool: Pool::BootstrapArena,
            requested: u32::try_from(count.saturating_mul(4)).unwrap_or(u32::MAX),
        };
        let pad = self.remaining.as_ptr().align_offset(align_of::<u32>());
        let bytes = count.checked_mul(size_of::<u32>()).ok_or(exhausted)?;
        if pad.saturating_add(bytes) > self.remaining.len() {
            return Err(exhausted);
        }

        let memory = core::mem::take(&mut self.remaining);
        let (taken, rest) = memory.split_at_mut(pad + bytes);
        self.remaining = rest;

        let taken = &mut taken[pad..];
        taken.fill(0);
        // SAFETY: `taken` is exclusively ours, aligned for `u32` and `count * 4` bytes long;
        // every bit pattern is a valid `u32`.
        Ok(unsafe { core::slice::from_raw_parts_mut(taken.as_mut_ptr().cast::<u32>(), count) })
    }

    /// Bytes handed out so far, including alignment padding.
    #[must_use]
    pub const fn used(&self) -> usize {
        self.capacity - self.remaining.len()
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::boxed::Box;
    use alloc::vec;

    fn arena(bytes: usize) -> BootstrapArena {
        BootstrapArena::new(Box::leak(vec![0xFFu8; bytes].into_boxed_slice()))
    }

    #[test]
    fn hands_out_zeroed_disjoint_words() {
        let mut arena = arena(64);
        let a = arena.alloc_words(4).unwrap();
        let b = arena.alloc_words(4).unwrap();
        assert!(a.iter().chain(b.iter()).all(|w| *w == 0));
        a[3] = 7;
        assert_eq!(b[0], 0);
        assert!(arena.used() >= 32);
    }

    #[test]
    fn exhaustion_is_reported() {
        let mut arena = arena(16);
        assert!(arena.alloc_words(8).is_err());
        assert!(arena.alloc_words(2).is_ok());
    }

    #[test]
    fn static_arena_is_taken_once() {
        let first = BootstrapArena::take_static();
        assert_eq!(first.map(|a| a.capacity()), Some(BOOTSTRAP_ARENA_SIZE));
        assert!(BootstrapArena::take_static().is_none());
    }
}
