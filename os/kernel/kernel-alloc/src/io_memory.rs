//! # IO Memory
//!
//! Virtual ranges for memory-mapped devices, drawn from
//! `[IO_START, IO_END)`. This manager only hands out addresses; binding them
//! to device frames is done by the memory manager.

use crate::arena::BootstrapArena;
use crate::bitmap::{Bitmap, RunBitmap};
use crate::error::{MemoryError, Pool};
use kernel_info::memory::{IO_END, IO_START, PAGE_SIZE};
use kernel_memory_addresses::{Size4K, VirtualAddress};
use kernel_vmem::pages_for;

const IO_PAGES: u32 = (IO_END - IO_START) / PAGE_SIZE;

pub struct IoMemoryManager {
    regions: RunBitmap<&'static mut [u32]>,
}

impl IoMemoryManager {
    /// # Errors
    /// [`MemoryError::OutOfMemory`] if the arena cannot hold the bitmaps.
    pub fn new(arena: &mut BootstrapArena) -> Result<Self, MemoryError> {
        let words = Bitmap::<&mut [u32]>::words_for(IO_PAGES);
        let used = arena.alloc_words(words)?;
        let heads = arena.alloc_words(words)?;
        log::info!(
            "IO memory window {}..{} ({IO_PAGES} pages)",
            VirtualAddress::new(IO_START),
            VirtualAddress::new(IO_END)
        );
        Ok(Self {
            regions: RunBitmap::new(used, heads, IO_PAGES),
        })
    }

    /// Reserve `ceil(size / 4096)` pages of IO address space.
    ///
    /// # Errors
    /// [`MemoryError::OutOfMemory`] with [`Pool::IoRegion`] when no long enough range is free.
    pub fn alloc(&mut self, size: u32) -> Result<VirtualAddress, MemoryError> {
        let first = self
            .regions
            .alloc(pages_for(size).max(1))
            .ok_or(MemoryError::OutOfMemory {
                pool: Pool::IoRegion,
                requested: size,
            })?;
        Ok(VirtualAddress::new(IO_START + first * PAGE_SIZE))
    }

    /// Release the range starting at `va` and return its page count.
    ///
    /// # Errors
    /// [`MemoryError::IllegalState`] if `va` is not the start of an allocated range.
    pub fn free(&mut self, va: VirtualAddress) -> Result<u32, MemoryError> {
        if !Self::contains(va) || !va.is_aligned::<Size4K>() {
            return Err(MemoryError::IllegalState("address is not in the IO window"));
        }
        self.regions
            .free((va.as_u32() - IO_START) / PAGE_SIZE)
            .ok_or(MemoryError::IllegalState("IO range is not allocated"))
    }

    #[must_use]
    pub const fn contains(va: VirtualAddress) -> bool {
        va.as_u32() >= IO_START && va.as_u32() < IO_END
    }

    #[must_use]
    pub fn free_pages(&self) -> u32 {
        self.regions.free_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::boxed::Box;
    use alloc::vec;

    fn manager() -> IoMemoryManager {
        let arena = Box::leak(vec![0u8; 64 * 1024].into_boxed_slice());
        IoMemoryManager::new(&mut BootstrapArena::new(arena)).unwrap()
    }

    #[test]
    fn ranges_are_page_aligned_and_disjoint() {
        let mut io = manager();
        let a = io.alloc(100).unwrap();
        let b = io.alloc(2 * 4096 + 1).unwrap();
        assert_eq!(a, VirtualAddress::new(IO_START));
        assert_eq!(b, VirtualAddress::new(IO_START + 4096));
        assert_eq!(io.free_pages(), IO_PAGES - 4);
        assert_eq!(io.free(b), Ok(3));
        assert_eq!(io.free(a), Ok(1));
        assert_eq!(io.free_pages(), IO_PAGES);
    }

    #[test]
    fn foreign_addresses_are_rejected() {
        let mut io = manager();
        let a = io.alloc(4096).unwrap();
        assert!(io.free(a + 16).is_err());
        assert!(io.free(VirtualAddress::new(0xC000_0000)).is_err());
        assert!(io.free(a + 4096).is_err());
    }

    #[test]
    fn window_exhaustion_is_out_of_memory() {
        let mut io = manager();
        assert_eq!(
            io.alloc(IO_END - IO_START + 1),
            Err(MemoryError::OutOfMemory {
                pool: Pool::IoRegion,
                requested: IO_END - IO_START + 1
            })
        );
    }
}
