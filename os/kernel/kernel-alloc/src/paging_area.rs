//! # Paging Area
//!
//! Page directories and page tables live in a dedicated 4 MiB virtual window
//! at [`PAGING_AREA_START`] that the boot stub mapped 1:1 onto a physical
//! block. Allocating a table therefore never needs a new mapping and can
//! never fault, which keeps table creation safe inside the page-fault path.
//!
//! ```text
//! PAGING_AREA_START                                   PAGING_AREA_END
//! ┌──────────┬──────────┬──────────┬───────────────────────┐
//! │ base PD  │ PT 768   │ PT 769   │ ...                   │  virtual
//! └──────────┴──────────┴──────────┴───────────────────────┘
//!      │ + (phys_base - PAGING_AREA_START)
//! ┌──────────┬──────────┬──────────┬───────────────────────┐
//! │          │          │          │                       │  physical
//! └──────────┴──────────┴──────────┴───────────────────────┘
//! phys_base
//! ```

use crate::bitmap::RunBitmap;
use crate::error::{MemoryError, Pool};
use kernel_info::memory::{PAGE_SIZE, PAGING_AREA_SIZE, PAGING_AREA_START};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualAddress};
use kernel_vmem::{PhysMapper, TableAlloc, pages_for};

const AREA_PAGES: u32 = PAGING_AREA_SIZE / PAGE_SIZE;
const AREA_WORDS: usize = (AREA_PAGES / 32) as usize;

pub struct PagingAreaManager {
    phys_base: PhysicalAddress,
    pages: RunBitmap<[u32; AREA_WORDS]>,
}

impl PagingAreaManager {
    /// Manage the window backed by the physical block at `phys_base`.
    #[must_use]
    pub fn new(phys_base: PhysicalAddress) -> Self {
        debug_assert!(phys_base.is_aligned::<Size4K>());
        Self {
            phys_base,
            pages: RunBitmap::new([0; AREA_WORDS], [0; AREA_WORDS], AREA_PAGES),
        }
    }

    /// Reserve `ceil(size / 4096)` zeroed pages.
    ///
    /// # Errors
    /// [`MemoryError::OutOfMemory`] with [`Pool::PagingArea`] when the window is full.
    pub fn alloc<M: PhysMapper>(&mut self, mapper: &M, size: u32) -> Result<VirtualAddress, MemoryError> {
        let count = pages_for(size).max(1);
        let first = self.pages.alloc(count).ok_or(MemoryError::OutOfMemory {
            pool: Pool::PagingArea,
            requested: size,
        })?;
        let va = VirtualAddress::new(PAGING_AREA_START + first * PAGE_SIZE);
        for i in 0..count {
            let pa = self.virt_to_phys(va + i * PAGE_SIZE);
            // SAFETY: the page was just reserved and belongs to the window.
            let page: &mut [u8; PAGE_SIZE as usize] = unsafe { mapper.phys_to_mut(pa) };
            page.fill(0);
        }
        Ok(va)
    }

    /// Release the block that starts at `va`.
    ///
    /// # Errors
    /// [`MemoryError::IllegalState`] if `va` is not the start of an allocated block.
    pub fn free(&mut self, va: VirtualAddress) -> Result<(), MemoryError> {
        if !self.contains(va) || !va.is_aligned::<Size4K>() {
            return Err(MemoryError::IllegalState("address is not in the paging area"));
        }
        let index = (va.as_u32() - PAGING_AREA_START) / PAGE_SIZE;
        self.pages
            .free(index)
            .map(|_| ())
            .ok_or(MemoryError::IllegalState("paging area block is not allocated"))
    }

    #[inline]
    #[must_use]
    pub const fn contains(&self, va: VirtualAddress) -> bool {
        va.as_u32() >= PAGING_AREA_START
    }

    #[inline]
    #[must_use]
    pub fn virt_to_phys(&self, va: VirtualAddress) -> PhysicalAddress {
        debug_assert!(self.contains(va));
        self.phys_base + (va.as_u32() - PAGING_AREA_START)
    }

    #[inline]
    #[must_use]
    pub fn phys_to_virt(&self, pa: PhysicalAddress) -> VirtualAddress {
        debug_assert!(self.contains_phys(pa));
        VirtualAddress::new(PAGING_AREA_START + (pa.as_u32() - self.phys_base.as_u32()))
    }

    #[inline]
    #[must_use]
    pub const fn contains_phys(&self, pa: PhysicalAddress) -> bool {
        pa.as_u32() >= self.phys_base.as_u32() && pa.as_u32() - self.phys_base.as_u32() < PAGING_AREA_SIZE
    }

    /// Physical block backing the window.
    #[must_use]
    pub const fn phys_base(&self) -> PhysicalAddress {
        self.phys_base
    }

    #[must_use]
    pub fn free_pages(&self) -> u32 {
        self.pages.free_count()
    }
}

/// [`TableAlloc`] over the paging area, so page tables are only ever
/// created inside the pre-mapped window.
pub struct TablePool<'a, M: PhysMapper> {
    area: &'a mut PagingAreaManager,
    mapper: &'a M,
}

impl<'a, M: PhysMapper> TablePool<'a, M> {
    pub const fn new(area: &'a mut PagingAreaManager, mapper: &'a M) -> Self {
        Self { area, mapper }
    }
}

impl<M: PhysMapper> TableAlloc for TablePool<'_, M> {
    fn alloc_table(&mut self) -> Option<PhysicalPage<Size4K>> {
        let va = self.area.alloc(self.mapper, PAGE_SIZE).ok()?;
        Some(PhysicalPage::from_addr(self.area.virt_to_phys(va)))
    }

    fn free_table(&mut self, page: PhysicalPage<Size4K>) {
        let va = self.area.phys_to_virt(page.base());
        if let Err(e) = self.area.free(va) {
            log::error!("Failed to release page table {page}: {e}");
        }
    }
}

/// [`PhysMapper`] for the running kernel: physical frames of the paging
/// area are reached through its 1:1 window.
///
/// Only frames inside the paging-area block are reachable; that is all the
/// paging code ever touches.
///
/// # Safety
/// The boot stub must have mapped `[phys_base, phys_base + 4 MiB)` writable
/// at [`PAGING_AREA_START`].
#[derive(Debug, Copy, Clone)]
pub struct PagingAreaMapper {
    phys_base: PhysicalAddress,
}

impl PagingAreaMapper {
    /// # Safety
    /// See the type documentation.
    #[must_use]
    pub const unsafe fn new(phys_base: PhysicalAddress) -> Self {
        Self { phys_base }
    }
}

impl PhysMapper for PagingAreaMapper {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        let offset = pa.as_u32().wrapping_sub(self.phys_base.as_u32());
        debug_assert!(offset < PAGING_AREA_SIZE);
        let va = VirtualAddress::new(PAGING_AREA_START + offset);
        // SAFETY: Caller must ensure the physical address lies in the paging area block.
        unsafe { &mut *va.as_mut_ptr::<T>() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_vmem::sim::SimulatedRam;

    const PHYS_BASE: u32 = 0x0040_0000;

    #[test]
    fn alloc_returns_zeroed_window_pages() {
        let ram = SimulatedRam::new();
        let mut area = PagingAreaManager::new(PhysicalAddress::new(PHYS_BASE));
        let va = area.alloc(&ram, 4096).unwrap();
        assert_eq!(va, VirtualAddress::new(PAGING_AREA_START));
        let pa = area.virt_to_phys(va);
        assert_eq!(pa, PhysicalAddress::new(PHYS_BASE));
        ram.fill_frame(pa.page(), 0xAA);

        area.free(va).unwrap();
        let again = area.alloc(&ram, 4096).unwrap();
        let pa = area.virt_to_phys(again);
        assert!(ram.read_frame(pa.page()).iter().all(|b| *b == 0));
        assert_eq!(area.phys_to_virt(pa), again);
    }

    #[test]
    fn free_releases_whole_block() {
        let ram = SimulatedRam::new();
        let mut area = PagingAreaManager::new(PhysicalAddress::new(PHYS_BASE));
        let a = area.alloc(&ram, 3 * 4096).unwrap();
        let b = area.alloc(&ram, 1).unwrap();
        assert_eq!(b, a + 3 * 4096);
        assert_eq!(area.free_pages(), 1020);

        assert!(area.free(a + 4096).is_err());
        area.free(a).unwrap();
        assert_eq!(area.free_pages(), 1023);
        assert!(area.free(a).is_err());
        assert!(area.free(VirtualAddress::new(0x1000)).is_err());
    }

    #[test]
    fn exhaustion_is_out_of_memory() {
        let ram = SimulatedRam::new();
        let mut area = PagingAreaManager::new(PhysicalAddress::new(PHYS_BASE));
        area.alloc(&ram, PAGING_AREA_SIZE).unwrap();
        assert_eq!(
            area.alloc(&ram, 4096),
            Err(MemoryError::OutOfMemory {
                pool: Pool::PagingArea,
                requested: 4096
            })
        );
    }

    #[test]
    fn table_pool_hands_out_physical_pages() {
        let ram = SimulatedRam::new();
        let mut area = PagingAreaManager::new(PhysicalAddress::new(PHYS_BASE));
        let mut pool = TablePool::new(&mut area, &ram);
        let t = pool.alloc_table().unwrap();
        assert_eq!(t.base(), PhysicalAddress::new(PHYS_BASE));
        pool.free_table(t);
        assert_eq!(area.free_pages(), 1024);
    }
}
