//! # Page Directory (PD / L2)
//!
//! - [`L2Index`]: index type for VA bits `[31:22]`.
//! - [`PdEntry`]: a directory entry (PDE) linking one [`PageTable`](super::pt::PageTable).
//! - [`PageDirectory`]: a 4 KiB-aligned array of 1024 PDEs, the root loaded into CR3.
//!
//! Entries `768..1024` cover kernel space and are shared verbatim by every
//! directory.

use crate::PageEntryBits;
use kernel_info::memory::KERNEL_PDE_START;
use kernel_memory_addresses::{PhysicalPage, Size4K, Size4M, VirtualAddress, VirtualPage};

/// Index into the Page Directory (derived from VA bits `[31:22]`).
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct L2Index(u16);

/// A single Page Directory entry (PDE).
#[doc(alias = "PDE")]
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PdEntry(PageEntryBits);

/// The Page Directory (L2): 1024 entries, 4 KiB-aligned.
#[doc(alias = "PD")]
#[repr(C, align(4096))]
pub struct PageDirectory {
    entries: [PdEntry; 1024],
}

impl L2Index {
    #[inline]
    #[must_use]
    pub const fn from(va: VirtualAddress) -> Self {
        Self::new(va.page::<Size4M>().number() as u16)
    }

    /// ### Debug assertions
    /// - Asserts `v < 1024` in debug builds.
    #[inline]
    #[must_use]
    pub const fn new(v: u16) -> Self {
        debug_assert!(v < 1024);
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// `true` for the shared kernel half of the directory.
    #[inline]
    #[must_use]
    pub const fn is_kernel(self) -> bool {
        self.as_usize() >= KERNEL_PDE_START
    }

    /// First virtual address covered by this entry.
    #[inline]
    #[must_use]
    pub const fn base(self) -> VirtualAddress {
        VirtualPage::<Size4M>::from_number(self.0 as u32).base()
    }

    /// Every index of the user half.
    pub fn user() -> impl Iterator<Item = Self> {
        (0..KERNEL_PDE_START as u16).map(Self)
    }

    /// Every index of the kernel half.
    pub fn kernel() -> impl Iterator<Item = Self> {
        (KERNEL_PDE_START as u16..1024).map(Self)
    }
}

impl PdEntry {
    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self(PageEntryBits::new())
    }

    #[inline]
    #[must_use]
    pub const fn is_present(self) -> bool {
        self.0.present()
    }

    #[inline]
    #[must_use]
    pub const fn flags(self) -> PageEntryBits {
        self.0
    }

    /// The page table this entry links, if present.
    #[inline]
    #[must_use]
    pub const fn next_table(self) -> Option<PhysicalPage<Size4K>> {
        if !self.is_present() {
            return None;
        }
        debug_assert!(!self.0.large_page(), "4 MiB pages are not used");
        Some(self.0.physical_page())
    }

    /// Link the page table in `table` with `flags` (forces `present=1`, `PS=0`).
    #[inline]
    #[must_use]
    pub const fn make_next(table: PhysicalPage<Size4K>, flags: PageEntryBits) -> Self {
        Self(
            flags
                .with_present(true)
                .with_large_page(false)
                .with_physical_page(table),
        )
    }
}

impl PageDirectory {
    #[inline]
    #[must_use]
    pub const fn get(&self, i: L2Index) -> PdEntry {
        self.entries[i.as_usize()]
    }

    #[inline]
    pub const fn set(&mut self, i: L2Index, e: PdEntry) {
        self.entries[i.as_usize()] = e;
    }

    #[inline]
    pub fn zero(&mut self) {
        self.entries.fill(PdEntry::zero());
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn link_to_table() {
        let table = PhysicalPage::<Size4K>::from_number(0x400);
        let e = PdEntry::make_next(table, PageEntryBits::table_link(true));
        assert_eq!(e.next_table(), Some(table));
        assert!(e.flags().user_access());
        assert!(e.flags().writable());
        assert_eq!(PdEntry::zero().next_table(), None);
    }

    #[test]
    fn kernel_half_split() {
        assert_eq!(L2Index::user().count(), 768);
        assert_eq!(L2Index::kernel().count(), 256);
        assert!(L2Index::from(VirtualAddress::new(0xC000_0000)).is_kernel());
        assert!(!L2Index::from(VirtualAddress::new(0xBFFF_FFFF)).is_kernel());
        assert_eq!(L2Index::new(1022).base(), VirtualAddress::new(0xFF80_0000));
    }
}
