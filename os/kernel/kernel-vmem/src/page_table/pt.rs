//! # Page Table (PT / L1)
//!
//! - [`L1Index`]: index type for VA bits `[21:12]`.
//! - [`PtEntry`]: a PT entry (PTE); every present entry maps one 4 KiB page.
//! - [`PageTable`]: a 4 KiB-aligned array of 1024 PTEs.
//!
//! After modifying active mappings, the caller must perform any required TLB maintenance.

use crate::PageEntryBits;
use kernel_memory_addresses::{PhysicalPage, Size4K, VirtualAddress};

/// Index into the Page Table (derived from VA bits `[21:12]`).
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct L1Index(u16);

/// A single Page Table entry (PTE).
#[doc(alias = "PTE")]
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PtEntry(PageEntryBits);

/// The Page Table (L1): 1024 entries, 4 KiB-aligned.
#[doc(alias = "PT")]
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PtEntry; 1024],
}

impl L1Index {
    #[inline]
    #[must_use]
    pub const fn from(va: VirtualAddress) -> Self {
        Self::new(((va.as_u32() >> 12) & 0x3FF) as u16)
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
}

impl PtEntry {
    /// Create a zero (non-present) entry.
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

    /// Expose the underlying bitfield.
    #[inline]
    #[must_use]
    pub const fn flags(self) -> PageEntryBits {
        self.0
    }

    /// If present, return the mapped 4 KiB physical page and its flags.
    #[inline]
    #[must_use]
    pub const fn page_4k(self) -> Option<(PhysicalPage<Size4K>, PageEntryBits)> {
        if !self.is_present() {
            return None;
        }
        Some((self.0.physical_page(), self.0))
    }

    /// Create a 4 KiB leaf PTE.
    ///
    /// Sets `present=1`, clears `PAT` and writes the frame number.
    #[inline]
    #[must_use]
    pub const fn make_4k(page: PhysicalPage<Size4K>, flags: PageEntryBits) -> Self {
        Self(
            flags
                .with_present(true)
                .with_large_page(false)
                .with_physical_page(page),
        )
    }

    /// `true` if the frame behind this entry belongs to the frame allocator.
    #[inline]
    #[must_use]
    pub const fn owns_frame(self) -> bool {
        self.is_present() && !self.0.unmanaged()
    }

    #[inline]
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0.into_bits()
    }
}

impl PageTable {
    #[inline]
    #[must_use]
    pub const fn get(&self, i: L1Index) -> PtEntry {
        self.entries[i.as_usize()]
    }

    #[inline]
    pub const fn set(&mut self, i: L1Index, e: PtEntry) {
        self.entries[i.as_usize()] = e;
    }

    /// Mark every entry non-present.
    #[inline]
    pub fn zero(&mut self) {
        self.entries.fill(PtEntry::zero());
    }

    /// Present entries with their index.
    pub fn present_entries(&self) -> impl Iterator<Item = (L1Index, PtEntry)> + '_ {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.is_present())
            .map(|(i, e)| (L1Index(i as u16), *e))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn pte_4k_leaf() {
        let page = PhysicalPage::<Size4K>::from_number(0x5_5550);
        let flags = PageEntryBits::new()
            .with_writable(true)
            .with_cache_disabled(true)
            .with_large_page(true);
        let e = PtEntry::make_4k(page, flags);
        let (p, fl) = e.page_4k().unwrap();
        assert_eq!(p.base().as_u32(), 0x5555_0000);
        assert!(fl.present());
        assert!(!fl.large_page());
        assert!(fl.cache_disabled());
        assert!(e.owns_frame());
    }

    #[test]
    fn unmanaged_entry_does_not_own_its_frame() {
        let page = PhysicalPage::<Size4K>::from_number(0xFEC00);
        let e = PtEntry::make_4k(page, PageEntryBits::new().with_unmanaged(true));
        assert!(e.is_present());
        assert!(!e.owns_frame());
        assert!(!PtEntry::zero().owns_frame());
    }
}
