//! # Address Space (32-bit x86, directory-rooted)
//!
//! Strongly-typed helpers to build and manipulate a **single** virtual address
//! space: a [`PageDirectory`] root and the [`PageTable`]s it links.
//!
//! ## Highlights
//!
//! - [`AddressSpace::ensure_table`] allocates and links a missing page table.
//! - [`AddressSpace::map_one`] installs one 4 KiB mapping and refuses to
//!   overwrite a present one.
//! - [`AddressSpace::unmap_one`] clears a mapping and hands back the old entry.
//! - [`AddressSpace::query`] translates a VA to a PA.
//! - [`AddressSpace::share_kernel_entries`] copies the kernel half of another directory.
//! - [`AddressSpace::release_user_tables`] tears the user half down.
//!
//! ## Safety
//!
//! - Mutating active mappings requires **TLB maintenance** (`invlpg` per page
//!   or a CR3 reload); that is the caller's job.
//! - The provided [`PhysMapper`] must yield **writable** references to table frames.

use crate::page_table::pd::{L2Index, PageDirectory, PdEntry};
use crate::page_table::pt::{L1Index, PageTable, PtEntry};
use crate::page_table::split_indices;
use crate::{PageEntryBits, PagingHardware, PhysMapper, TableAlloc};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualAddress};

/// Handle to a single, concrete address space.
pub struct AddressSpace<'m, M: PhysMapper> {
    root: PhysicalPage<Size4K>, // page directory frame
    mapper: &'m M,
}

/// The page directory frame of an [`AddressSpace`].
pub type RootPage = PhysicalPage<Size4K>;

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum AddressSpaceMapError {
    #[error("no page table could be allocated to map {0}")]
    OutOfTables(VirtualAddress),
    #[error("{0} is already mapped")]
    AlreadyMapped(VirtualAddress),
}

impl<'m, M: PhysMapper> AddressSpace<'m, M> {
    /// Wrap an existing directory.
    #[inline]
    pub const fn from_root(mapper: &'m M, root: RootPage) -> Self {
        Self { root, mapper }
    }

    /// Allocate and clear a fresh, empty directory.
    ///
    /// # Errors
    /// [`AddressSpaceMapError::OutOfTables`] if `alloc` is exhausted.
    pub fn create<A: TableAlloc>(mapper: &'m M, alloc: &mut A) -> Result<Self, AddressSpaceMapError> {
        let root = alloc
            .alloc_table()
            .ok_or(AddressSpaceMapError::OutOfTables(VirtualAddress::zero()))?;
        mapper.pd_mut(root).zero();
        Ok(Self { root, mapper })
    }

    /// Load CR3 with this address space’s root.
    ///
    /// # Safety
    /// The directory must map the code, stack and data the CPU is about to use.
    #[inline]
    pub unsafe fn activate<H: PagingHardware>(&self, hw: &H) {
        unsafe { hw.load_directory(self.root) }
    }

    /// Physical page of the directory.
    #[inline]
    pub const fn root_page(&self) -> RootPage {
        self.root
    }

    #[inline]
    pub(crate) fn directory_mut<'a>(&self) -> &'a mut PageDirectory {
        self.mapper.pd_mut(self.root)
    }

    #[inline]
    pub(crate) fn table_mut<'a>(&self, page: PhysicalPage<Size4K>) -> &'a mut PageTable {
        self.mapper.pt_mut(page)
    }

    /// Return the page table covering `i2`, creating and linking it if absent.
    ///
    /// Links in the user half carry the user bit so leaf flags alone decide
    /// what ring 3 may touch.
    ///
    /// # Errors
    /// [`AddressSpaceMapError::OutOfTables`] if `alloc` is exhausted.
    pub fn ensure_table<A: TableAlloc>(
        &self,
        alloc: &mut A,
        i2: L2Index,
    ) -> Result<PhysicalPage<Size4K>, AddressSpaceMapError> {
        let pd = self.directory_mut();
        if let Some(table) = pd.get(i2).next_table() {
            return Ok(table);
        }

        let table = alloc
            .alloc_table()
            .ok_or(AddressSpaceMapError::OutOfTables(i2.base()))?;
        self.table_mut(table).zero();
        pd.set(i2, PdEntry::make_next(table, PageEntryBits::table_link(!i2.is_kernel())));
        log::debug!("Created page table {table} for {}", i2.base());
        Ok(table)
    }

    /// Map **one** 4 KiB page at `va → pa` with `leaf` flags.
    ///
    /// # Errors
    /// - [`AddressSpaceMapError::OutOfTables`] if the covering table could not be created.
    /// - [`AddressSpaceMapError::AlreadyMapped`] if `va` is already present.
    pub fn map_one<A: TableAlloc>(
        &self,
        alloc: &mut A,
        va: VirtualAddress,
        pa: PhysicalAddress,
        leaf: PageEntryBits,
    ) -> Result<(), AddressSpaceMapError> {
        debug_assert!(pa.is_aligned::<Size4K>(), "physical address not aligned");

        let (i2, i1) = split_indices(va);
        let table = self.ensure_table(alloc, i2)?;
        let pt = self.table_mut(table);
        if pt.get(i1).is_present() {
            return Err(AddressSpaceMapError::AlreadyMapped(va.align_down::<Size4K>()));
        }
        pt.set(i1, PtEntry::make_4k(PhysicalPage::from_addr(pa), leaf));
        Ok(())
    }

    /// Unmap the 4 KiB page containing `va`.
    ///
    /// Returns the removed entry, or `None` if nothing was mapped.
    pub fn unmap_one(&self, va: VirtualAddress) -> Option<PtEntry> {
        let (i2, i1) = split_indices(va);
        let table = self.directory_mut().get(i2).next_table()?;
        let pt = self.table_mut(table);
        let e1 = pt.get(i1);
        if !e1.is_present() {
            return None;
        }
        pt.set(i1, PtEntry::zero());
        Some(e1)
    }

    /// The present leaf entry for `va`, if any.
    #[must_use]
    pub fn entry(&self, va: VirtualAddress) -> Option<PtEntry> {
        let (i2, i1) = split_indices(va);
        let table = self.directory_mut().get(i2).next_table()?;
        let e1 = self.table_mut(table).get(i1);
        e1.is_present().then_some(e1)
    }

    /// Rewrite the flags of the present leaf entry for `va`.
    ///
    /// Returns `false` if `va` is not mapped. The frame number is preserved.
    pub fn update_entry(
        &self,
        va: VirtualAddress,
        f: impl FnOnce(PageEntryBits) -> PageEntryBits,
    ) -> bool {
        let (i2, i1) = split_indices(va);
        let Some(table) = self.directory_mut().get(i2).next_table() else {
            return false;
        };
        let pt = self.table_mut(table);
        let Some((page, bits)) = pt.get(i1).page_4k() else {
            return false;
        };
        pt.set(i1, PtEntry::make_4k(page, f(bits)));
        true
    }

    /// Translate a `VirtualAddress` to a `PhysicalAddress` if mapped.
    #[must_use]
    pub fn query(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        let (page, _) = self.entry(va)?.page_4k()?;
        Some(page.join(va.offset::<Size4K>()))
    }

    /// Copy every kernel-half directory entry of `base` into this directory.
    ///
    /// The tables themselves are shared, so later kernel mappings made through
    /// either directory are visible in both.
    pub fn share_kernel_entries(&self, base: &AddressSpace<'_, M>) {
        let src = base.directory_mut();
        let dst = self.directory_mut();
        for i2 in L2Index::kernel() {
            dst.set(i2, src.get(i2));
        }
    }

    /// Free every user-half page table, reporting each present leaf to
    /// `on_mapped` first so the caller can release the frame behind it.
    ///
    /// The kernel half is shared and left untouched. The directory itself
    /// stays allocated; see [`release`](Self::release).
    pub fn release_user_tables<A: TableAlloc>(
        &self,
        alloc: &mut A,
        mut on_mapped: impl FnMut(VirtualAddress, PtEntry),
    ) {
        let pd = self.directory_mut();
        for i2 in L2Index::user() {
            let Some(table) = pd.get(i2).next_table() else {
                continue;
            };
            for (i1, e1) in self.table_mut(table).present_entries() {
                on_mapped(join_indices(i2, i1), e1);
            }
            pd.set(i2, PdEntry::zero());
            alloc.free_table(table);
        }
    }

    /// Release the user half and then the directory frame itself.
    pub fn release<A: TableAlloc>(self, alloc: &mut A, on_mapped: impl FnMut(VirtualAddress, PtEntry)) {
        self.release_user_tables(alloc, on_mapped);
        alloc.free_table(self.root);
    }
}

const fn join_indices(i2: L2Index, i1: L1Index) -> VirtualAddress {
    VirtualAddress::new(((i2.as_usize() as u32) << 22) | ((i1.as_usize() as u32) << 12))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Flags;
    use crate::sim::SimulatedRam;
    use alloc::vec::Vec;

    /// A trivial **bump** allocator handing out the next 4 KiB frame and
    /// remembering what was returned.
    struct BumpTables {
        next: u32,
        end: u32,
        freed: Vec<PhysicalPage<Size4K>>,
    }

    impl BumpTables {
        fn new(start: u32, end: u32) -> Self {
            Self {
                next: start,
                end,
                freed: Vec::new(),
            }
        }
    }

    impl TableAlloc for BumpTables {
        fn alloc_table(&mut self) -> Option<PhysicalPage<Size4K>> {
            if self.next + 4096 > self.end {
                return None;
            }
            let p = self.next;
            self.next += 4096;
            Some(PhysicalPage::from_addr(PhysicalAddress::new(p)))
        }

        fn free_table(&mut self, page: PhysicalPage<Size4K>) {
            self.freed.push(page);
        }
    }

    fn rw() -> PageEntryBits {
        (Flags::PRESENT | Flags::WRITABLE).into()
    }

    #[test]
    fn map_one_creates_table_and_leaf() {
        let ram = SimulatedRam::new();
        let mut alloc = BumpTables::new(0x10_0000, 0x10_0000 + 16 * 4096);
        let aspace = AddressSpace::create(&ram, &mut alloc).unwrap();

        let va = VirtualAddress::new(0x0804_8000);
        let pa = PhysicalAddress::new(0x0030_0000);
        aspace.map_one(&mut alloc, va, pa, rw()).expect("map_one");

        let pde = aspace.directory_mut().get(L2Index::from(va));
        assert!(pde.is_present());
        assert!(pde.flags().user_access());
        assert_eq!(aspace.query(va + 0x123), Some(pa + 0x123));
    }

    #[test]
    fn kernel_tables_are_not_user_accessible() {
        let ram = SimulatedRam::new();
        let mut alloc = BumpTables::new(0x10_0000, 0x10_0000 + 16 * 4096);
        let aspace = AddressSpace::create(&ram, &mut alloc).unwrap();
        let va = VirtualAddress::new(0xC010_0000);
        aspace
            .map_one(&mut alloc, va, PhysicalAddress::new(0x10_0000), rw())
            .unwrap();
        assert!(!aspace.directory_mut().get(L2Index::from(va)).flags().user_access());
    }

    #[test]
    fn mapping_twice_is_refused() {
        let ram = SimulatedRam::new();
        let mut alloc = BumpTables::new(0x10_0000, 0x10_0000 + 16 * 4096);
        let aspace = AddressSpace::create(&ram, &mut alloc).unwrap();
        let va = VirtualAddress::new(0x4000_0000);
        aspace
            .map_one(&mut alloc, va, PhysicalAddress::new(0x20_0000), rw())
            .unwrap();
        assert_eq!(
            aspace.map_one(&mut alloc, va + 8, PhysicalAddress::new(0x21_0000), rw()),
            Err(AddressSpaceMapError::AlreadyMapped(va))
        );
        assert_eq!(aspace.query(va), Some(PhysicalAddress::new(0x20_0000)));
    }

    #[test]
    fn running_out_of_tables_is_reported() {
        let ram = SimulatedRam::new();
        let mut alloc = BumpTables::new(0x10_0000, 0x10_0000 + 4096);
        let aspace = AddressSpace::create(&ram, &mut alloc).unwrap();
        let va = VirtualAddress::new(0x0040_1000);
        assert_eq!(
            aspace.map_one(&mut alloc, va, PhysicalAddress::new(0x20_0000), rw()),
            Err(AddressSpaceMapError::OutOfTables(VirtualAddress::new(0x0040_0000)))
        );
    }

    #[test]
    fn unmap_returns_entry_once() {
        let ram = SimulatedRam::new();
        let mut alloc = BumpTables::new(0x10_0000, 0x10_0000 + 16 * 4096);
        let aspace = AddressSpace::create(&ram, &mut alloc).unwrap();
        let va = VirtualAddress::new(0x0000_1000);
        let pa = PhysicalAddress::new(0);
        aspace.map_one(&mut alloc, va, pa, rw()).unwrap();

        let removed = aspace.unmap_one(va).expect("was mapped");
        assert_eq!(removed.page_4k().map(|(p, _)| p.base()), Some(pa));
        assert_eq!(aspace.unmap_one(va), None);
        assert_eq!(aspace.query(va), None);
    }

    #[test]
    fn update_entry_keeps_frame() {
        let ram = SimulatedRam::new();
        let mut alloc = BumpTables::new(0x10_0000, 0x10_0000 + 16 * 4096);
        let aspace = AddressSpace::create(&ram, &mut alloc).unwrap();
        let va = VirtualAddress::new(0xC000_2000);
        aspace
            .map_one(&mut alloc, va, PhysicalAddress::new(0x2000), rw())
            .unwrap();
        assert!(aspace.update_entry(va, |b| b.with_writable(false)));
        let e = aspace.entry(va).unwrap();
        assert!(!e.flags().writable());
        assert_eq!(aspace.query(va), Some(PhysicalAddress::new(0x2000)));
        assert!(!aspace.update_entry(va + 4096, |b| b));
    }

    #[test]
    fn shared_kernel_tables_see_later_mappings() {
        let ram = SimulatedRam::new();
        let mut alloc = BumpTables::new(0x10_0000, 0x10_0000 + 16 * 4096);
        let base = AddressSpace::create(&ram, &mut alloc).unwrap();
        let kva = VirtualAddress::new(0xC040_0000);
        base.ensure_table(&mut alloc, L2Index::from(kva)).unwrap();

        let other = AddressSpace::create(&ram, &mut alloc).unwrap();
        other.share_kernel_entries(&base);
        base.map_one(&mut alloc, kva, PhysicalAddress::new(0x5000), rw())
            .unwrap();
        assert_eq!(other.query(kva), Some(PhysicalAddress::new(0x5000)));
    }

    #[test]
    fn release_reports_user_leaves_and_frees_tables() {
        let ram = SimulatedRam::new();
        let mut alloc = BumpTables::new(0x10_0000, 0x10_0000 + 16 * 4096);
        let base = AddressSpace::create(&ram, &mut alloc).unwrap();
        let kva = VirtualAddress::new(0xC000_0000);
        base.map_one(&mut alloc, kva, PhysicalAddress::new(0x1000), rw())
            .unwrap();

        let space = AddressSpace::create(&ram, &mut alloc).unwrap();
        space.share_kernel_entries(&base);
        let uva = VirtualAddress::new(0x4000_3000);
        space
            .map_one(&mut alloc, uva, PhysicalAddress::new(0x7000), rw())
            .unwrap();

        let root = space.root_page();
        let mut seen = Vec::new();
        space.release(&mut alloc, |va, e| seen.push((va, e.flags().physical_page())));

        assert_eq!(seen, [(uva, PhysicalPage::from_number(7))]);
        assert_eq!(alloc.freed.len(), 2);
        assert_eq!(alloc.freed.last(), Some(&root));
        assert_eq!(base.query(kva), Some(PhysicalAddress::new(0x1000)));
    }
}
