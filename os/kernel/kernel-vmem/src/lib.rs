//! # Virtual Memory Support
//!
//! Two-level 32-bit x86 paging (non-PAE) for the kernel's memory subsystem.
//!
//! ## What you get
//! - An [`address space`](address_space) handle over a page directory root.
//! - The raw entry layout [`PageEntryBits`] and the typed tables
//!   [`PageDirectory`](page_table::pd::PageDirectory) and [`PageTable`](page_table::pt::PageTable).
//! - Mapping [`Flags`] as callers of the memory manager spell them.
//! - The seams the paging code is generic over: [`PhysMapper`] (reach a physical
//!   frame), [`TableAlloc`] (obtain frames for tables) and [`PagingHardware`]
//!   (CR3, `invlpg`, `CR0.WP`).
//!
//! ## x86 Virtual Address → Physical Address Walk
//!
//! ```text
//! | 31‒22 | 21‒12 | 11‒0   |
//! |  PD   |  PT   | Offset |
//! ```
//!
//! ```text
//!  CR3 → PD  →  PT  →  Physical Page
//!        │      │
//!        │      └───► PTE (Page Table Entry)     → maps 4 KiB page
//!        └──────────► PDE (Page Directory Entry) → links one page table
//! ```
//!
//! | Level | Table name | Entry name | Description |
//! |:------|:-----------|:-----------|:------------|
//! | 2 | **PD** (Page Directory) | **PDE** | Root table referenced by [`CR3`](https://wiki.osdev.org/CPU_Registers_x86#CR3); each entry links a PT covering 4 MiB. |
//! | 1 | **PT** (Page Table) | **PTE** | Each entry maps a 4 KiB physical page. |
//!
//! Both tables hold 1024 four-byte entries. Entries `768..1024` of every
//! directory cover the kernel half (`0xC000_0000..`) and are identical in all
//! address spaces.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code, clippy::inline_always)]

#[cfg(any(test, feature = "sim"))]
extern crate alloc;

pub mod address_space;
pub mod hardware;
mod page_entry_bits;
pub mod page_table;

#[cfg(any(test, feature = "sim"))]
pub mod sim;

pub use crate::address_space::{AddressSpace, AddressSpaceMapError};
pub use crate::page_entry_bits::PageEntryBits;
use crate::page_table::pd::PageDirectory;
use crate::page_table::pt::PageTable;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualPage};

/// Re-export constants as info module.
pub use kernel_info::memory as info;

bitflags::bitflags! {
    /// Mapping flags accepted by the memory manager.
    ///
    /// The bit positions are the architectural ones, so a value converts
    /// directly into [`PageEntryBits`].
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct Flags: u32 {
        /// Page is present in physical memory.
        ///
        /// Cleared entries fault on any access.
        const PRESENT       = 1 << 0;

        /// Page is writable.
        ///
        /// If cleared, the page is read-only; supervisor writes only fault
        /// while `CR0.WP` is set.
        const WRITABLE      = 1 << 1;

        /// Page is accessible from user mode (CPL=3).
        const USER          = 1 << 2;

        /// Write-through caching.
        const WRITE_THROUGH = 1 << 3;

        /// Caching disabled for this page.
        ///
        /// Required for memory-mapped device registers.
        const NO_CACHE      = 1 << 4;

        /// Global page; survives CR3 reloads when `CR4.PGE` is set.
        const GLOBAL        = 1 << 8;
    }
}

impl From<Flags> for PageEntryBits {
    #[inline]
    fn from(flags: Flags) -> Self {
        Self::from_bits(flags.bits())
    }
}

/// Converts physical addresses to *temporarily* usable references in the
/// current virtual address space.
///
/// Typical patterns:
/// - **Kernel**: page tables live in the paging area, a 1:1 window onto a
///   physical block; the mapper adds the window offset.
/// - **Tests**: a sparse simulated RAM hands out host memory per frame.
///
/// # Safety
/// - You must ensure `pa` is mapped as writable in the current page tables
///   for `&mut T`.
/// - Lifetime `'a` is purely borrow-checked; the mapping must remain valid
///   for `'a`.
/// - Type `T` must match the bytes at `pa` and fit in the frame.
pub trait PhysMapper {
    /// Convert a *physical* address to a usable mutable reference.
    ///
    /// # Safety
    /// See the trait documentation.
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T;

    /// Borrow the [`PageDirectory`] stored in `page`.
    #[inline]
    fn pd_mut<'a>(&self, page: PhysicalPage<Size4K>) -> &'a mut PageDirectory {
        unsafe { self.phys_to_mut::<PageDirectory>(page.base()) }
    }

    /// Borrow the [`PageTable`] stored in `page`.
    #[inline]
    fn pt_mut<'a>(&self, page: PhysicalPage<Size4K>) -> &'a mut PageTable {
        unsafe { self.phys_to_mut::<PageTable>(page.base()) }
    }
}

impl<T: PhysMapper + ?Sized> PhysMapper for &T {
    #[inline]
    unsafe fn phys_to_mut<'a, U>(&self, pa: PhysicalAddress) -> &'a mut U {
        unsafe { (**self).phys_to_mut(pa) }
    }
}

/// Source of 4 KiB frames for page directories and page tables.
///
/// The kernel implements this with the paging area so that creating a table
/// never faults. Frames need not be zeroed; [`AddressSpace`] clears them.
pub trait TableAlloc {
    /// Allocate one 4 KiB frame for a table, `None` when exhausted.
    fn alloc_table(&mut self) -> Option<PhysicalPage<Size4K>>;

    /// Return a frame previously handed out by [`alloc_table`](Self::alloc_table).
    fn free_table(&mut self, page: PhysicalPage<Size4K>);
}

/// The privileged operations paging needs from the CPU.
pub trait PagingHardware {
    /// Load CR3 with the directory in `root`.
    ///
    /// # Safety
    /// The directory must map the code and stack currently executing.
    unsafe fn load_directory(&self, root: PhysicalPage<Size4K>);

    /// Drop any cached translation for `page` (`invlpg`).
    fn invalidate_page(&self, page: VirtualPage<Size4K>);

    /// Set `CR0.WP` so read-only pages bind supervisor code as well.
    ///
    /// # Safety
    /// Every page the kernel still writes to must be mapped writable.
    unsafe fn enable_write_protect(&self);
}

impl<T: PagingHardware + ?Sized> PagingHardware for &T {
    unsafe fn load_directory(&self, root: PhysicalPage<Size4K>) {
        unsafe { (**self).load_directory(root) }
    }

    fn invalidate_page(&self, page: VirtualPage<Size4K>) {
        (**self).invalidate_page(page);
    }

    unsafe fn enable_write_protect(&self) {
        unsafe { (**self).enable_write_protect() }
    }
}

/// Align `x` down to the nearest multiple of `a`.
///
/// ### Preconditions
/// - `a` must be **non-zero** and a **power of two**.
///
/// ### Examples
/// ```rust
/// # use kernel_vmem::align_down;
/// assert_eq!(align_down(0,      4096), 0);
/// assert_eq!(align_down(4095,   4096), 0);
/// assert_eq!(align_down(8191,   4096), 4096);
/// assert_eq!(align_down(0x12345,   16), 0x12340);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_down(x: u32, a: u32) -> u32 {
    x & !(a - 1)
}

/// Align `x` up to the nearest multiple of `a`.
///
/// ### Preconditions
/// - `a` must be **non-zero** and a **power of two**.
/// - `x + (a - 1)` must **not overflow** `u32`.
///
/// ### Examples
/// ```rust
/// # use kernel_vmem::align_up;
/// assert_eq!(align_up(0,       4096), 0);
/// assert_eq!(align_up(1,       4096), 4096);
/// assert_eq!(align_up(4096,    4096), 4096);
/// assert_eq!(align_up(0x12345,   16), 0x12350);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_up(x: u32, a: u32) -> u32 {
    (x + a - 1) & !(a - 1)
}

/// Number of 4 KiB pages needed to hold `size` bytes.
///
/// ```rust
/// # use kernel_vmem::pages_for;
/// assert_eq!(pages_for(0), 0);
/// assert_eq!(pages_for(1), 1);
/// assert_eq!(pages_for(4096), 1);
/// assert_eq!(pages_for(4097), 2);
/// assert_eq!(pages_for(u32::MAX), 0x10_0000);
/// ```
#[inline]
#[must_use]
pub const fn pages_for(size: u32) -> u32 {
    size.div_ceil(info::PAGE_SIZE)
}
