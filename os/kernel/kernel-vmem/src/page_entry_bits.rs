use bitfield_struct::bitfield;
use kernel_memory_addresses::{PhysicalPage, Size4K};

/// A single 32-bit x86 paging entry in its raw bitfield form.
///
/// This structure models both levels of non-PAE 32-bit paging: page
/// directory entries (PDE) and page table entries (PTE). They share the same
/// layout; the differences are in which bits the CPU interprets.
///
/// ### Bit layout
///
/// | Bits      | Name / Mnemonic   | Meaning |
/// |-----------|-------------------|----------|
/// | 0         | `P` (present)     | Valid entry if set |
/// | 1         | `RW`              | Writable if set |
/// | 2         | `US`              | User-mode accessible if set |
/// | 3         | `PWT`             | Write-through caching |
/// | 4         | `PCD`             | Disable caching |
/// | 5         | `A`               | Accessed |
/// | 6         | `D`               | Dirty (PTE only) |
/// | 7         | `PS` / `PAT`      | 4 MiB page in a PDE, PAT in a PTE; always 0 here |
/// | 8         | `G`               | Global (PTE only) |
/// | 9         | OS: `unmanaged`   | Frame is not owned by the frame allocator |
/// | 10–11     | OS avail          | Reserved for OS use |
/// | 12–31     | `frame`           | Physical frame number |
///
/// ### Example
/// ```rust
/// # use kernel_memory_addresses::{PhysicalPage, Size4K};
/// # use kernel_vmem::PageEntryBits;
/// let e = PageEntryBits::new()
///     .with_present(true)
///     .with_writable(true)
///     .with_physical_page(PhysicalPage::<Size4K>::from_number(0x345));
/// assert_eq!(e.into_bits(), 0x0034_5003);
/// ```
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct PageEntryBits {
    /// Present (P, bit 0).
    ///
    /// Clear implies a not-present entry; any access faults.
    pub present: bool,

    /// Writable (RW, bit 1).
    ///
    /// Clear for read-only. Binding for supervisor code only while `CR0.WP` is set.
    pub writable: bool,

    /// User/Supervisor (US, bit 2).
    pub user_access: bool,

    /// Page Write-Through (PWT, bit 3).
    pub write_through: bool,

    /// Page Cache Disable (PCD, bit 4).
    ///
    /// Set for memory-mapped IO so device registers are never cached.
    pub cache_disabled: bool,

    /// Accessed (A, bit 5). Set by the CPU.
    pub accessed: bool,

    /// Dirty (D, bit 6). Set by the CPU on the first write through a PTE.
    pub dirty: bool,

    /// Page Size in a PDE / PAT in a PTE (bit 7).
    ///
    /// 4 MiB pages are not used, so this stays clear at both levels.
    pub large_page: bool,

    /// Global (G, bit 8).
    pub global: bool,

    /// OS bit 9: the mapped frame does not belong to the frame allocator
    /// (device memory, kernel image, paging area) and must not be freed on unmap.
    pub unmanaged: bool,

    /// OS-available bits 10..=11.
    #[bits(2)]
    pub os_available: u8,

    /// Physical frame number (bits 12..=31).
    #[bits(20)]
    frame_4k: u32,
}

impl PageEntryBits {
    /// The 4 KiB physical page this entry references.
    #[inline]
    #[must_use]
    pub const fn physical_page(&self) -> PhysicalPage<Size4K> {
        PhysicalPage::from_number(self.frame_4k())
    }

    #[inline]
    #[must_use]
    pub const fn with_physical_page(self, page: PhysicalPage<Size4K>) -> Self {
        self.with_frame_4k(page.number())
    }

    #[inline]
    pub const fn set_physical_page(&mut self, page: PhysicalPage<Size4K>) {
        self.set_frame_4k(page.number());
    }

    /// Flags used for directory entries linking a page table.
    #[inline]
    #[must_use]
    pub const fn table_link(user: bool) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_user_access(user)
    }
}
