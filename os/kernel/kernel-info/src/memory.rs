//! # Memory Layout

/// Size of a page and of a physical frame.
pub const PAGE_SIZE: u32 = 4096;

/// Number of entries in a page directory or page table.
pub const ENTRIES_PER_TABLE: usize = 1024;

/// Start of kernel space; everything below belongs to user space.
pub const KERNEL_START: u32 = 0xC000_0000;

/// First page-directory index of kernel space.
pub const KERNEL_PDE_START: usize = (KERNEL_START >> 22) as usize;

/// Number of page-directory entries shared by all address spaces.
pub const KERNEL_PDE_COUNT: usize = ENTRIES_PER_TABLE - KERNEL_PDE_START;

/// End (exclusive) of the kernel heap. The heap starts right after the
/// statically reserved kernel memory.
pub const KERNEL_HEAP_END: u32 = 0xE000_0000;

/// Start of the virtual window for memory-mapped IO.
pub const IO_START: u32 = 0xE000_0000;

/// End (exclusive) of the IO window.
pub const IO_END: u32 = 0xFF80_0000;

/// Start of the paging area. Page directories and page tables live here only.
pub const PAGING_AREA_START: u32 = 0xFF80_0000;

/// Size of the paging area; exactly one page table's span.
pub const PAGING_AREA_SIZE: u32 = 4 * 1024 * 1024;

/// End (exclusive) of the paging area.
pub const PAGING_AREA_END: u32 = PAGING_AREA_START + PAGING_AREA_SIZE;

/// Start of the per-address-space user heap.
pub const USER_HEAP_START: u32 = 0x4000_0000;

/// End (exclusive) of the per-address-space user heap.
pub const USER_HEAP_END: u32 = KERNEL_START;

/// Upper bound for usable physical memory (3.75 GiB), applied even if the
/// firmware reports more.
pub const PHYS_MEM_CAP: u32 = 0xF000_0000;

/// Minimum usable physical memory. Below this the kernel halts.
pub const MIN_PHYS_MEMORY: u32 = 10 * 1024 * 1024;

/// Size of the bump arena serving bookkeeping before the heap exists.
pub const BOOTSTRAP_ARENA_SIZE: usize = 256 * 1024;

/// Number of consecutive already-unmapped pages after which a range unmap
/// gives up.
pub const UNMAPPED_RUN_LIMIT: usize = 3;

const _: () = {
    assert!(PAGE_SIZE.is_power_of_two());
    assert!(KERNEL_START.is_multiple_of(4 * 1024 * 1024));
    assert!(KERNEL_PDE_START == 768);
    assert!(KERNEL_HEAP_END > KERNEL_START);
    assert!(IO_START >= KERNEL_HEAP_END);
    assert!(IO_END > IO_START);
    assert!(PAGING_AREA_START >= IO_END);
    assert!(PAGING_AREA_START.is_multiple_of(4 * 1024 * 1024));
    assert!(USER_HEAP_START < USER_HEAP_END);
    assert!(USER_HEAP_END <= KERNEL_START);
    assert!(MIN_PHYS_MEMORY <= PHYS_MEM_CAP);
    assert!(BOOTSTRAP_ARENA_SIZE.is_multiple_of(PAGE_SIZE as usize));
};
