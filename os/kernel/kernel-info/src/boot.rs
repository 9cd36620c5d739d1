//! # Kernel Boot Information

use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};

/// Type of a memory map region, numbered as in the multiboot memory map.
#[repr(u32)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MemoryKind {
    /// RAM free for use by the kernel.
    Available = 1,
    /// Firmware or device memory; never touch.
    Reserved = 2,
    /// ACPI tables, reusable once parsed.
    AcpiReclaimable = 3,
    /// ACPI non-volatile storage.
    AcpiNvs = 4,
    /// Defective RAM.
    BadMemory = 5,
}

impl MemoryKind {
    /// Decode a raw type value; unknown types are treated as reserved.
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        match raw {
            1 => Self::Available,
            3 => Self::AcpiReclaimable,
            4 => Self::AcpiNvs,
            5 => Self::BadMemory,
            _ => Self::Reserved,
        }
    }
}

/// One region of the firmware memory map.
///
/// Base and length stay 64 bit as reported; the memory subsystem clips them
/// to the 32-bit physical space.
#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MemoryMapEntry {
    pub base: u64,
    pub length: u64,
    pub kind: MemoryKind,
}

impl MemoryMapEntry {
    #[must_use]
    pub const fn new(base: u64, length: u64, kind: MemoryKind) -> Self {
        Self { base, length, kind }
    }

    #[must_use]
    pub const fn is_available(&self) -> bool {
        matches!(self.kind, MemoryKind::Available)
    }
}

/// Virtual range `[start, end)` holding the kernel's executable code.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct KernelCodeRange {
    pub start: VirtualAddress,
    pub end: VirtualAddress,
}

/// Options parsed from the kernel command line that influence memory setup.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct BootOptions {
    /// A debugger patches breakpoints into kernel code; keep code writable.
    pub debugger_attached: bool,
}

/// Everything the memory subsystem needs from the boot stub.
#[derive(Copy, Clone, Debug)]
pub struct BootInfo<'a> {
    /// Firmware memory map, in the order reported.
    pub memory_map: &'a [MemoryMapEntry],

    /// End of statically reserved physical memory (kernel image, boot data).
    ///
    /// `[0, reserved_memory_end)` is mapped at [`KERNEL_START`](crate::memory::KERNEL_START)
    /// and is never handed out as a frame. The kernel heap starts at its
    /// virtual counterpart.
    pub reserved_memory_end: PhysicalAddress,

    /// Physical base of the 4 MiB block the boot stub mapped 1:1 at
    /// [`PAGING_AREA_START`](crate::memory::PAGING_AREA_START).
    pub paging_area_phys: PhysicalAddress,

    /// Kernel code range, write-protected once constructors have run.
    pub kernel_code: KernelCodeRange,

    pub options: BootOptions,
}
