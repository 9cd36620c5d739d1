//! # Kernel Configuration and Boot Interface
//!
//! This crate defines the memory layout constants and the boot hand-off types
//! that govern how the kernel's memory subsystem comes up. It is the single
//! source of truth for addresses shared between the boot stub, the paging code
//! and the allocators.
//!
//! ## Architecture
//!
//! ### Memory Layout ([`memory`])
//! Compile-time constants describing the 32-bit virtual address space split,
//! the kernel heap, the IO window and the paging area, plus the physical
//! memory cap and floor.
//!
//! ### Boot Information ([`boot`])
//! The data handed over by the boot stub: the firmware memory map, the end of
//! statically reserved physical memory, the physical block backing the paging
//! area and the kernel code range.
//!
//! ## Virtual Memory Architecture
//!
//! ```text
//! Virtual Address Space Layout (32-bit, two-level paging):
//!
//! 0x0000_0000 ┌─────────────────────────────────┐
//!             │         User Space              │
//! 0x4000_0000 ├─────────────────────────────────┤ USER_HEAP_START
//!             │      Per-space user heap        │
//! 0xC000_0000 ├─────────────────────────────────┤ KERNEL_START (PDE 768)
//!             │  Kernel image + static memory   │
//!             │  Kernel heap (demand paged)     │
//! 0xE000_0000 ├─────────────────────────────────┤ KERNEL_HEAP_END / IO_START
//!             │      IO window (no-cache)       │
//! 0xFF80_0000 ├─────────────────────────────────┤ IO_END / PAGING_AREA_START
//!             │  Paging area (tables, 4 MiB)    │
//! 0xFFC0_0000 ├─────────────────────────────────┤ PAGING_AREA_END
//!             │          unused                 │
//! 0xFFFF_FFFF └─────────────────────────────────┘
//! ```
//!
//! Everything from [`KERNEL_START`](memory::KERNEL_START) upward is shared by
//! every address space: the 256 kernel page tables are created once and their
//! directory entries are copied into each new page directory.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod boot;
pub mod memory;
