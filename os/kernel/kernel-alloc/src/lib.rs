//! # Kernel Memory Management
//!
//! Physical memory accounting, address spaces, demand paging and the kernel
//! heap of a 32-bit kernel. The paging structures themselves live in
//! `kernel-vmem`; this crate decides what gets mapped where.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │              Memory Manager ([`manager`])           │
//! │    • Bootstrap → Ready phases                       │
//! │    • Page-fault handling, map / unmap / IO          │
//! │    • Address-space registry and switching           │
//! └───────┬──────────────┬──────────────┬───────────────┘
//!         │              │              │
//! ┌───────▼──────┐ ┌─────▼────────┐ ┌───▼───────────────┐
//! │ Frame        │ │ Paging area  │ │ IO window         │
//! │ allocator    │ │ (tables only)│ │ (device memory)   │
//! └──────────────┘ └──────────────┘ └───────────────────┘
//!         ▲
//! ┌───────┴─────────────────────────────────────────────┐
//! │  Bootstrap arena (bitmaps before any heap exists)   │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! ## Virtual Memory Layout
//!
//! ```text
//! 0x0000_0000 ┌─────────────────────────────────┐
//!             │  User space (demand paged)      │
//! 0x4000_0000 ├─────────────────────────────────┤ USER_HEAP_START
//!             │  Per-space user heap            │
//! 0xC000_0000 ├─────────────────────────────────┤ KERNEL_START (shared from here on)
//!             │  Kernel image ↔ [0, reserved)   │
//!             │  Kernel heap (demand paged)     │
//! 0xE000_0000 ├─────────────────────────────────┤ KERNEL_HEAP_END, IO_START
//!             │  IO window (uncached)           │
//! 0xFF80_0000 ├─────────────────────────────────┤ PAGING_AREA_START
//!             │  Paging area (1:1, 4 MiB)       │
//! 0xFFFF_FFFF └─────────────────────────────────┘
//! ```
//!
//! ## Bring-up
//!
//! ```rust,ignore
//! #[global_allocator]
//! static GLOBAL_ALLOCATOR: GlobalHeap = GlobalHeap::new();
//!
//! let arena = BootstrapArena::take_static().ok_or(...)?;
//! let mapper = unsafe { PagingAreaMapper::new(boot.paging_area_phys) };
//! let boot_mm = Bootstrap::start(mapper, unsafe { X86Paging::new() }, &boot, arena)?;
//! // route #PF to boot_mm.handle_page_fault(cr2, error) from here on
//! let heap = unsafe { GLOBAL_ALLOCATOR.install(KernelHeapRegion::kernel_default(&boot)?)? };
//! let mm = boot_mm.into_ready(heap, run_constructors)?;
//! mm.write_protect_kernel_code();
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

pub mod address_space;
pub mod arena;
pub mod bitmap;
mod error;
pub mod fault;
pub mod frame_alloc;
pub mod free_list;
pub mod global;
pub mod heap;
pub mod io_memory;
pub mod manager;
pub mod paging_area;

pub use crate::address_space::AddressSpaceId;
pub use crate::arena::BootstrapArena;
pub use crate::error::{FrameError, MemoryError, Pool};
pub use crate::fault::PageFaultError;
pub use crate::global::GlobalHeap;
pub use crate::heap::{KernelHeap, KernelHeapRegion};
pub use crate::manager::{Bootstrap, MemoryCore, MemoryManager, MemorySpace, MemoryState};
pub use crate::paging_area::PagingAreaMapper;
