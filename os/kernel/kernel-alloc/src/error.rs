use crate::address_space::AddressSpaceId;
use crate::fault::PageFaultError;
use core::fmt;
use kernel_info::memory::PAGE_SIZE;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_vmem::AddressSpaceMapError;

/// The pool that ran dry in [`MemoryError::OutOfMemory`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Pool {
    Frames,
    PagingArea,
    IoRegion,
    BootstrapArena,
    KernelHeap,
    UserHeap,
}

impl fmt::Display for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Frames => "physical frame",
            Self::PagingArea => "paging area",
            Self::IoRegion => "IO region",
            Self::BootstrapArena => "bootstrap arena",
            Self::KernelHeap => "kernel heap",
            Self::UserHeap => "user heap",
        })
    }
}

/// Every failure of the memory subsystem.
///
/// None of these are recoverable; the kernel is expected to halt with the
/// `Display` text, which carries the context needed to debug it.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum MemoryError {
    #[error("out of {pool} memory while requesting {requested} bytes")]
    OutOfMemory { pool: Pool, requested: u32 },
    #[error("illegal page access at {address} (error code {:#x}): {}", .error.into_bits(), .error.explain())]
    IllegalPageAccess {
        address: VirtualAddress,
        error: PageFaultError,
    },
    #[error("null pointer access at {0}")]
    NullPointer(VirtualAddress),
    #[error("illegal state: {0}")]
    IllegalState(&'static str),
    #[error("insufficient physical memory: found {found} bytes, at least {required} required")]
    InsufficientMemory { found: u32, required: u32 },
    #[error("{0} is already mapped")]
    AlreadyMapped(VirtualAddress),
    #[error("no address space {0}")]
    NoSuchAddressSpace(AddressSpaceId),
    #[error("frame bookkeeping violated: {0}")]
    Frame(FrameError),
}

/// Failures reported by the [`FrameAllocator`](crate::frame_alloc::FrameAllocator).
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum FrameError {
    #[error("no run of {requested} free frames")]
    Exhausted { requested: u32 },
    #[error("frame {0} is not allocated")]
    NotAllocated(PhysicalAddress),
    #[error("frame {0} is outside the managed region")]
    OutOfRange(PhysicalAddress),
}

impl From<FrameError> for MemoryError {
    fn from(value: FrameError) -> Self {
        match value {
            FrameError::Exhausted { requested } => Self::OutOfMemory {
                pool: Pool::Frames,
                requested: requested.saturating_mul(PAGE_SIZE),
            },
            other => Self::Frame(other),
        }
    }
}

impl From<AddressSpaceMapError> for MemoryError {
    fn from(value: AddressSpaceMapError) -> Self {
        match value {
            AddressSpaceMapError::OutOfTables(_) => Self::OutOfMemory {
                pool: Pool::PagingArea,
                requested: PAGE_SIZE,
            },
            AddressSpaceMapError::AlreadyMapped(va) => Self::AlreadyMapped(va),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn exhausted_frames_become_out_of_memory() {
        let err: MemoryError = FrameError::Exhausted { requested: 3 }.into();
        assert_eq!(
            err,
            MemoryError::OutOfMemory {
                pool: Pool::Frames,
                requested: 3 * 4096
            }
        );
        assert_eq!(
            err.to_string(),
            "out of physical frame memory while requesting 12288 bytes"
        );
    }

    #[test]
    fn protection_fault_message_names_address_and_code() {
        let err = MemoryError::IllegalPageAccess {
            address: VirtualAddress::new(0xC010_0000),
            error: PageFaultError::from_bits(0b011),
        };
        assert_eq!(
            err.to_string(),
            "illegal page access at 0xC0100000 (error code 0x3): Write access to protected page"
        );
    }
}
