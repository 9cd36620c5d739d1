//! # Virtual Address Spaces
//!
//! A [`VirtualAddressSpace`] pairs a page directory with the heap serving
//! user allocations inside it. The memory manager keeps spaces in a registry
//! keyed by [`AddressSpaceId`]; collaborators only ever hold ids.

use crate::heap::RangeHeap;
use core::fmt;
use kernel_info::memory::{USER_HEAP_END, USER_HEAP_START};
use kernel_vmem::address_space::RootPage;

/// Handle of a registered address space.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct AddressSpaceId(u32);

impl AddressSpaceId {
    /// The throwaway space used while bootstrapping. Never registered.
    pub const BOOTSTRAP: Self = Self(0);

    #[inline]
    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for AddressSpaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug)]
pub struct VirtualAddressSpace {
    id: AddressSpaceId,
    root: RootPage,
    heap: Option<RangeHeap>,
}

impl VirtualAddressSpace {
    /// A space over the directory in `root`; its heap is set up on first use.
    #[must_use]
    pub const fn new(id: AddressSpaceId, root: RootPage) -> Self {
        Self { id, root, heap: None }
    }

    /// The bootstrap space, aliasing the base directory.
    #[must_use]
    pub const fn bootstrap(base: RootPage) -> Self {
        Self::new(AddressSpaceId::BOOTSTRAP, base)
    }

    #[inline]
    #[must_use]
    pub const fn id(&self) -> AddressSpaceId {
        self.id
    }

    #[inline]
    #[must_use]
    pub const fn root(&self) -> RootPage {
        self.root
    }

    /// `true` once [`initialize`](Self::initialize) ran.
    #[must_use]
    pub const fn is_initialized(&self) -> bool {
        self.heap.is_some()
    }

    /// First-use setup; later calls do nothing.
    ///
    /// Allocates heap bookkeeping, so it must not run with the paging state locked.
    pub fn initialize(&mut self) {
        if self.heap.is_none() {
            log::debug!("Initializing heap of address space {}", self.id);
            self.heap = Some(RangeHeap::new(USER_HEAP_START, USER_HEAP_END));
        }
    }

    pub const fn heap_mut(&mut self) -> Option<&mut RangeHeap> {
        self.heap.as_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::HeapManager;
    use kernel_memory_addresses::PhysicalPage;

    #[test]
    fn heap_is_created_once_on_first_use() {
        let mut space = VirtualAddressSpace::new(AddressSpaceId::new(3), PhysicalPage::from_number(0x400));
        assert!(!space.is_initialized());
        assert!(space.heap_mut().is_none());

        space.initialize();
        let heap = space.heap_mut().unwrap();
        assert_eq!(heap.bounds(), (USER_HEAP_START, USER_HEAP_END));
        heap.allocate(64, 8).unwrap();

        space.initialize();
        assert_eq!(space.heap_mut().unwrap().allocations(), 1);
        assert_eq!(space.id().to_string(), "#3");
    }
}
