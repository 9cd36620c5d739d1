//! Simulated physical memory and paging hardware.
//!
//! Lets the paging code and the memory manager run unmodified on the host:
//! [`SimulatedRam`] is a sparse set of 4 KiB frames reachable through
//! [`PhysMapper`], and [`SimulatedHardware`] records what would have been
//! written to CR3, CR0 and the TLB.

use crate::{PagingHardware, PhysMapper};
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::cell::{Cell, RefCell};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualPage};

#[repr(C, align(4096))]
struct Frame([u8; 4096]);

/// Sparse physical RAM. Frames are materialized zeroed on first access.
#[derive(Default)]
pub struct SimulatedRam {
    frames: RefCell<BTreeMap<u32, Box<Frame>>>,
}

impl SimulatedRam {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of frames that have been accessed at least once.
    #[must_use]
    pub fn touched_frames(&self) -> usize {
        self.frames.borrow().len()
    }

    /// Copy of the bytes of the frame at `page`.
    #[must_use]
    pub fn read_frame(&self, page: PhysicalPage<Size4K>) -> Vec<u8> {
        self.frames
            .borrow()
            .get(&page.number())
            .map_or_else(|| alloc::vec![0; 4096], |f| f.0.to_vec())
    }

    /// Fill the frame at `page` with `byte`.
    pub fn fill_frame(&self, page: PhysicalPage<Size4K>, byte: u8) {
        unsafe { self.frame_ptr(page.number()).write_bytes(byte, 4096) };
    }

    fn frame_ptr(&self, number: u32) -> *mut u8 {
        let mut frames = self.frames.borrow_mut();
        let frame = frames
            .entry(number)
            .or_insert_with(|| Box::new(Frame([0; 4096])));
        // The boxed frame never moves, even when the map rebalances.
        frame.0.as_mut_ptr()
    }
}

impl PhysMapper for SimulatedRam {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        let (page, offset) = pa.split::<Size4K>();
        debug_assert!(offset as usize + size_of::<T>() <= 4096, "access crosses a frame");
        debug_assert!((offset as usize).is_multiple_of(align_of::<T>()), "misaligned access");
        unsafe { &mut *self.frame_ptr(page.number()).add(offset as usize).cast::<T>() }
    }
}

/// Paging hardware that only records what it was asked to do.
#[derive(Default)]
pub struct SimulatedHardware {
    directory: Cell<Option<PhysicalPage<Size4K>>>,
    loads: Cell<usize>,
    invalidated: RefCell<Vec<VirtualPage<Size4K>>>,
    write_protect: Cell<bool>,
}

impl SimulatedHardware {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The directory most recently loaded into the simulated CR3.
    #[must_use]
    pub fn active_directory(&self) -> Option<PhysicalPage<Size4K>> {
        self.directory.get()
    }

    /// How many times CR3 was written.
    #[must_use]
    pub fn directory_loads(&self) -> usize {
        self.loads.get()
    }

    /// Every page passed to `invlpg`, in order.
    #[must_use]
    pub fn invalidated(&self) -> Vec<VirtualPage<Size4K>> {
        self.invalidated.borrow().clone()
    }

    #[must_use]
    pub fn write_protect_enabled(&self) -> bool {
        self.write_protect.get()
    }
}

impl PagingHardware for SimulatedHardware {
    unsafe fn load_directory(&self, root: PhysicalPage<Size4K>) {
        self.directory.set(Some(root));
        self.loads.set(self.loads.get() + 1);
    }

    fn invalidate_page(&self, page: VirtualPage<Size4K>) {
        self.invalidated.borrow_mut().push(page);
    }

    unsafe fn enable_write_protect(&self) {
        self.write_protect.set(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_start_zeroed_and_keep_writes() {
        let ram = SimulatedRam::new();
        let pa = PhysicalAddress::new(0x0012_3008);
        let word: &mut u32 = unsafe { ram.phys_to_mut(pa) };
        assert_eq!(*word, 0);
        *word = 0xDEAD_BEEF;

        let again: &mut u32 = unsafe { ram.phys_to_mut(pa) };
        assert_eq!(*again, 0xDEAD_BEEF);
        assert_eq!(ram.touched_frames(), 1);

        let bytes = ram.read_frame(PhysicalPage::from_number(0x123));
        assert_eq!(&bytes[8..12], &0xDEAD_BEEFu32.to_ne_bytes());
    }

    #[test]
    fn fill_frame_overwrites_whole_frame() {
        let ram = SimulatedRam::new();
        let page = PhysicalPage::from_number(7);
        ram.fill_frame(page, 0xAA);
        assert!(ram.read_frame(page).iter().all(|b| *b == 0xAA));
    }
}
