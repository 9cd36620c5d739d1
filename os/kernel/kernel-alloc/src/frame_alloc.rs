//! # Physical Frame Allocator
//!
//! Manages the usable physical memory as 4 KiB frames using a bitmap
//! allocator.
//!
//! # Design
//! - Each bit in the bitmap represents one 4 KiB frame of the usable region.
//! - Bit = 0: frame is free, bit = 1: frame is allocated or reserved.
//! - Bitmap storage comes from the [`BootstrapArena`], so the allocator works
//!   before any heap exists.
//! - Allocations are contiguous runs returned as move-only [`Frame`] handles.
//!   Frames whose ownership moved into a page table are released one by one
//!   through [`FrameAllocator::free_page`], which detects double frees.

use crate::arena::BootstrapArena;
use crate::bitmap::Bitmap;
use crate::error::{FrameError, MemoryError};
use kernel_info::boot::MemoryMapEntry;
use kernel_info::memory::{MIN_PHYS_MEMORY, PAGE_SIZE, PHYS_MEM_CAP};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K};
use kernel_vmem::pages_for;

/// End of the 32-bit physical address space.
const PHYS_LIMIT: u64 = 1 << 32;

/// The physical region selected as general-purpose RAM.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct UsableMemory {
    pub base: PhysicalAddress,
    pub size: u32,
}

impl UsableMemory {
    /// Exclusive end of the region, as a 64-bit value.
    #[must_use]
    pub fn end(&self) -> u64 {
        u64::from(self.base.as_u32()) + u64::from(self.size)
    }
}

/// Pick the largest available region of `map`, clip it to 32 bits and cap it
/// at [`PHYS_MEM_CAP`].
///
/// # Errors
/// - [`MemoryError::IllegalState`] if the map has no available region.
/// - [`MemoryError::InsufficientMemory`] if the result is below [`MIN_PHYS_MEMORY`].
pub fn compute_usable_memory(map: &[MemoryMapEntry]) -> Result<UsableMemory, MemoryError> {
    let largest = map
        .iter()
        .filter(|e| e.is_available())
        .filter_map(|e| {
            let base = e.base.next_multiple_of(u64::from(PAGE_SIZE));
            let end = e.base.saturating_add(e.length).min(PHYS_LIMIT);
            (base < end).then_some((base, end.saturating_sub(base)))
        })
        .max_by_key(|&(_, length)| length)
        .ok_or(MemoryError::IllegalState("memory map has no available region"))?;

    let (base, length) = largest;
    let length = length.min(u64::from(PHYS_MEM_CAP));
    let size = u32::try_from(length).unwrap_or(PHYS_MEM_CAP);
    // Whole frames only.
    let size = size - size % PAGE_SIZE;

    if size < MIN_PHYS_MEMORY {
        return Err(MemoryError::InsufficientMemory {
            found: size,
            required: MIN_PHYS_MEMORY,
        });
    }

    let base = PhysicalAddress::new(u32::try_from(base).map_err(|_| {
        MemoryError::IllegalState("usable memory starts above 4 GiB")
    })?);
    log::info!(
        "Usable physical memory: {} KiB at {base} ({} region(s) reported)",
        size / 1024,
        map.len()
    );
    Ok(UsableMemory { base, size })
}

/// An owned run of contiguous physical frames.
///
/// Dropping a `Frame` leaks it; hand it back with [`FrameAllocator::free`] or
/// give up ownership explicitly with [`Frame::into_raw`].
#[must_use = "dropping a Frame leaks it"]
#[derive(Debug, Eq, PartialEq)]
pub struct Frame {
    start: PhysicalPage<Size4K>,
    count: u32,
}

impl Frame {
    /// Physical address of the first frame.
    #[inline]
    pub const fn base(&self) -> PhysicalAddress {
        self.start.base()
    }

    /// Number of frames in the run.
    #[inline]
    pub const fn count(&self) -> u32 {
        self.count
    }

    /// Physical address of the `i`-th frame of the run.
    #[inline]
    pub const fn page(&self, i: u32) -> PhysicalAddress {
        debug_assert!(i < self.count);
        PhysicalPage::<Size4K>::from_number(self.start.number() + i).base()
    }

    /// Give up the handle; the frames are now tracked elsewhere (e.g. by
    /// page-table entries) and must come back through
    /// [`FrameAllocator::free_page`].
    #[inline]
    pub const fn into_raw(self) -> (PhysicalAddress, u32) {
        (self.start.base(), self.count)
    }
}

pub struct FrameAllocator {
    bitmap: Bitmap<&'static mut [u32]>,
    first: PhysicalPage<Size4K>,
    free: u32,
    hint: u32,
}

impl FrameAllocator {
    /// Manage `region`, marking every frame that intersects one of the
    /// `reserved` ranges (`[start, end)`) as used.
    ///
    /// # Errors
    /// [`MemoryError::OutOfMemory`] if the arena cannot hold the bitmap.
    pub fn new(
        region: UsableMemory,
        reserved: &[(PhysicalAddress, PhysicalAddress)],
        arena: &mut BootstrapArena,
    ) -> Result<Self, MemoryError> {
        debug_assert!(region.base.is_aligned::<Size4K>());
        let frames = region.size / PAGE_SIZE;
        let words = arena.alloc_words(Bitmap::<&mut [u32]>::words_for(frames))?;
        let mut this = Self {
            bitmap: Bitmap::new(words, frames),
            first: PhysicalPage::from_addr(region.base),
            free: frames,
            hint: 0,
        };

        for &(start, end) in reserved {
            this.reserve(start, end);
        }

        log::info!(
            "Frame allocator: {} frames, {} free, bitmap {} bytes",
            frames,
            this.free,
            frames.div_ceil(8)
        );
        Ok(this)
    }

    fn reserve(&mut self, start: PhysicalAddress, end: PhysicalAddress) {
        let lo = start.as_u32() / PAGE_SIZE;
        let hi = end.as_u32().div_ceil(PAGE_SIZE);
        let first = self.first.number();
        let lo = lo.max(first) - first;
        let hi = hi.min(first + self.total_frames()).saturating_sub(first);
        for i in lo..hi {
            if !self.bitmap.get(i) {
                self.bitmap.set(i);
                self.free -= 1;
            }
        }
        if lo < hi {
            log::debug!("Reserved frames {start}..{end}");
        }
    }

    /// Allocate `ceil(size / 4096)` contiguous frames (at least one).
    ///
    /// # Errors
    /// [`FrameError::Exhausted`] if no long enough run of free frames exists.
    pub fn alloc(&mut self, size: u32) -> Result<Frame, FrameError> {
        let count = pages_for(size).max(1);
        let exhausted = FrameError::Exhausted { requested: count };
        if count > self.free {
            return Err(exhausted);
        }
        let start = self.bitmap.find_clear_run(count, self.hint).ok_or(exhausted)?;
        self.bitmap.set_range(start, count);
        self.free -= count;
        self.hint = start + count;
        Ok(Frame {
            start: PhysicalPage::from_number(self.first.number() + start),
            count,
        })
    }

    /// Allocate a single frame.
    ///
    /// # Errors
    /// [`FrameError::Exhausted`] if no frame is free.
    #[inline]
    pub fn alloc_page(&mut self) -> Result<Frame, FrameError> {
        self.alloc(PAGE_SIZE)
    }

    /// Return every frame of `frame` to the pool.
    pub fn free(&mut self, frame: Frame) {
        let (base, count) = frame.into_raw();
        for i in 0..count {
            let result = self.free_page(base + i * PAGE_SIZE);
            debug_assert!(result.is_ok(), "frame handle from another allocator");
        }
    }

    /// Return the single frame at `pa` to the pool.
    ///
    /// # Errors
    /// - [`FrameError::OutOfRange`] if `pa` is outside the managed region.
    /// - [`FrameError::NotAllocated`] if the frame is already free.
    pub fn free_page(&mut self, pa: PhysicalAddress) -> Result<(), FrameError> {
        let index = self.index_of(pa).ok_or(FrameError::OutOfRange(pa))?;
        if !self.bitmap.get(index) {
            return Err(FrameError::NotAllocated(pa));
        }
        self.bitmap.clear(index);
        self.free += 1;
        Ok(())
    }

    /// `true` if the frame holding `pa` is in use (allocated or reserved).
    #[must_use]
    pub fn is_allocated(&self, pa: PhysicalAddress) -> bool {
        self.index_of(pa).is_some_and(|i| self.bitmap.get(i))
    }

    fn index_of(&self, pa: PhysicalAddress) -> Option<u32> {
        let n = pa.page::<Size4K>().number();
        let first = self.first.number();
        (n >= first && n - first < self.total_frames()).then(|| n - first)
    }

    #[must_use]
    pub const fn free_frames(&self) -> u32 {
        self.free
    }

    #[must_use]
    pub const fn total_frames(&self) -> u32 {
        self.bitmap.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::boxed::Box;
    use alloc::collections::BTreeSet;
    use alloc::vec;
    use kernel_info::boot::MemoryKind;

    const MIB: u64 = 1024 * 1024;

    fn arena() -> BootstrapArena {
        BootstrapArena::new(Box::leak(vec![0u8; 128 * 1024].into_boxed_slice()))
    }

    fn allocator(base: u32, size: u32) -> FrameAllocator {
        let region = UsableMemory {
            base: PhysicalAddress::new(base),
            size,
        };
        FrameAllocator::new(region, &[], &mut arena()).unwrap()
    }

    fn used_set(fa: &FrameAllocator, base: u32) -> BTreeSet<u32> {
        (0..fa.total_frames())
            .map(|i| base + i * PAGE_SIZE)
            .filter(|&pa| fa.is_allocated(PhysicalAddress::new(pa)))
            .collect()
    }

    #[test]
    fn picks_largest_available_region() {
        let map = [
            MemoryMapEntry::new(0, 0x9_F000, MemoryKind::Available),
            MemoryMapEntry::new(MIB, 511 * MIB, MemoryKind::Available),
            MemoryMapEntry::new(512 * MIB, 1024 * MIB, MemoryKind::Reserved),
        ];
        let usable = compute_usable_memory(&map).unwrap();
        assert_eq!(usable.base, PhysicalAddress::new(0x10_0000));
        assert_eq!(usable.size, 511 * 1024 * 1024);
    }

    #[test]
    fn caps_large_regions() {
        let map = [MemoryMapEntry::new(0, 16 * 1024 * MIB, MemoryKind::Available)];
        let usable = compute_usable_memory(&map).unwrap();
        assert_eq!(usable.size, PHYS_MEM_CAP);
    }

    #[test]
    fn refuses_below_floor() {
        let map = [MemoryMapEntry::new(MIB, 8 * MIB, MemoryKind::Available)];
        assert_eq!(
            compute_usable_memory(&map),
            Err(MemoryError::InsufficientMemory {
                found: 8 * 1024 * 1024,
                required: MIN_PHYS_MEMORY
            })
        );
        assert!(matches!(
            compute_usable_memory(&[]),
            Err(MemoryError::IllegalState(_))
        ));
    }

    #[test]
    fn round_trip_restores_pool() {
        let mut fa = allocator(0x10_0000, 64 * 4096);
        let keep = fa.alloc(3 * 4096).unwrap();
        let before = used_set(&fa, 0x10_0000);
        let free_before = fa.free_frames();

        let frame = fa.alloc(5 * 4096 - 1).unwrap();
        assert_eq!(frame.count(), 5);
        assert_eq!(fa.free_frames(), free_before - 5);
        fa.free(frame);

        assert_eq!(used_set(&fa, 0x10_0000), before);
        assert_eq!(fa.free_frames(), free_before);
        let again = fa.alloc(5 * 4096).unwrap();
        assert_eq!(again.count(), 5);
        fa.free(again);
        fa.free(keep);
        assert_eq!(fa.free_frames(), 64);
    }

    #[test]
    fn runs_are_contiguous() {
        let mut fa = allocator(0x10_0000, 16 * 4096);
        let a = fa.alloc_page().unwrap();
        let b = fa.alloc(4 * 4096).unwrap();
        for i in 0..4 {
            assert!(fa.is_allocated(b.page(i)));
        }
        assert_eq!(b.page(3), b.base() + 3 * 4096);
        fa.free(a);
        fa.free(b);
    }

    #[test]
    fn double_free_is_detected() {
        let mut fa = allocator(0x10_0000, 16 * 4096);
        let (pa, _) = fa.alloc_page().unwrap().into_raw();
        assert_eq!(fa.free_page(pa), Ok(()));
        assert_eq!(fa.free_page(pa), Err(FrameError::NotAllocated(pa)));
        let outside = PhysicalAddress::new(0x1000);
        assert_eq!(fa.free_page(outside), Err(FrameError::OutOfRange(outside)));
    }

    #[test]
    fn exhaustion_is_reported() {
        let mut fa = allocator(0x10_0000, 4 * 4096);
        let all = fa.alloc(4 * 4096).unwrap();
        assert_eq!(fa.alloc_page(), Err(FrameError::Exhausted { requested: 1 }));
        fa.free(all);
        assert!(fa.alloc(5 * 4096).is_err());
    }

    #[test]
    fn reserved_ranges_are_never_handed_out() {
        let region = UsableMemory {
            base: PhysicalAddress::new(0x10_0000),
            size: 16 * 4096,
        };
        let reserved = [(PhysicalAddress::new(0), PhysicalAddress::new(0x10_3001))];
        let mut fa = FrameAllocator::new(region, &reserved, &mut arena()).unwrap();
        assert_eq!(fa.free_frames(), 12);
        let frame = fa.alloc_page().unwrap();
        assert_eq!(frame.base(), PhysicalAddress::new(0x10_4000));
        fa.free(frame);
    }
}
