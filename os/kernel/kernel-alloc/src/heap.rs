//! # Heaps
//!
//! Two heap managers sit behind [`HeapManager`]:
//!
//! - The kernel heap, a [`FreeListAllocator`] over
//!   `[KERNEL_START + reserved, KERNEL_HEAP_END)` wrapped in a lock as
//!   [`KernelHeap`]. Its pages are demand-paged, so the free-list headers
//!   themselves fault memory in.
//! - Per-address-space [`RangeHeap`]s over the user heap window. Their
//!   bookkeeping lives out-of-band in the kernel heap, so nothing is written
//!   into user pages on their behalf.

use crate::error::{MemoryError, Pool};
use crate::free_list::FreeListAllocator;
use alloc::collections::BTreeMap;
use core::ptr::{self, NonNull};
use kernel_info::boot::BootInfo;
use kernel_info::memory::{KERNEL_HEAP_END, KERNEL_START};
use kernel_memory_addresses::Size4K;
use kernel_sync::SpinLock;

/// Minimum alignment and granularity of user heap blocks.
const RANGE_GRANULE: u32 = 16;

/// Hands out blocks of a fixed virtual range.
pub trait HeapManager {
    /// Allocate `size` bytes aligned to `align` (a power of two).
    fn allocate(&mut self, size: usize, align: usize) -> Option<NonNull<u8>>;

    /// Return a block.
    ///
    /// # Safety
    /// `ptr` must come from [`allocate`](Self::allocate) on this heap and must
    /// not be used afterwards.
    unsafe fn free(&mut self, ptr: NonNull<u8>);

    /// Resize a block to `size` bytes aligned to `align`, keeping the first
    /// `min(old, size)` bytes. Returns `None` if nothing fits, in which case
    /// `ptr` is still valid.
    ///
    /// # Safety
    /// `ptr` must come from [`allocate`](Self::allocate) on this heap. After
    /// success only the returned pointer may be used.
    unsafe fn reallocate(&mut self, ptr: NonNull<u8>, size: usize, align: usize) -> Option<NonNull<u8>>;

    /// Bytes currently available.
    fn free_bytes(&self) -> usize;
}

impl HeapManager for FreeListAllocator {
    fn allocate(&mut self, size: usize, align: usize) -> Option<NonNull<u8>> {
        // SAFETY: `&mut self` is exclusive; the region was handed over in `init`.
        NonNull::new(unsafe { Self::allocate(self, size, align) })
    }

    unsafe fn free(&mut self, ptr: NonNull<u8>) {
        unsafe { self.deallocate(ptr.as_ptr()) }
    }

    unsafe fn reallocate(&mut self, ptr: NonNull<u8>, size: usize, align: usize) -> Option<NonNull<u8>> {
        NonNull::new(unsafe { Self::reallocate(self, ptr.as_ptr(), size, align) })
    }

    fn free_bytes(&self) -> usize {
        Self::free_bytes(self)
    }
}

/// Virtual range `[start, start + size)` of the kernel heap.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct KernelHeapRegion {
    pub start: usize,
    pub size: usize,
}

impl KernelHeapRegion {
    #[must_use]
    pub const fn new(start: usize, size: usize) -> Self {
        Self { start, size }
    }

    /// The heap window of a running kernel: from the page after the statically
    /// reserved memory up to [`KERNEL_HEAP_END`].
    ///
    /// # Errors
    /// [`MemoryError::IllegalState`] if the reserved memory leaves no room.
    pub fn kernel_default(boot: &BootInfo<'_>) -> Result<Self, MemoryError> {
        let reserved = boot
            .reserved_memory_end
            .checked_align_up::<Size4K>()
            .ok_or(MemoryError::IllegalState("reserved memory ends past 4 GiB"))?;
        let start = KERNEL_START
            .checked_add(reserved.as_u32())
            .filter(|start| *start < KERNEL_HEAP_END)
            .ok_or(MemoryError::IllegalState("reserved memory overlaps the kernel heap window"))?;
        Ok(Self::new(start as usize, (KERNEL_HEAP_END - start) as usize))
    }

    #[must_use]
    pub const fn end(&self) -> usize {
        self.start + self.size
    }
}

/// The kernel heap, shared by every subsystem.
pub struct KernelHeap {
    allocator: SpinLock<FreeListAllocator>,
    region: KernelHeapRegion,
}

impl KernelHeap {
    /// Place a free-list heap over `region`.
    ///
    /// # Safety
    /// `region` must be writable (directly or through demand paging) and used
    /// by nothing else for the lifetime of the heap.
    #[must_use]
    pub unsafe fn new(region: KernelHeapRegion) -> Self {
        let mut allocator = FreeListAllocator::new();
        unsafe { allocator.init(region.start, region.size) };
        log::info!(
            "Kernel heap at {:#010x}..{:#010x} ({} KiB)",
            region.start,
            region.end(),
            region.size / 1024
        );
        Self {
            allocator: SpinLock::new(allocator),
            region,
        }
    }

    /// # Errors
    /// [`MemoryError::OutOfMemory`] with [`Pool::KernelHeap`] if no block fits.
    pub fn allocate(&self, size: usize, align: usize) -> Result<NonNull<u8>, MemoryError> {
        self.allocator
            .with_lock(|heap| HeapManager::allocate(heap, size, align))
            .ok_or(MemoryError::OutOfMemory {
                pool: Pool::KernelHeap,
                requested: u32::try_from(size).unwrap_or(u32::MAX),
            })
    }

    /// # Safety
    /// `ptr` must come from [`allocate`](Self::allocate) on this heap.
    pub unsafe fn free(&self, ptr: NonNull<u8>) {
        debug_assert!(self.contains(ptr.as_ptr()));
        self.allocator
            .with_lock(|heap| unsafe { HeapManager::free(heap, ptr) });
    }

    /// # Errors
    /// [`MemoryError::OutOfMemory`] with [`Pool::KernelHeap`] if no block fits;
    /// `ptr` is left as it was.
    ///
    /// # Safety
    /// `ptr` must come from [`allocate`](Self::allocate) on this heap.
    pub unsafe fn reallocate(&self, ptr: NonNull<u8>, size: usize, align: usize) -> Result<NonNull<u8>, MemoryError> {
        debug_assert!(self.contains(ptr.as_ptr()));
        self.allocator
            .with_lock(|heap| unsafe { HeapManager::reallocate(heap, ptr, size, align) })
            .ok_or(MemoryError::OutOfMemory {
                pool: Pool::KernelHeap,
                requested: u32::try_from(size).unwrap_or(u32::MAX),
            })
    }

    #[must_use]
    pub fn free_bytes(&self) -> usize {
        self.allocator.with_lock(|heap| HeapManager::free_bytes(heap))
    }

    /// `true` if `ptr` lies inside the heap window.
    #[must_use]
    pub fn contains(&self, ptr: *const u8) -> bool {
        (self.region.start..self.region.end()).contains(&ptr.addr())
    }

    #[must_use]
    pub const fn region(&self) -> KernelHeapRegion {
        self.region
    }
}

/// First-fit heap over a virtual range with out-of-band bookkeeping.
///
/// Free and used blocks are kept in address-ordered maps (`start → length`);
/// neighbors are merged on free. The range itself is never touched, so pages
/// are only faulted in when the owner writes to them.
#[derive(Debug)]
pub struct RangeHeap {
    start: u32,
    end: u32,
    free: BTreeMap<u32, u32>,
    used: BTreeMap<u32, u32>,
}

impl RangeHeap {
    /// Manage `[start, end)`.
    #[must_use]
    pub fn new(start: u32, end: u32) -> Self {
        let start = start.next_multiple_of(RANGE_GRANULE);
        let end = end - end % RANGE_GRANULE;
        let mut free = BTreeMap::new();
        if end > start {
            free.insert(start, end - start);
        }
        Self {
            start,
            end,
            free,
            used: BTreeMap::new(),
        }
    }

    /// Bounds `[start, end)` of the managed range.
    #[must_use]
    pub const fn bounds(&self) -> (u32, u32) {
        (self.start, self.end)
    }

    /// Number of live allocations.
    #[must_use]
    pub fn allocations(&self) -> usize {
        self.used.len()
    }

    fn insert_free(&mut self, mut start: u32, mut len: u32) {
        if let Some((&prev, &prev_len)) = self.free.range(..start).next_back()
            && prev + prev_len == start
        {
            self.free.remove(&prev);
            start = prev;
            len += prev_len;
        }
        if let Some(next_len) = self.free.remove(&(start + len)) {
            len += next_len;
        }
        self.free.insert(start, len);
    }
}

impl HeapManager for RangeHeap {
    fn allocate(&mut self, size: usize, align: usize) -> Option<NonNull<u8>> {
        let size = u32::try_from(size.max(1)).ok()?.checked_next_multiple_of(RANGE_GRANULE)?;
        let align = u32::try_from(align).ok()?.max(RANGE_GRANULE);

        let (block, block_len, addr) = self.free.iter().find_map(|(&block, &len)| {
            let addr = block.checked_next_multiple_of(align)?;
            let end = addr.checked_add(size)?;
            (end <= block + len).then_some((block, len, addr))
        })?;

        self.free.remove(&block);
        if addr > block {
            self.free.insert(block, addr - block);
        }
        let tail = block + block_len - (addr + size);
        if tail > 0 {
            self.free.insert(addr + size, tail);
        }
        self.used.insert(addr, size);
        NonNull::new(ptr::without_provenance_mut(addr as usize))
    }

    unsafe fn free(&mut self, ptr: NonNull<u8>) {
        let Ok(addr) = u32::try_from(ptr.as_ptr().addr()) else {
            log::warn!("Ignoring free of foreign pointer {ptr:p}");
            return;
        };
        match self.used.remove(&addr) {
            Some(len) => self.insert_free(addr, len),
            None => log::warn!("Ignoring free of unallocated user block {addr:#010x}"),
        }
    }

    unsafe fn reallocate(&mut self, ptr: NonNull<u8>, size: usize, align: usize) -> Option<NonNull<u8>> {
        let addr = u32::try_from(ptr.as_ptr().addr()).ok()?;
        let Some(&len) = self.used.get(&addr) else {
            log::warn!("Ignoring resize of unallocated user block {addr:#010x}");
            return None;
        };
        let new_len = u32::try_from(size.max(1)).ok()?.checked_next_multiple_of(RANGE_GRANULE)?;
        let align = u32::try_from(align).ok()?.max(RANGE_GRANULE);

        if addr.is_multiple_of(align) {
            if new_len <= len {
                if new_len < len {
                    self.insert_free(addr + new_len, len - new_len);
                    self.used.insert(addr, new_len);
                }
                return Some(ptr);
            }
            let next = addr + len;
            if let Some(&next_len) = self.free.get(&next)
                && len + next_len >= new_len
            {
                self.free.remove(&next);
                let tail = len + next_len - new_len;
                if tail > 0 {
                    self.free.insert(addr + new_len, tail);
                }
                self.used.insert(addr, new_len);
                return Some(ptr);
            }
        }

        let new = self.allocate(size, align as usize)?;
        // The range is mapped in the active space; its pages fault in on access.
        let src = ptr::with_exposed_provenance::<u8>(addr as usize);
        let dst = ptr::with_exposed_provenance_mut::<u8>(new.as_ptr().addr());
        unsafe {
            ptr::copy_nonoverlapping(src, dst, len.min(new_len) as usize);
            self.free(ptr);
        }
        Some(new)
    }

    fn free_bytes(&self) -> usize {
        self.free.values().map(|&len| len as usize).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::boxed::Box;
    use alloc::vec;
    use kernel_info::boot::{BootOptions, KernelCodeRange};
    use kernel_info::memory::PAGE_SIZE;
    use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};

    fn addr(p: NonNull<u8>) -> u32 {
        u32::try_from(p.as_ptr().addr()).unwrap()
    }

    #[test]
    fn range_heap_first_fit_and_alignment() {
        let mut heap = RangeHeap::new(0x4000_0000, 0x4001_0000);
        let a = heap.allocate(10, 1).unwrap();
        let b = heap.allocate(100, 4096).unwrap();
        assert_eq!(addr(a), 0x4000_0000);
        assert_eq!(addr(b), 0x4000_1000);
        assert_eq!(heap.allocations(), 2);
        assert_eq!(heap.free_bytes(), 0x1_0000 - 16 - 112);
    }

    #[test]
    fn range_heap_merges_neighbors_on_free() {
        let mut heap = RangeHeap::new(0x4000_0000, 0x4000_1000);
        let blocks: vec::Vec<_> = (0..4).map(|_| heap.allocate(0x400, 16).unwrap()).collect();
        assert!(heap.allocate(1, 1).is_none());

        for i in [1, 3, 0, 2] {
            unsafe { heap.free(blocks[i]) };
        }
        assert_eq!(heap.free_bytes(), 0x1000);
        assert_eq!(heap.free.len(), 1);
        assert_eq!(addr(heap.allocate(0x1000, 16).unwrap()), 0x4000_0000);
    }

    #[test]
    fn range_heap_ignores_unknown_pointers() {
        let mut heap = RangeHeap::new(0x4000_0000, 0x4000_1000);
        let before = heap.free_bytes();
        unsafe { heap.free(NonNull::new(ptr::without_provenance_mut(0x4000_0040)).unwrap()) };
        assert_eq!(heap.free_bytes(), before);
    }

    #[test]
    fn range_heap_resizes_in_place() {
        let mut heap = RangeHeap::new(0x4000_0000, 0x4000_1000);
        let a = heap.allocate(0x100, 16).unwrap();
        let b = heap.allocate(0x100, 16).unwrap();
        unsafe { heap.free(b) };

        // Grows into the freed neighbor.
        let grown = unsafe { heap.reallocate(a, 0x180, 16) }.unwrap();
        assert_eq!(grown, a);
        assert_eq!(heap.used[&addr(a)], 0x180);
        assert_eq!(heap.free_bytes(), 0x1000 - 0x180);

        // Shrinking hands the tail back.
        let shrunk = unsafe { heap.reallocate(a, 0x20, 16) }.unwrap();
        assert_eq!(shrunk, a);
        assert_eq!(heap.free_bytes(), 0x1000 - 0x20);
        assert_eq!(addr(heap.allocate(0x40, 16).unwrap()), 0x4000_0020);

        assert!(unsafe { heap.reallocate(a, 0x2000, 16) }.is_none());
        assert_eq!(heap.used[&addr(a)], 0x20);
    }

    #[test]
    fn kernel_heap_resize_keeps_contents() {
        let buffer = Box::leak(vec![0u64; 1024].into_boxed_slice());
        let region = KernelHeapRegion::new(buffer.as_mut_ptr() as usize, 8192);
        let heap = unsafe { KernelHeap::new(region) };

        let p = heap.allocate(64, 8).unwrap();
        let _fence = heap.allocate(16, 8).unwrap();
        unsafe { p.as_ptr().copy_from_nonoverlapping(b"kernel heap block".as_ptr(), 17) };

        let grown = unsafe { heap.reallocate(p, 1024, 64) }.unwrap();
        assert!(heap.contains(grown.as_ptr()));
        assert_eq!(grown.as_ptr().addr() % 64, 0);
        assert_eq!(unsafe { core::slice::from_raw_parts(grown.as_ptr(), 17) }, b"kernel heap block");

        let shrunk = unsafe { heap.reallocate(grown, 6, 8) }.unwrap();
        assert_eq!(unsafe { core::slice::from_raw_parts(shrunk.as_ptr(), 6) }, b"kernel");

        assert!(matches!(
            unsafe { heap.reallocate(shrunk, 1 << 20, 8) },
            Err(MemoryError::OutOfMemory {
                pool: Pool::KernelHeap,
                ..
            })
        ));
    }

    #[test]
    fn kernel_heap_reports_exhaustion() {
        let buffer = Box::leak(vec![0u64; 512].into_boxed_slice());
        let region = KernelHeapRegion::new(buffer.as_mut_ptr() as usize, 4096);
        let heap = unsafe { KernelHeap::new(region) };

        let p = heap.allocate(128, 8).unwrap();
        assert!(heap.contains(p.as_ptr()));
        assert_eq!(
            heap.allocate(8192, 8),
            Err(MemoryError::OutOfMemory {
                pool: Pool::KernelHeap,
                requested: 8192
            })
        );
        let before = heap.free_bytes();
        unsafe { heap.free(p) };
        assert!(heap.free_bytes() > before);
    }

    #[test]
    fn default_region_follows_reserved_memory() {
        let boot = BootInfo {
            memory_map: &[],
            reserved_memory_end: PhysicalAddress::new(0x0030_0800),
            paging_area_phys: PhysicalAddress::new(0x0040_0000),
            kernel_code: KernelCodeRange {
                start: VirtualAddress::new(KERNEL_START),
                end: VirtualAddress::new(KERNEL_START + 0x1000),
            },
            options: BootOptions::default(),
        };
        let region = KernelHeapRegion::kernel_default(&boot).unwrap();
        assert_eq!(region.start, 0xC030_1000);
        assert_eq!(region.end(), KERNEL_HEAP_END as usize);
        assert_eq!(region.start % PAGE_SIZE as usize, 0);
    }
}
