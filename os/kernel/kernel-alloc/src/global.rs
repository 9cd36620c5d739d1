//! # Kernel Global Allocator
//!
//! Routes `alloc`/`Box`/`Vec` to the [`KernelHeap`] once it exists. The
//! kernel declares
//!
//! ```rust,ignore
//! #[global_allocator]
//! static GLOBAL_ALLOCATOR: GlobalHeap = GlobalHeap::new();
//! ```
//!
//! and installs the heap during bootstrap with [`GlobalHeap::install`].
//! Until then every allocation fails with a null pointer.

use crate::error::MemoryError;
use crate::heap::{KernelHeap, KernelHeapRegion};
use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{self, NonNull};
use kernel_sync::SyncOnceCell;

pub struct GlobalHeap {
    heap: SyncOnceCell<KernelHeap>,
}

impl Default for GlobalHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl GlobalHeap {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            heap: SyncOnceCell::new(),
        }
    }

    /// Create the kernel heap over `region` and start serving allocations.
    ///
    /// # Errors
    /// [`MemoryError::IllegalState`] if a heap was installed before.
    ///
    /// # Safety
    /// See [`KernelHeap::new`].
    pub unsafe fn install(&self, region: KernelHeapRegion) -> Result<&KernelHeap, MemoryError> {
        const TWICE: MemoryError = MemoryError::IllegalState("kernel heap is already installed");
        if self.heap.get().is_some() {
            return Err(TWICE);
        }
        let heap = unsafe { KernelHeap::new(region) };
        self.heap.set(heap).map_err(|_| TWICE)?;
        self.heap.get().ok_or(TWICE)
    }

    /// The installed heap, if any.
    #[inline]
    pub fn heap(&self) -> Option<&KernelHeap> {
        self.heap.get()
    }
}

unsafe impl GlobalAlloc for GlobalHeap {
    /// Allocate a block of at least `layout.size()` bytes with `layout.align()`.
    ///
    /// # Safety
    /// The `GlobalAlloc` contract applies. Caller must handle a null return (OOM).
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.heap()
            .and_then(|heap| heap.allocate(layout.size(), layout.align()).ok())
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    /// Deallocate a block previously returned by `alloc`/`alloc_zeroed`.
    ///
    /// # Safety
    /// The `GlobalAlloc` contract applies. `ptr` must come from this allocator.
    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        if let (Some(heap), Some(ptr)) = (self.heap(), NonNull::new(ptr)) {
            unsafe { heap.free(ptr) };
        }
    }

    /// Resize in place when the block allows it, moving it otherwise.
    ///
    /// # Safety
    /// The `GlobalAlloc` contract applies.
    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let Some(old) = NonNull::new(ptr) else {
            return ptr::null_mut();
        };
        self.heap()
            .and_then(|heap| unsafe { heap.reallocate(old, new_size, layout.align()) }.ok())
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::boxed::Box;
    use alloc::vec;

    fn region(bytes: usize) -> KernelHeapRegion {
        let buffer = Box::leak(vec![0u64; bytes / 8].into_boxed_slice());
        KernelHeapRegion::new(buffer.as_mut_ptr() as usize, bytes)
    }

    #[test]
    fn allocations_fail_before_install() {
        let global = GlobalHeap::new();
        let p = unsafe { global.alloc(Layout::from_size_align(16, 8).unwrap()) };
        assert!(p.is_null());
    }

    #[test]
    fn installed_heap_serves_layouts() {
        let global = GlobalHeap::new();
        let heap = unsafe { global.install(region(8192)) }.unwrap();
        let before = heap.free_bytes();

        let layout = Layout::from_size_align(100, 32).unwrap();
        let p = unsafe { global.alloc_zeroed(layout) };
        assert!(!p.is_null());
        assert_eq!(p.addr() % 32, 0);
        assert!(unsafe { core::slice::from_raw_parts(p, 100) }.iter().all(|b| *b == 0));

        unsafe { global.dealloc(p, layout) };
        assert_eq!(heap.free_bytes(), before);
    }

    #[test]
    fn realloc_keeps_contents() {
        let global = GlobalHeap::new();
        let heap = unsafe { global.install(region(8192)) }.unwrap();
        let before = heap.free_bytes();

        let layout = Layout::from_size_align(8, 8).unwrap();
        let p = unsafe { global.alloc(layout) };
        unsafe { p.copy_from_nonoverlapping([1u8, 2, 3, 4, 5, 6, 7, 8].as_ptr(), 8) };
        let grown = unsafe { global.realloc(p, layout, 256) };
        assert!(!grown.is_null());
        assert_eq!(unsafe { core::slice::from_raw_parts(grown, 8) }, [1, 2, 3, 4, 5, 6, 7, 8]);

        unsafe { global.dealloc(grown, Layout::from_size_align(256, 8).unwrap()) };
        assert_eq!(heap.free_bytes(), before);
    }

    #[test]
    fn second_install_is_refused() {
        let global = GlobalHeap::new();
        unsafe { global.install(region(4096)) }.unwrap();
        assert_eq!(
            unsafe { global.install(region(4096)) }.err(),
            Some(MemoryError::IllegalState("kernel heap is already installed"))
        );
    }
}
