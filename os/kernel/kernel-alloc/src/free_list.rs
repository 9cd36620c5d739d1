//! # Free-List Allocator
//!
//! First-fit, split-and-coalesce allocator over one contiguous region. It
//! backs the kernel heap.
//!
//! ## Layout
//!
//! A **free** block starts with a [`ListNode`]:
//!
//! ```text
//! +----------------------+-------------------------+
//! | ListNode (header)    |      free bytes         |
//! +----------------------+-------------------------+
//! ^ block start          ^ block start + size_of::<ListNode>()
//! ```
//!
//! An **allocated** block carries an [`AllocHeader`] right before the
//! payload, recording the block bounds so `free` needs only the pointer:
//!
//! ```text
//! +-------------+-------------+-------------------------+
//! | (slack)     | AllocHeader |  payload (aligned)      |
//! +-------------+-------------+-------------------------+
//! ^ block start               ^ returned pointer        ^ block end
//! ```
//!
//! Nothing is zeroed on initialization, so untouched heap pages stay
//! unmapped until first use.

use core::ptr::{self, null_mut};

/// Header stored at the beginning of every **free** block.
///
/// Free blocks are kept **sorted by address** to enable coalescing.
#[repr(C)]
struct ListNode {
    /// Size of the whole block, header included.
    size: usize,
    /// Pointer to the next free block (or null).
    next: *mut ListNode,
}

/// Bounds of an allocated block, stored right before its payload.
#[repr(C)]
struct AllocHeader {
    start: usize,
    end: usize,
}

const NODE_ALIGN: usize = align_of::<ListNode>();
const MIN_BLOCK: usize = size_of::<ListNode>();
const HEADER: usize = size_of::<AllocHeader>();

const _: () = {
    assert!(HEADER.is_multiple_of(NODE_ALIGN));
    assert!(align_of::<AllocHeader>() <= NODE_ALIGN);
};

/// Align `addr` upwards to `align` (must be a power of two).
#[inline]
const fn align_up(addr: usize, align: usize) -> usize {
    (addr + (align - 1)) & !(align - 1)
}

/// # Invariants
/// - All free blocks are non-overlapping and lie within the heap range.
/// - Each free block is at least `MIN_BLOCK` bytes and `NODE_ALIGN`-aligned.
/// - `head` is a sentinel; the first real block is at `head.next`.
pub struct FreeListAllocator {
    /// Sentinel node (does not represent memory).
    head: ListNode,
    initialized: bool,
}

// Safety: The allocator is always used under SpinLock; raw pointers are only accessed while locked.
unsafe impl Send for FreeListAllocator {}

impl Default for FreeListAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl FreeListAllocator {
    /// Construct an empty allocator (heap not yet initialized).
    #[must_use]
    pub const fn new() -> Self {
        Self {
            head: ListNode {
                size: 0,
                next: null_mut(),
            },
            initialized: false,
        }
    }

    #[must_use]
    pub const fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Manage the region `[heap_start, heap_start + heap_size)`.
    ///
    /// # Safety
    /// - The memory range must be **writable** (or fault in on demand) and
    ///   **exclusive** to the allocator.
    /// - Must be called **at most once** before any allocations on this instance.
    pub unsafe fn init(&mut self, heap_start: usize, heap_size: usize) {
        let start = align_up(heap_start, NODE_ALIGN);
        let end = heap_start.saturating_add(heap_size) & !(NODE_ALIGN - 1);
        self.initialized = true;
        if end > start {
            unsafe { self.add_free_region(start, end - start) };
        }
    }

    /// Insert a free region `[addr, addr + size)`, merging it with adjacent
    /// free blocks.
    ///
    /// # Safety
    /// - `[addr, addr + size)` must be unused memory inside the heap.
    /// - `addr` must be aligned for `ListNode`.
    unsafe fn add_free_region(&mut self, addr: usize, size: usize) {
        if size < MIN_BLOCK {
            return;
        }
        let mut prev = &raw mut self.head;
        let mut current = unsafe { (*prev).next };
        while !current.is_null() && (current as usize) < addr {
            prev = current;
            current = unsafe { (*current).next };
        }
        let new = addr as *mut ListNode;
        unsafe {
            new.write(ListNode {
                size,
                next: current,
            });
            (*prev).next = new;
            self.coalesce(prev);
        }
    }

    /// Merge the block after `prev_ptr` with its successor and with `prev_ptr`.
    ///
    /// # Safety
    /// - The list invariants must hold (sorted, non-overlapping).
    unsafe fn coalesce(&mut self, prev_ptr: *mut ListNode) {
        let curr = unsafe { (*prev_ptr).next };
        if curr.is_null() {
            return;
        }
        let next = unsafe { (*curr).next };
        if !next.is_null() && (curr as usize) + unsafe { (*curr).size } == next as usize {
            unsafe {
                (*curr).size += (*next).size;
                (*curr).next = (*next).next;
            }
        }
        // The sentinel head does not represent memory.
        if !ptr::eq(prev_ptr, &raw const self.head)
            && (prev_ptr as usize) + unsafe { (*prev_ptr).size } == curr as usize
        {
            unsafe {
                (*prev_ptr).size += (*curr).size;
                (*prev_ptr).next = (*curr).next;
            }
        }
    }

    /// Carve `size` bytes aligned to `align` out of the first block that fits.
    ///
    /// Returns the payload pointer or null when no block is large enough.
    ///
    /// # Safety
    /// - Must only be called while holding the allocator’s lock.
    /// - `align` must be a power of two.
    pub unsafe fn allocate(&mut self, size: usize, align: usize) -> *mut u8 {
        let size = align_up(size.max(1), NODE_ALIGN);
        let align = align.max(NODE_ALIGN);
        let mut prev = &raw mut self.head;
        let mut current = unsafe { (*prev).next };
        while !current.is_null() {
            let block_start = current as usize;
            let block_end = block_start + unsafe { (*current).size };
            let payload = align_up(block_start + HEADER, align);
            if let Some(payload_end) = payload.checked_add(size)
                && payload_end <= block_end
            {
                let header = payload - HEADER;
                unsafe {
                    (*prev).next = (*current).next;
                }

                let mut alloc_start = block_start;
                if header - block_start >= MIN_BLOCK {
                    unsafe { self.add_free_region(block_start, header - block_start) };
                    alloc_start = header;
                }
                let mut alloc_end = block_end;
                if block_end - payload_end >= MIN_BLOCK {
                    unsafe { self.add_free_region(payload_end, block_end - payload_end) };
                    alloc_end = payload_end;
                }

                unsafe {
                    (header as *mut AllocHeader).write(AllocHeader {
                        start: alloc_start,
                        end: alloc_end,
                    });
                }
                return payload as *mut u8;
            }
            prev = current;
            current = unsafe { (*current).next };
        }
        null_mut()
    }

    /// Return the block behind `ptr` to the free list.
    ///
    /// # Safety
    /// - `ptr` must have been returned by [`allocate`](Self::allocate) on this
    ///   instance and not freed since.
    /// - Must only be called while holding the allocator’s lock.
    pub unsafe fn deallocate(&mut self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        let header = unsafe { ptr.sub(HEADER).cast::<AllocHeader>().read() };
        unsafe { self.add_free_region(header.start, header.end - header.start) };
    }

    /// Resize the block behind `ptr` to `size` bytes aligned to `align`.
    ///
    /// The block stays in place if it is already large enough and suitably
    /// aligned. Otherwise a new block is allocated, the old contents are
    /// copied over and the old block is freed. Returns null and leaves the
    /// old block untouched if no block fits; a null `ptr` allocates.
    ///
    /// # Safety
    /// - `ptr` must be null or have been returned by [`allocate`](Self::allocate)
    ///   on this instance and not freed since.
    /// - Must only be called while holding the allocator’s lock.
    /// - `align` must be a power of two.
    pub unsafe fn reallocate(&mut self, ptr: *mut u8, size: usize, align: usize) -> *mut u8 {
        if ptr.is_null() {
            return unsafe { self.allocate(size, align) };
        }
        let header = unsafe { ptr.sub(HEADER).cast::<AllocHeader>().read() };
        let capacity = header.end - ptr as usize;
        if size <= capacity && (ptr as usize).is_multiple_of(align.max(NODE_ALIGN)) {
            return ptr;
        }
        let new = unsafe { self.allocate(size, align) };
        if new.is_null() {
            return new;
        }
        unsafe {
            ptr::copy_nonoverlapping(ptr, new, capacity.min(size));
            self.deallocate(ptr);
        }
        new
    }

    /// Total bytes held in free blocks, headers included.
    #[must_use]
    pub fn free_bytes(&self) -> usize {
        let mut total = 0;
        let mut current = self.head.next;
        while !current.is_null() {
            // SAFETY: list invariants; `&self` excludes concurrent mutation.
            unsafe {
                total += (*current).size;
                current = (*current).next;
            }
        }
        total
    }
}
