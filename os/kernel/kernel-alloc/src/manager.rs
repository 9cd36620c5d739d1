//! # Memory Manager
//!
//! Sequences bootstrap and owns every piece of memory state: the frame
//! allocator, the paging area, the IO window, the address-space registry and
//! the active directory.
//!
//! ## Phases
//!
//! ```text
//!  Uninitialized ──Bootstrap::start──► Bootstrapping ──into_ready──► Ready
//!                  usable memory        (faults served)   kernel heap
//!                  frame allocator                        first address space
//!                  paging area                            constructors
//!                  base directory
//!                  bootstrap space (CR3)
//!                  IO window
//! ```
//!
//! Both phases dereference to [`MemoryCore`], which maps, unmaps and
//! services page faults. Address-space management and heap routing only
//! exist on the [`MemoryManager`] returned by [`Bootstrap::into_ready`], so
//! calling them too early does not compile.
//!
//! ## Locking
//!
//! `paging` guards frames, paging area and the active root; `registry` guards
//! the address spaces; `io` guards the IO window. Locks are taken in the order
//! `registry` → `paging` and `io` → `paging`. Nothing allocates from a heap
//! while `paging` is held, so a heap page fault never finds it taken by its
//! own thread. The fault path only ever tries the lock.

use crate::address_space::{AddressSpaceId, VirtualAddressSpace};
use crate::arena::BootstrapArena;
use crate::error::{MemoryError, Pool};
use crate::fault::{FaultContext, FaultSlot, PageFaultError};
use crate::frame_alloc::{FrameAllocator, compute_usable_memory};
use crate::heap::{HeapManager, KernelHeap, RangeHeap};
use crate::io_memory::IoMemoryManager;
use crate::paging_area::{PagingAreaManager, TablePool};
use alloc::collections::BTreeMap;
use core::ops::Deref;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, Ordering};
use kernel_info::boot::{BootInfo, BootOptions, KernelCodeRange};
use kernel_info::memory::{
    KERNEL_HEAP_END, KERNEL_START, PAGE_SIZE, PAGING_AREA_SIZE, PAGING_AREA_START, UNMAPPED_RUN_LIMIT,
};
use kernel_memory_addresses::{PhysicalAddress, Size4K, VirtualAddress, VirtualPage};
use kernel_sync::SpinLock;
use kernel_vmem::address_space::RootPage;
use kernel_vmem::page_table::pd::L2Index;
use kernel_vmem::{AddressSpace, Flags, PageEntryBits, PagingHardware, PhysMapper, pages_for};

/// Flags of every IO mapping.
const IO_FLAGS: Flags = Flags::PRESENT.union(Flags::WRITABLE).union(Flags::NO_CACHE);

/// Lifecycle phase of the memory subsystem.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MemoryState {
    /// Before [`Bootstrap::start`].
    Uninitialized,
    /// Between [`Bootstrap::start`] and [`Bootstrap::into_ready`].
    Bootstrapping,
    /// After [`Bootstrap::into_ready`]; every operation is available.
    Ready,
}

/// Heap an allocation is served from.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MemorySpace {
    /// The shared kernel heap.
    Kernel,
    /// The heap of the active address space.
    User,
}

struct PagingState {
    frames: FrameAllocator,
    area: PagingAreaManager,
    active_root: RootPage,
}

/// Mapping and fault handling, available from bootstrap on.
pub struct MemoryCore<M: PhysMapper, H: PagingHardware> {
    mapper: M,
    hardware: H,
    paging: SpinLock<PagingState>,
    io: SpinLock<IoMemoryManager>,
    faults: FaultSlot,
    base_root: RootPage,
    kernel_code: KernelCodeRange,
    options: BootOptions,
    code_protected: AtomicBool,
}

impl<M: PhysMapper, H: PagingHardware> MemoryCore<M, H> {
    #[inline]
    fn space(&self, root: RootPage) -> AddressSpace<'_, M> {
        AddressSpace::from_root(&self.mapper, root)
    }

    /// Entry point of the page-fault trap.
    ///
    /// Not-present faults are resolved by mapping a fresh frame at the
    /// faulting page; on `Ok` the faulting instruction can be restarted.
    ///
    /// # Errors
    /// Every error is fatal:
    /// - [`MemoryError::NullPointer`] for accesses to the first page.
    /// - [`MemoryError::IllegalPageAccess`] for protection violations.
    /// - [`MemoryError::IllegalState`] for a fault raised while a fault is being
    ///   serviced or while the paging state is locked.
    /// - [`MemoryError::OutOfMemory`] if no frame or page table is left.
    pub fn handle_page_fault(&self, address: VirtualAddress, error: PageFaultError) -> Result<(), MemoryError> {
        let context = FaultContext { address, error };
        if let Err(pending) = self.faults.record(context) {
            log::error!(
                "Page fault at {address} while servicing the fault at {}",
                pending.address
            );
            return Err(MemoryError::IllegalState("page fault inside the page-fault handler"));
        }

        let result = self.service_fault(context);
        let consumed = self.faults.take();
        debug_assert_eq!(consumed, Some(context));

        if let Err(e) = &result {
            log::error!("Unrecoverable page fault: {e}");
        }
        result
    }

    fn service_fault(&self, FaultContext { address, error }: FaultContext) -> Result<(), MemoryError> {
        if address.as_u32() < PAGE_SIZE {
            return Err(MemoryError::NullPointer(address));
        }
        if error.is_protection_violation() {
            return Err(MemoryError::IllegalPageAccess { address, error });
        }
        if address.as_u32() >= PAGING_AREA_START {
            return Err(MemoryError::IllegalState("page fault inside the paging area"));
        }

        let mut paging = self
            .paging
            .try_lock()
            .ok_or(MemoryError::IllegalState("page fault while the paging state is locked"))?;

        let page = address.align_down::<Size4K>();
        if self.space(paging.active_root).entry(page).is_some() {
            // Stale translation; the page was mapped in the meantime.
            self.hardware.invalidate_page(page.page::<Size4K>());
            return Ok(());
        }

        let mut flags = Flags::PRESENT | Flags::WRITABLE;
        if page.as_u32() < KERNEL_START {
            flags |= Flags::USER;
        }
        let pa = self.map_fresh(&mut paging, page, flags)?;
        log::trace!("Demand-paged {page} -> {pa}");
        Ok(())
    }

    fn check_mappable(va: VirtualAddress) -> Result<(), MemoryError> {
        if va.as_u32() >= PAGING_AREA_START {
            return Err(MemoryError::IllegalState("the paging area is not mapped by hand"));
        }
        Ok(())
    }

    /// Map a newly allocated frame at `page` in the active directory.
    fn map_fresh(&self, paging: &mut PagingState, page: VirtualAddress, flags: Flags) -> Result<PhysicalAddress, MemoryError> {
        let PagingState {
            frames,
            area,
            active_root,
        } = paging;
        let frame = frames.alloc_page()?;
        let mut tables = TablePool::new(area, &self.mapper);
        match self
            .space(*active_root)
            .map_one(&mut tables, page, frame.base(), (flags | Flags::PRESENT).into())
        {
            Ok(()) => {
                // The page-table entry owns the frame from here on.
                let (pa, _) = frame.into_raw();
                self.hardware.invalidate_page(page.page::<Size4K>());
                Ok(pa)
            }
            Err(e) => {
                frames.free(frame);
                Err(e.into())
            }
        }
    }

    /// Map `page → pa` in the active directory. `unmanaged` frames are never
    /// returned to the frame allocator.
    fn map_fixed(
        &self,
        paging: &mut PagingState,
        page: VirtualAddress,
        pa: PhysicalAddress,
        flags: Flags,
        unmanaged: bool,
    ) -> Result<(), MemoryError> {
        let PagingState {
            area, active_root, ..
        } = paging;
        let mut tables = TablePool::new(area, &self.mapper);
        let leaf = PageEntryBits::from(flags | Flags::PRESENT).with_unmanaged(unmanaged);
        self.space(*active_root).map_one(&mut tables, page, pa, leaf)?;
        self.hardware.invalidate_page(page.page::<Size4K>());
        Ok(())
    }

    /// Remove the mapping of `va` and release the frame if it owns one.
    fn unmap_page(&self, paging: &mut PagingState, va: VirtualAddress) -> Result<Option<PhysicalAddress>, MemoryError> {
        let Some(entry) = self.space(paging.active_root).unmap_one(va) else {
            return Ok(None);
        };
        self.hardware.invalidate_page(va.page::<Size4K>());
        let Some((page, _)) = entry.page_4k() else {
            return Ok(None);
        };
        if entry.owns_frame() {
            paging.frames.free_page(page.base())?;
        }
        Ok(Some(page.base()))
    }

    /// Back the page containing `va` with a fresh frame and return the frame.
    ///
    /// # Errors
    /// - [`MemoryError::AlreadyMapped`] if the page is present.
    /// - [`MemoryError::OutOfMemory`] if no frame or page table is left.
    /// - [`MemoryError::IllegalState`] for addresses in the paging area.
    pub fn map(&self, va: VirtualAddress, flags: Flags) -> Result<PhysicalAddress, MemoryError> {
        let page = va.align_down::<Size4K>();
        Self::check_mappable(page)?;
        let mut paging = self.paging.lock();
        let pa = self.map_fresh(&mut paging, page, flags)?;
        log::debug!("Mapped {page} -> {pa} ({flags:?})");
        Ok(pa)
    }

    /// Map the page containing `va` to the frame containing `pa`.
    ///
    /// The frame stays owned by the caller; unmapping it does not free it.
    ///
    /// # Errors
    /// As [`map`](Self::map).
    pub fn map_physical(&self, va: VirtualAddress, pa: PhysicalAddress, flags: Flags) -> Result<(), MemoryError> {
        let page = va.align_down::<Size4K>();
        Self::check_mappable(page)?;
        let mut paging = self.paging.lock();
        self.map_fixed(&mut paging, page, pa.align_down::<Size4K>(), flags, true)?;
        log::debug!("Mapped {page} -> {} ({flags:?})", pa.align_down::<Size4K>());
        Ok(())
    }

    /// Back every page overlapping `[start, end)` with a fresh frame.
    ///
    /// Pages that are already mapped are kept as they are.
    ///
    /// # Errors
    /// As [`map`](Self::map), apart from [`MemoryError::AlreadyMapped`].
    pub fn map_range(&self, start: VirtualAddress, end: VirtualAddress, flags: Flags) -> Result<(), MemoryError> {
        let first = start.as_u32() / PAGE_SIZE;
        let last = end.as_u32().div_ceil(PAGE_SIZE);
        let mut paging = self.paging.lock();
        for number in first..last {
            let page = VirtualPage::<Size4K>::from_number(number).base();
            Self::check_mappable(page)?;
            if self.space(paging.active_root).entry(page).is_some() {
                continue;
            }
            self.map_fresh(&mut paging, page, flags)?;
        }
        log::debug!("Mapped range {start}..{end} ({flags:?})");
        Ok(())
    }

    /// Unmap the page containing `va`, releasing its frame if the
    /// allocator owns it.
    ///
    /// Returns the frame that was mapped, `None` if the page was not present.
    ///
    /// # Errors
    /// - [`MemoryError::IllegalState`] for addresses in the paging area.
    /// - [`MemoryError::Frame`] if the frame was already free.
    pub fn unmap(&self, va: VirtualAddress) -> Result<Option<PhysicalAddress>, MemoryError> {
        Self::check_mappable(va)?;
        let mut paging = self.paging.lock();
        let result = self.unmap_page(&mut paging, va)?;
        match result {
            Some(pa) => log::debug!("Unmapped {} (was {pa})", va.align_down::<Size4K>()),
            None => log::debug!("Unmap of {va}: page was not present"),
        }
        Ok(result)
    }

    /// Unmap every page lying entirely inside `[start, end]`.
    ///
    /// `end` is the last byte of the range, so the page holding it is
    /// unmapped when `end` is its final byte. Partial pages at either end are
    /// left alone since they may hold unrelated data. The walk stops early after
    /// [`UNMAPPED_RUN_LIMIT`] consecutive pages that were not mapped.
    /// Returns the result for the last page visited.
    ///
    /// # Errors
    /// As [`unmap`](Self::unmap).
    pub fn unmap_range(&self, start: VirtualAddress, end: VirtualAddress) -> Result<Option<PhysicalAddress>, MemoryError> {
        let first = start.as_u32().div_ceil(PAGE_SIZE);
        let last_byte = end.as_u32();
        let last = last_byte / PAGE_SIZE + u32::from(last_byte % PAGE_SIZE == PAGE_SIZE - 1);
        let mut paging = self.paging.lock();
        let mut result = None;
        let mut unmapped_run = 0;
        for number in first..last {
            let page = VirtualPage::<Size4K>::from_number(number).base();
            Self::check_mappable(page)?;
            result = self.unmap_page(&mut paging, page)?;
            if result.is_some() {
                unmapped_run = 0;
                continue;
            }
            log::warn!("{page} in {start}..={end} was not mapped");
            unmapped_run += 1;
            if unmapped_run == UNMAPPED_RUN_LIMIT {
                log::warn!("Range unmap stopped after {UNMAPPED_RUN_LIMIT} unmapped pages at {page}");
                break;
            }
        }
        Ok(result)
    }

    /// Translate `va` through the active directory.
    #[must_use]
    pub fn physical_address(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        let paging = self.paging.lock();
        self.space(paging.active_root).query(va)
    }

    /// Number of free physical frames.
    #[must_use]
    pub fn free_frames(&self) -> u32 {
        self.paging.with_lock(|paging| paging.frames.free_frames())
    }

    /// Number of free pages in the paging area.
    #[must_use]
    pub fn free_table_pages(&self) -> u32 {
        self.paging.with_lock(|paging| paging.area.free_pages())
    }

    /// Number of free pages in the IO window.
    #[must_use]
    pub fn free_io_pages(&self) -> u32 {
        self.io.with_lock(|io| io.free_pages())
    }

    /// The kernel's base directory, whose kernel half every space shares.
    #[must_use]
    pub const fn base_directory(&self) -> RootPage {
        self.base_root
    }

    /// The directory currently loaded.
    #[must_use]
    pub fn active_directory(&self) -> RootPage {
        self.paging.with_lock(|paging| paging.active_root)
    }
}

/// Build the kernel's base directory: every kernel page table, the paging
/// area window and the kernel image at [`KERNEL_START`].
fn build_base_directory<M: PhysMapper>(
    mapper: &M,
    area: &mut PagingAreaManager,
    boot: &BootInfo<'_>,
) -> Result<RootPage, MemoryError> {
    let mut tables = TablePool::new(area, mapper);
    let base = AddressSpace::create(mapper, &mut tables)?;

    // All kernel tables exist up front, so copying the directory's kernel half
    // shares every later kernel mapping as well.
    for i2 in L2Index::kernel() {
        base.ensure_table(&mut tables, i2)?;
    }

    let fixed = PageEntryBits::from(Flags::PRESENT | Flags::WRITABLE).with_unmanaged(true);
    for i in 0..PAGING_AREA_SIZE / PAGE_SIZE {
        base.map_one(
            &mut tables,
            VirtualAddress::new(PAGING_AREA_START + i * PAGE_SIZE),
            boot.paging_area_phys + i * PAGE_SIZE,
            fixed,
        )?;
    }
    for i in 0..pages_for(boot.reserved_memory_end.as_u32()) {
        base.map_one(
            &mut tables,
            VirtualAddress::new(KERNEL_START + i * PAGE_SIZE),
            PhysicalAddress::new(i * PAGE_SIZE),
            fixed,
        )?;
    }

    log::info!(
        "Base directory {} built: {} kernel tables, image {} KiB",
        base.root_page(),
        L2Index::kernel().count(),
        boot.reserved_memory_end.as_u32() / 1024
    );
    Ok(base.root_page())
}

/// The memory subsystem while bootstrapping.
pub struct Bootstrap<M: PhysMapper, H: PagingHardware> {
    core: MemoryCore<M, H>,
    bootstrap_space: VirtualAddressSpace,
    arena: BootstrapArena,
}

impl<M: PhysMapper, H: PagingHardware> Bootstrap<M, H> {
    /// Take over physical memory and paging.
    ///
    /// On return the bootstrap address space (the base directory) is loaded
    /// and page faults are served.
    ///
    /// # Errors
    /// - [`MemoryError::InsufficientMemory`] if usable memory is below the floor.
    ///   Nothing is mapped in that case.
    /// - [`MemoryError::IllegalState`] for an inconsistent `boot`.
    /// - [`MemoryError::OutOfMemory`] if the arena or the paging area is too small.
    pub fn start(mapper: M, hardware: H, boot: &BootInfo<'_>, mut arena: BootstrapArena) -> Result<Self, MemoryError> {
        log::info!("Bootstrapping memory management");
        let usable = compute_usable_memory(boot.memory_map)?;

        if boot.reserved_memory_end.as_u32() > KERNEL_HEAP_END - KERNEL_START {
            return Err(MemoryError::IllegalState("reserved memory reaches past the kernel heap"));
        }
        if !boot.paging_area_phys.is_aligned::<Size4K>() {
            return Err(MemoryError::IllegalState("paging area block is not page aligned"));
        }
        let paging_end = boot
            .paging_area_phys
            .checked_add(PAGING_AREA_SIZE)
            .ok_or(MemoryError::IllegalState("paging area block ends past 4 GiB"))?;

        let reserved = [
            (PhysicalAddress::new(0), boot.reserved_memory_end),
            (boot.paging_area_phys, paging_end),
        ];
        let frames = FrameAllocator::new(usable, &reserved, &mut arena)?;
        let mut area = PagingAreaManager::new(boot.paging_area_phys);
        let base_root = build_base_directory(&mapper, &mut area, boot)?;

        let bootstrap_space = VirtualAddressSpace::bootstrap(base_root);
        // SAFETY: the base directory maps the kernel image and the paging area,
        // which is everything the kernel runs on at this point.
        unsafe { AddressSpace::from_root(&mapper, base_root).activate(&hardware) };
        log::info!("Bootstrap address space active, directory {base_root}");

        let io = IoMemoryManager::new(&mut arena)?;

        let core = MemoryCore {
            mapper,
            hardware,
            paging: SpinLock::new(PagingState {
                frames,
                area,
                active_root: base_root,
            }),
            io: SpinLock::new(io),
            faults: FaultSlot::new(),
            base_root,
            kernel_code: boot.kernel_code,
            options: boot.options,
            code_protected: AtomicBool::new(false),
        };
        log::info!("Page-fault handling enabled");

        Ok(Self {
            core,
            bootstrap_space,
            arena,
        })
    }

    #[must_use]
    pub const fn state(&self) -> MemoryState {
        MemoryState::Bootstrapping
    }

    /// Bytes of the bootstrap arena in use.
    #[must_use]
    pub const fn arena_used(&self) -> usize {
        self.arena.used()
    }

    /// Finish bootstrap.
    ///
    /// `heap` must already be serving the global allocator: the registry and
    /// per-space heaps allocate from it. The first real address space is
    /// created and loaded, the bootstrap space is discarded, then
    /// `constructors` runs.
    ///
    /// # Errors
    /// [`MemoryError::OutOfMemory`] if the first address space cannot be created.
    pub fn into_ready<'h>(
        self,
        heap: &'h KernelHeap,
        constructors: impl FnOnce(),
    ) -> Result<MemoryManager<'h, M, H>, MemoryError> {
        let Self {
            core,
            bootstrap_space,
            arena,
        } = self;
        log::info!(
            "Bootstrap arena released: {} of {} bytes used",
            arena.used(),
            arena.capacity()
        );

        let manager = MemoryManager {
            core,
            registry: SpinLock::new(Registry::new()),
            heap,
        };
        let first = manager.create_address_space()?;
        manager.switch_address_space(first)?;
        log::debug!("Discarding bootstrap address space {}", bootstrap_space.id());
        drop(bootstrap_space);

        constructors();
        log::info!("Memory manager ready");
        Ok(manager)
    }
}

impl<M: PhysMapper, H: PagingHardware> Deref for Bootstrap<M, H> {
    type Target = MemoryCore<M, H>;

    fn deref(&self) -> &Self::Target {
        &self.core
    }
}

struct Registry {
    spaces: BTreeMap<AddressSpaceId, VirtualAddressSpace>,
    active: AddressSpaceId,
    next: u32,
}

impl Registry {
    const fn new() -> Self {
        Self {
            spaces: BTreeMap::new(),
            active: AddressSpaceId::BOOTSTRAP,
            next: 1,
        }
    }

    fn next_id(&mut self) -> Result<AddressSpaceId, MemoryError> {
        let id = AddressSpaceId::new(self.next);
        self.next = self
            .next
            .checked_add(1)
            .ok_or(MemoryError::IllegalState("address space ids exhausted"))?;
        Ok(id)
    }

    fn active_heap(&mut self) -> Result<&mut RangeHeap, MemoryError> {
        self.spaces
            .get_mut(&self.active)
            .and_then(VirtualAddressSpace::heap_mut)
            .ok_or(MemoryError::IllegalState("active address space has no heap"))
    }
}

/// The memory subsystem after bootstrap.
pub struct MemoryManager<'h, M: PhysMapper, H: PagingHardware> {
    core: MemoryCore<M, H>,
    registry: SpinLock<Registry>,
    heap: &'h KernelHeap,
}

impl<'h, M: PhysMapper, H: PagingHardware> MemoryManager<'h, M, H> {
    #[must_use]
    pub const fn state(&self) -> MemoryState {
        MemoryState::Ready
    }

    #[must_use]
    pub const fn kernel_heap(&self) -> &'h KernelHeap {
        self.heap
    }

    /// Create an address space sharing the kernel half of the base directory.
    ///
    /// # Errors
    /// [`MemoryError::OutOfMemory`] if the paging area is full.
    pub fn create_address_space(&self) -> Result<AddressSpaceId, MemoryError> {
        let mut registry = self.registry.lock();
        let root = {
            let mut paging = self.paging.lock();
            let mut tables = TablePool::new(&mut paging.area, &self.mapper);
            let space = AddressSpace::create(&self.mapper, &mut tables)?;
            space.share_kernel_entries(&self.space(self.base_root));
            space.root_page()
        };
        let id = registry.next_id()?;
        registry.spaces.insert(id, VirtualAddressSpace::new(id, root));
        log::debug!("Created address space {id} with directory {root}");
        Ok(id)
    }

    /// Load the directory of `id`, initializing the space on first use.
    ///
    /// # Errors
    /// [`MemoryError::NoSuchAddressSpace`] if `id` is not registered.
    pub fn switch_address_space(&self, id: AddressSpaceId) -> Result<(), MemoryError> {
        let mut registry = self.registry.lock();
        let space = registry
            .spaces
            .get_mut(&id)
            .ok_or(MemoryError::NoSuchAddressSpace(id))?;
        space.initialize();
        let root = space.root();
        {
            let mut paging = self.paging.lock();
            // SAFETY: the kernel half is shared, so the running code and stack stay mapped.
            unsafe { self.hardware.load_directory(root) };
            paging.active_root = root;
        }
        registry.active = id;
        log::info!("Switched to address space {id}");
        Ok(())
    }

    /// Unregister `id` and release its page tables and user frames.
    ///
    /// # Errors
    /// - [`MemoryError::IllegalState`] if `id` is the active space; nothing changes.
    /// - [`MemoryError::NoSuchAddressSpace`] if `id` is not registered.
    pub fn remove_address_space(&self, id: AddressSpaceId) -> Result<(), MemoryError> {
        let mut registry = self.registry.lock();
        if registry.active == id {
            log::warn!("Refusing to remove the active address space {id}");
            return Err(MemoryError::IllegalState("cannot remove the active address space"));
        }
        let space = registry
            .spaces
            .remove(&id)
            .ok_or(MemoryError::NoSuchAddressSpace(id))?;

        let mut released = 0u32;
        let mut paging = self.paging.lock();
        let PagingState { frames, area, .. } = &mut *paging;
        let mut tables = TablePool::new(area, &self.mapper);
        self.space(space.root()).release(&mut tables, |va, entry| {
            let Some((page, _)) = entry.page_4k() else {
                return;
            };
            if !entry.owns_frame() {
                return;
            }
            match frames.free_page(page.base()) {
                Ok(()) => released += 1,
                Err(e) => log::error!("Leaking frame behind {va}: {e}"),
            }
        });
        drop(paging);

        // The heap bookkeeping goes back to the kernel heap outside the paging lock.
        drop(space);
        log::debug!("Removed address space {id}, released {released} frames");
        Ok(())
    }

    /// The space whose directory is loaded.
    #[must_use]
    pub fn active_address_space(&self) -> AddressSpaceId {
        self.registry.with_lock(|registry| registry.active)
    }

    /// `true` if `id` is registered.
    #[must_use]
    pub fn has_address_space(&self, id: AddressSpaceId) -> bool {
        self.registry.with_lock(|registry| registry.spaces.contains_key(&id))
    }

    /// Number of registered address spaces.
    #[must_use]
    pub fn address_space_count(&self) -> usize {
        self.registry.with_lock(|registry| registry.spaces.len())
    }

    /// Allocate from the kernel heap or the active space's heap.
    ///
    /// # Errors
    /// [`MemoryError::OutOfMemory`] naming the exhausted heap.
    pub fn allocate(&self, space: MemorySpace, size: usize, align: usize) -> Result<NonNull<u8>, MemoryError> {
        match space {
            MemorySpace::Kernel => self.heap.allocate(size, align),
            MemorySpace::User => {
                let mut registry = self.registry.lock();
                registry
                    .active_heap()?
                    .allocate(size, align)
                    .ok_or(MemoryError::OutOfMemory {
                        pool: Pool::UserHeap,
                        requested: u32::try_from(size).unwrap_or(u32::MAX),
                    })
            }
        }
    }

    /// Return a block obtained from [`allocate`](Self::allocate) with the same `space`.
    ///
    /// # Errors
    /// [`MemoryError::IllegalState`] if the active space has no heap.
    ///
    /// # Safety
    /// `ptr` must come from `allocate(space, ..)` and must not be used afterwards.
    pub unsafe fn free(&self, space: MemorySpace, ptr: NonNull<u8>) -> Result<(), MemoryError> {
        match space {
            MemorySpace::Kernel => unsafe { self.heap.free(ptr) },
            MemorySpace::User => {
                let mut registry = self.registry.lock();
                unsafe { registry.active_heap()?.free(ptr) };
            }
        }
        Ok(())
    }

    /// Resize a block obtained from [`allocate`](Self::allocate) with the same
    /// `space`, keeping its contents up to the smaller of both sizes.
    ///
    /// # Errors
    /// - [`MemoryError::OutOfMemory`] naming the exhausted heap; `ptr` stays valid.
    /// - [`MemoryError::IllegalState`] if the active space has no heap.
    ///
    /// # Safety
    /// `ptr` must come from `allocate(space, ..)`. After success only the
    /// returned pointer may be used.
    pub unsafe fn reallocate(
        &self,
        space: MemorySpace,
        ptr: NonNull<u8>,
        size: usize,
        align: usize,
    ) -> Result<NonNull<u8>, MemoryError> {
        match space {
            MemorySpace::Kernel => unsafe { self.heap.reallocate(ptr, size, align) },
            MemorySpace::User => {
                let mut registry = self.registry.lock();
                unsafe { registry.active_heap()?.reallocate(ptr, size, align) }.ok_or(MemoryError::OutOfMemory {
                    pool: Pool::UserHeap,
                    requested: u32::try_from(size).unwrap_or(u32::MAX),
                })
            }
        }
    }

    /// Map `size` bytes of device memory at `pa` uncached into the IO window.
    ///
    /// Returns the virtual address of `pa`; an unaligned `pa` keeps its
    /// offset within the first page.
    ///
    /// # Errors
    /// [`MemoryError::OutOfMemory`] if the IO window or the paging area is exhausted.
    pub fn map_io(&self, pa: PhysicalAddress, size: u32) -> Result<VirtualAddress, MemoryError> {
        let offset = pa.offset::<Size4K>();
        let span = size.checked_add(offset).ok_or(MemoryError::OutOfMemory {
            pool: Pool::IoRegion,
            requested: size,
        })?;
        let base = pa.align_down::<Size4K>();

        let mut io = self.io.lock();
        let va = io.alloc(span)?;
        let mut paging = self.paging.lock();
        for i in 0..pages_for(span).max(1) {
            let page = va + i * PAGE_SIZE;
            let target = base
                .checked_add(i * PAGE_SIZE)
                .ok_or(MemoryError::IllegalState("IO range ends past 4 GiB"))?;
            self.unmap_page(&mut paging, page)?;
            self.map_fixed(&mut paging, page, target, IO_FLAGS, true)?;
        }
        log::debug!("Mapped IO {pa} (+{size:#x}) at {}", va + offset);
        Ok(va + offset)
    }

    /// Map `size` bytes of freshly allocated, physically contiguous memory
    /// uncached into the IO window.
    ///
    /// # Errors
    /// [`MemoryError::OutOfMemory`] if frames, the IO window or the paging area are exhausted.
    pub fn map_io_anonymous(&self, size: u32) -> Result<VirtualAddress, MemoryError> {
        let mut io = self.io.lock();
        let mut paging = self.paging.lock();
        let frame = paging.frames.alloc(size)?;
        let va = match io.alloc(size) {
            Ok(va) => va,
            Err(e) => {
                paging.frames.free(frame);
                return Err(e);
            }
        };

        // Page-table entries own the frames from here on; `free_io` releases them.
        let (base, count) = frame.into_raw();
        for i in 0..count {
            let page = va + i * PAGE_SIZE;
            self.unmap_page(&mut paging, page)?;
            self.map_fixed(&mut paging, page, base + i * PAGE_SIZE, IO_FLAGS, false)?;
        }
        log::debug!("Mapped {count} anonymous IO pages at {va} -> {base}");
        Ok(va)
    }

    /// Unmap and release the IO range starting in the page of `va`.
    ///
    /// # Errors
    /// [`MemoryError::IllegalState`] if `va` does not start an IO range.
    pub fn free_io(&self, va: VirtualAddress) -> Result<(), MemoryError> {
        let start = va.align_down::<Size4K>();
        let mut io = self.io.lock();
        let pages = io.free(start)?;
        let mut paging = self.paging.lock();
        for i in 0..pages {
            self.unmap_page(&mut paging, start + i * PAGE_SIZE)?;
        }
        log::debug!("Released {pages} IO pages at {start}");
        Ok(())
    }

    /// Make the kernel code read-only in the shared kernel tables and turn
    /// on `CR0.WP`.
    ///
    /// Runs once; skipped entirely while a debugger is attached. Returns the
    /// number of pages protected.
    pub fn write_protect_kernel_code(&self) -> u32 {
        if self.options.debugger_attached {
            log::info!("Debugger attached, kernel code stays writable");
            return 0;
        }
        if self.code_protected.swap(true, Ordering::AcqRel) {
            log::warn!("Kernel code is already write-protected");
            return 0;
        }

        let _paging = self.paging.lock();
        let base = self.space(self.base_root);
        let first = self.kernel_code.start.as_u32() / PAGE_SIZE;
        let last = self.kernel_code.end.as_u32().div_ceil(PAGE_SIZE);
        let mut protected = 0;
        for number in first..last {
            let page = VirtualPage::<Size4K>::from_number(number);
            if base.update_entry(page.base(), |bits| bits.with_writable(false)) {
                self.hardware.invalidate_page(page);
                protected += 1;
            }
        }
        // SAFETY: only the kernel code pages were made read-only.
        unsafe { self.hardware.enable_write_protect() };
        log::info!(
            "Write-protected {protected} kernel code pages {}..{}",
            self.kernel_code.start,
            self.kernel_code.end
        );
        protected
    }
}

impl<M: PhysMapper, H: PagingHardware> Deref for MemoryManager<'_, M, H> {
    type Target = MemoryCore<M, H>;

    fn deref(&self) -> &Self::Target {
        &self.core
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::boxed::Box;
    use alloc::vec;
    use kernel_info::boot::{MemoryKind, MemoryMapEntry};
    use kernel_info::memory::BOOTSTRAP_ARENA_SIZE;
    use kernel_vmem::page_table::pd::PageDirectory;
    use kernel_vmem::sim::{SimulatedHardware, SimulatedRam};

    static MAP: [MemoryMapEntry; 2] = [
        MemoryMapEntry::new(0, 0x9_F000, MemoryKind::Available),
        MemoryMapEntry::new(0x10_0000, 0x1F0_0000, MemoryKind::Available),
    ];

    fn boot_info() -> BootInfo<'static> {
        BootInfo {
            memory_map: &MAP,
            reserved_memory_end: PhysicalAddress::new(0x0020_0000),
            paging_area_phys: PhysicalAddress::new(0x0040_0000),
            kernel_code: KernelCodeRange {
                start: VirtualAddress::new(0xC010_0000),
                end: VirtualAddress::new(0xC010_3000),
            },
            options: BootOptions::default(),
        }
    }

    fn arena() -> BootstrapArena {
        BootstrapArena::new(Box::leak(vec![0u8; BOOTSTRAP_ARENA_SIZE].into_boxed_slice()))
    }

    fn not_present() -> PageFaultError {
        PageFaultError::new().with_write(true)
    }

    #[test]
    fn fault_while_servicing_a_fault_is_fatal() {
        let (ram, hw) = (SimulatedRam::new(), SimulatedHardware::new());
        let boot = Bootstrap::start(&ram, &hw, &boot_info(), arena()).unwrap();
        let pending = FaultContext {
            address: VirtualAddress::new(0x4000_0000),
            error: not_present(),
        };
        boot.faults.record(pending).unwrap();

        assert_eq!(
            boot.handle_page_fault(VirtualAddress::new(0x4000_1000), not_present()),
            Err(MemoryError::IllegalState("page fault inside the page-fault handler"))
        );
        assert_eq!(boot.faults.take(), Some(pending));
        assert_eq!(boot.physical_address(VirtualAddress::new(0x4000_1000)), None);
    }

    #[test]
    fn fault_while_paging_is_locked_is_fatal() {
        let (ram, hw) = (SimulatedRam::new(), SimulatedHardware::new());
        let boot = Bootstrap::start(&ram, &hw, &boot_info(), arena()).unwrap();
        let guard = boot.paging.lock();
        assert_eq!(
            boot.handle_page_fault(VirtualAddress::new(0xC100_0000), not_present()),
            Err(MemoryError::IllegalState("page fault while the paging state is locked"))
        );
        assert!(boot.paging.is_locked());
        drop(guard);
        assert!(!boot.faults.is_occupied());
        boot.handle_page_fault(VirtualAddress::new(0xC100_0000), not_present())
            .unwrap();
    }

    #[test]
    fn paging_area_is_off_limits() {
        let (ram, hw) = (SimulatedRam::new(), SimulatedHardware::new());
        let boot = Bootstrap::start(&ram, &hw, &boot_info(), arena()).unwrap();
        let window = VirtualAddress::new(PAGING_AREA_START);
        assert_eq!(
            boot.physical_address(window),
            Some(PhysicalAddress::new(0x0040_0000))
        );
        assert!(matches!(boot.unmap(window), Err(MemoryError::IllegalState(_))));
        assert!(matches!(
            boot.map(window + PAGE_SIZE, Flags::WRITABLE),
            Err(MemoryError::IllegalState(_))
        ));
        assert_eq!(
            boot.physical_address(window),
            Some(PhysicalAddress::new(0x0040_0000))
        );
    }

    #[test]
    fn base_directory_holds_every_kernel_table() {
        let (ram, hw) = (SimulatedRam::new(), SimulatedHardware::new());
        let boot = Bootstrap::start(&ram, &hw, &boot_info(), arena()).unwrap();
        let pd: &mut PageDirectory = unsafe { ram.phys_to_mut(boot.base_directory().base()) };
        assert!(L2Index::kernel().all(|i2| pd.get(i2).is_present()));
        assert!(L2Index::user().all(|i2| !pd.get(i2).is_present()));
        // Base directory plus one table per kernel directory entry.
        assert_eq!(boot.free_table_pages(), 1024 - 1 - 256);
        assert_eq!(hw.active_directory(), Some(boot.base_directory()));
        assert_eq!(boot.state(), MemoryState::Bootstrapping);
    }
}
