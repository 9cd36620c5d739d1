//! The real paging hardware: control registers and `invlpg`.

#[cfg(target_arch = "x86")]
use crate::PagingHardware;
#[cfg(target_arch = "x86")]
use kernel_memory_addresses::{PhysicalPage, Size4K, VirtualPage};
#[cfg(target_arch = "x86")]
use kernel_registers::cr0::Cr0;
#[cfg(target_arch = "x86")]
use kernel_registers::cr3::Cr3;
#[cfg(target_arch = "x86")]
use kernel_registers::{LoadRegisterUnsafe, StoreRegisterUnsafe};

/// Direct access to the CPU's paging state.
///
/// Zero-sized; every method compiles to a single privileged instruction or a
/// register read-modify-write.
#[derive(Debug)]
pub struct X86Paging {
    _private: (),
}

impl X86Paging {
    /// # Safety
    /// Only valid at CPL0 with paging enabled.
    #[must_use]
    pub const unsafe fn new() -> Self {
        Self { _private: () }
    }
}

#[cfg(target_arch = "x86")]
impl PagingHardware for X86Paging {
    #[inline]
    unsafe fn load_directory(&self, root: PhysicalPage<Size4K>) {
        unsafe { Cr3::from_directory(root).store_unsafe() }
    }

    #[inline]
    fn invalidate_page(&self, page: VirtualPage<Size4K>) {
        let va = page.base().as_u32();
        // SAFETY: constructing `X86Paging` asserted CPL0.
        unsafe {
            core::arch::asm!("invlpg [{}]", in(reg) va, options(nostack, preserves_flags));
        }
    }

    #[inline]
    unsafe fn enable_write_protect(&self) {
        unsafe {
            Cr0::load_unsafe().with_wp_write_protect(true).store_unsafe();
        }
    }
}
