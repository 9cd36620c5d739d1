use bitfield_struct::bitfield;

/// Architectural model of CR0 in 32-bit protected mode.
///
/// Only the bits the memory subsystem reasons about are named; the rest are
/// carried through unchanged so a load-modify-store keeps them intact.
#[bitfield(u32)]
pub struct Cr0 {
    /// Bit 0: Protection Enable (PE).
    pub pe_protection_enable: bool,

    /// Bits 1–15: FPU and task-switch control, untouched here.
    #[bits(15)]
    pub fpu_control: u16,

    /// Bit 16: Write Protect (WP).
    ///
    /// When set, supervisor code must respect read-only pages; when clear,
    /// supervisor may write them.
    pub wp_write_protect: bool,

    /// Bits 17–28: Alignment mask and reserved bits.
    #[bits(12)]
    pub misc: u16,

    /// Bit 29: Not-Write-Through (NW).
    pub nw_not_write_through: bool,

    /// Bit 30: Cache Disable (CD).
    pub cd_cache_disable: bool,

    /// Bit 31: Paging (PG).
    pub pg_paging: bool,
}

#[cfg(all(feature = "asm", target_arch = "x86"))]
impl crate::LoadRegisterUnsafe for Cr0 {
    unsafe fn load_unsafe() -> Self {
        let mut cr0: u32;
        unsafe {
            core::arch::asm!("mov {}, cr0", out(reg) cr0, options(nomem, nostack, preserves_flags));
        }
        Self::from_bits(cr0)
    }
}

#[cfg(all(feature = "asm", target_arch = "x86"))]
impl crate::StoreRegisterUnsafe for Cr0 {
    unsafe fn store_unsafe(self) {
        let cr0 = self.into_bits();
        unsafe {
            core::arch::asm!("mov cr0, {}", in(reg) cr0, options(nostack, preserves_flags));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_protect_is_bit_16() {
        let cr0 = Cr0::from_bits(0x8000_0011).with_wp_write_protect(true);
        assert_eq!(cr0.into_bits(), 0x8001_0011);
        assert!(cr0.pg_paging());
        assert!(cr0.pe_protection_enable());
    }
}
