//! # Page Faults
//!
//! The interrupt layer reads `CR2` and the pushed error code and hands both
//! to [`MemoryCore::handle_page_fault`](crate::manager::MemoryCore::handle_page_fault).
//! The pair is parked in a one-slot [`FaultSlot`] for the duration of the
//! service so a fault raised while another one is being handled is caught.

use bitfield_struct::bitfield;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use kernel_memory_addresses::VirtualAddress;

/// Page-fault error code layout (32-bit x86).
///
/// Each bit describes the condition that caused the page fault.
/// Reference: Intel SDM Vol. 3A, §6.15.1 “Page-Fault Exception (#PF)”.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct PageFaultError {
    /// 0 = non-present page.
    /// 1 = protection violation (page present but access disallowed).
    pub present: bool, // bit 0

    /// 0 = read or execute.
    /// 1 = write access.
    pub write: bool, // bit 1

    /// 0 = supervisor (CPL 0–2).
    /// 1 = user mode (CPL 3).
    pub user: bool, // bit 2

    /// 1 = caused by reserved bit set in a paging structure.
    pub reserved_bit: bool, // bit 3

    /// 1 = instruction fetch (execute access).
    pub instruction_fetch: bool, // bit 4

    /// 1 = protection-key violation (if CR4.PKE=1).
    pub protection_key: bool, // bit 5

    /// 1 = shadow stack access (if CET-SS enabled).
    pub shadow_stack: bool, // bit 6

    #[bits(25)]
    __: u32, // reserved / ignored bits
}

impl PageFaultError {
    /// `true` if the page was present and the access itself was disallowed.
    #[inline]
    #[must_use]
    pub const fn is_protection_violation(&self) -> bool {
        self.present()
    }

    #[must_use]
    pub const fn explain(&self) -> &'static str {
        if !self.present() {
            "Non-present page (page not mapped or swapped out)"
        } else if self.instruction_fetch() {
            if self.user() {
                "User-mode instruction fetch on protected page (likely NX or SMEP)"
            } else {
                "Kernel instruction fetch on protected page"
            }
        } else if self.write() {
            "Write access to protected page"
        } else {
            "Read access to protected page"
        }
    }
}

/// What the CPU reported for one page fault.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct FaultContext {
    /// Faulting linear address (`CR2`).
    pub address: VirtualAddress,
    pub error: PageFaultError,
}

/// Holds at most one [`FaultContext`] between trap entry and service.
///
/// The trap is not reentrant, so a second [`record`](Self::record) before
/// [`take`](Self::take) means the handler itself faulted.
pub struct FaultSlot {
    occupied: AtomicBool,
    address: AtomicU32,
    error: AtomicU32,
}

impl Default for FaultSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl FaultSlot {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            occupied: AtomicBool::new(false),
            address: AtomicU32::new(0),
            error: AtomicU32::new(0),
        }
    }

    /// Park `context` until it is taken.
    ///
    /// # Errors
    /// Hands back the context already in the slot if it was not consumed yet.
    pub fn record(&self, context: FaultContext) -> Result<(), FaultContext> {
        if self.occupied.swap(true, Ordering::AcqRel) {
            return Err(self.peek());
        }
        self.address.store(context.address.as_u32(), Ordering::Relaxed);
        self.error.store(context.error.into_bits(), Ordering::Release);
        Ok(())
    }

    /// Consume the parked context, leaving the slot empty.
    pub fn take(&self) -> Option<FaultContext> {
        if !self.occupied.load(Ordering::Acquire) {
            return None;
        }
        let context = self.peek();
        self.occupied.store(false, Ordering::Release);
        Some(context)
    }

    #[must_use]
    pub fn is_occupied(&self) -> bool {
        self.occupied.load(Ordering::Acquire)
    }

    fn peek(&self) -> FaultContext {
        FaultContext {
            address: VirtualAddress::new(self.address.load(Ordering::Relaxed)),
            error: PageFaultError::from_bits(self.error.load(Ordering::Acquire)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(address: u32, error: u32) -> FaultContext {
        FaultContext {
            address: VirtualAddress::new(address),
            error: PageFaultError::from_bits(error),
        }
    }

    #[test]
    fn error_code_bits_decode() {
        let err = PageFaultError::from_bits(0b1_0101);
        assert!(err.is_protection_violation());
        assert!(!err.write());
        assert!(err.user());
        assert!(err.instruction_fetch());
        assert_eq!(
            err.explain(),
            "User-mode instruction fetch on protected page (likely NX or SMEP)"
        );
        assert_eq!(
            PageFaultError::from_bits(0b010).explain(),
            "Non-present page (page not mapped or swapped out)"
        );
    }

    #[test]
    fn slot_is_consumed_exactly_once() {
        let slot = FaultSlot::new();
        assert_eq!(slot.take(), None);
        slot.record(context(0x4000_1234, 0b10)).unwrap();
        assert!(slot.is_occupied());
        assert_eq!(slot.take(), Some(context(0x4000_1234, 0b10)));
        assert_eq!(slot.take(), None);
    }

    #[test]
    fn second_record_reports_the_pending_fault() {
        let slot = FaultSlot::new();
        slot.record(context(0x1000, 0)).unwrap();
        assert_eq!(slot.record(context(0x2000, 1)), Err(context(0x1000, 0)));
        assert_eq!(slot.take(), Some(context(0x1000, 0)));
    }
}
