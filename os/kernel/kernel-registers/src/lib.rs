//! # Typed `x86` (32-bit) Control Registers
//!
//! Only the registers the paging code touches are modeled:
//!
//! - [`Cr0`](cr0::Cr0) for the write-protect bit that makes read-only
//!   kernel pages binding for supervisor code.
//! - [`Cr3`](cr3::Cr3) for the physical base of the active page directory.
//!
//! Loads and stores are compiled only with the `asm` feature on `x86`; the
//! bitfield types themselves are portable so they can be built and tested on
//! the host.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

#[cfg(feature = "cr0")]
pub mod cr0;

#[cfg(feature = "cr3")]
pub mod cr3;

pub trait LoadRegisterUnsafe {
    /// # Safety
    /// The caller must uphold the implementation-specific safety requirements.
    /// Control registers are privileged and require kernel mode (Ring 0).
    unsafe fn load_unsafe() -> Self;
}

pub trait StoreRegisterUnsafe {
    /// # Safety
    /// The caller must uphold the implementation-specific safety requirements.
    /// Control registers are privileged and require kernel mode (Ring 0).
    unsafe fn store_unsafe(self);
}
