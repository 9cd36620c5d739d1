//! # Two-Level Page Tables
//!
//! A 32-bit virtual address is split into three fields:
//!
//! ```text
//! | 31‒22 | 21‒12 | 11‒0   |
//! |  PD   |  PT   | Offset |
//! ```

pub mod pd;
pub mod pt;

use crate::page_table::pd::L2Index;
use crate::page_table::pt::L1Index;
use kernel_memory_addresses::VirtualAddress;

/// Directory and table index of `va`.
#[inline]
#[must_use]
pub const fn split_indices(va: VirtualAddress) -> (L2Index, L1Index) {
    (L2Index::from(va), L1Index::from(va))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indices_of_kernel_address() {
        let (i2, i1) = split_indices(VirtualAddress::new(0xC040_3123));
        assert_eq!(i2.as_usize(), 769);
        assert_eq!(i1.as_usize(), 3);
    }

    #[test]
    fn indices_of_top_page() {
        let (i2, i1) = split_indices(VirtualAddress::new(0xFFFF_F000));
        assert_eq!(i2.as_usize(), 1023);
        assert_eq!(i1.as_usize(), 1023);
    }
}
