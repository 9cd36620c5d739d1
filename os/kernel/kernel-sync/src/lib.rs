//! # Kernel synchronization primitives
//!
//! The memory subsystem runs both in ordinary kernel control flow and inside
//! the page-fault trap. Two primitives cover it:
//!
//! - [`SpinLock`] guards allocator, paging and registry state. The fault path
//!   only ever uses [`SpinLock::try_lock`] so a fault raised while the lock is
//!   held is reported instead of deadlocking.
//! - [`SyncOnceCell`] publishes a value exactly once, e.g. the kernel heap
//!   behind the global allocator.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod spin_lock;
mod sync_once_cell;

pub use spin_lock::{SpinLock, SpinLockGuard};
pub use sync_once_cell::SyncOnceCell;
