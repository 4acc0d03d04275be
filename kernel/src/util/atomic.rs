//! The compare-exchange primitive userspace locks are built from.
//!
//! Even on a single CPU the operation must be a real atomic instruction:
//! it has to order against the timer interrupt preempting between the
//! compare and the store. Futex `wait` pairs with this: a waiter parks
//! only if the word still holds the expected value.

use core::sync::atomic::{AtomicI32, Ordering};

/// Compare `*dest` with `expected`; if equal, store `desired`. Returns
/// the value `*dest` held before the operation either way, so the caller
/// can tell whether the exchange happened (`result == expected`).
pub fn cmp_xchg(expected: i32, desired: i32, dest: &AtomicI32) -> i32 {
    match dest.compare_exchange(expected, desired, Ordering::SeqCst, Ordering::SeqCst) {
        Ok(prev) => prev,
        Err(prev) => prev,
    }
}
