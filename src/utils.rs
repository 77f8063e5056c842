#![allow(clippy::cast_possible_wrap)]

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Returns true if `completed` is at or past `seqno`, tolerating 32-bit wraparound.
#[must_use]
pub const fn seqno_passed(completed: u32, seqno: u32) -> bool {
    completed.wrapping_sub(seqno) as i32 >= 0
}

/// Number of `block_size` blocks needed to hold `size` bytes.
#[must_use]
pub const fn blocks_for(size: u64, block_size: u32) -> u64 {
    size.div_ceil(block_size as u64)
}

#[must_use]
pub const fn is_block_aligned(size: u64, block_size: u32) -> bool {
    size % block_size as u64 == 0
}

/// Locks `m`, taking the guard back out of a poisoned lock.
///
/// Every critical section in this crate leaves its state consistent before
/// anything that can panic runs, so a poisoned guard is still usable.
pub fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seqno_wraparound() {
        assert!(seqno_passed(5, 5));
        assert!(seqno_passed(6, 5));
        assert!(!seqno_passed(4, 5));
        assert!(seqno_passed(2, u32::MAX - 1));
        assert!(!seqno_passed(u32::MAX - 1, 2));
    }

    #[test]
    fn block_math() {
        assert_eq!(blocks_for(4096, 4096), 1);
        assert_eq!(blocks_for(4097, 4096), 2);
        assert!(is_block_aligned(8192, 4096));
        assert!(!is_block_aligned(100, 4096));
    }
}
