// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

/// Close has been requested; no new work, handlers or children are accepted.
const PREPARING_FOR_CLOSING: u64 = 1 << 0;
/// In-flight dispatches have drained; close handlers are being invoked.
const CLOSING: u64 = 1 << 1;
/// The close sequence has completed.
const CLOSED: u64 = 1 << 2;

const FLAGS_MASK: u64 = 0xFF;
const BLOCK_CLOSE_OFFSET: u32 = 8;
const ONE_BLOCK_CLOSE: u64 = 1 << BLOCK_CLOSE_OFFSET;

/// The context's packed state word: lifecycle flags in the low byte and a
/// block-close counter above them, maintained with a single atomic.
///
/// The block-close counter counts in-flight dispatches. Close may only
/// proceed past its drain point once the counter has dropped to the number
/// of reservations held by the closing thread itself, which is what lets a
/// context close itself from inside its own work.
pub(crate) struct ContextState(AtomicU64);

impl ContextState {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Takes a close reservation. Fails (undoing the reservation) once close
    /// has been requested.
    #[must_use]
    pub fn block_close(&self) -> bool {
        let old = self.0.fetch_add(ONE_BLOCK_CLOSE, Ordering::Relaxed);
        if old & PREPARING_FOR_CLOSING != 0 {
            self.unblock_close();
            return false;
        }

        true
    }

    pub fn unblock_close(&self) {
        let old = self.0.fetch_sub(ONE_BLOCK_CLOSE, Ordering::AcqRel);
        debug_assert!(old & !FLAGS_MASK != 0, "unbalanced unblock_close");
    }

    /// Requests close. Returns whether this call was the first to do so.
    pub fn start_close(&self) -> bool {
        let old = self.0.fetch_or(PREPARING_FOR_CLOSING, Ordering::Relaxed);
        old & PREPARING_FOR_CLOSING == 0
    }

    pub fn is_open(&self) -> bool {
        self.0.load(Ordering::Relaxed) & PREPARING_FOR_CLOSING == 0
    }

    pub fn is_closed(&self) -> bool {
        self.0.load(Ordering::Relaxed) & CLOSED != 0
    }

    pub fn set_closing_flag(&self) {
        let old = self.0.fetch_or(CLOSING, Ordering::AcqRel);
        debug_assert!(old & CLOSING == 0, "closing flag set twice");
    }

    pub fn set_closed_flag(&self) {
        let old = self.0.fetch_or(CLOSED, Ordering::AcqRel);
        debug_assert!(old & CLOSED == 0, "closed flag set twice");
    }

    pub fn block_close_count(&self) -> u64 {
        self.0.load(Ordering::Acquire) >> BLOCK_CLOSE_OFFSET
    }

    /// Spins (yielding) until the close sequence has completed.
    pub fn wait_closed(&self) {
        while self.0.load(Ordering::Acquire) & CLOSED == 0 {
            thread::yield_now();
        }
    }
}
