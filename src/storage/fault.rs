//! Fault handler: the single place every "storage state is inconsistent"
//! check converges on.
//!
//! The PIN failure counter doubles as a fault counter: a detected fault
//! charges one PIN attempt before the device halts, so a string of fault
//! injection attempts eats into the same budget as wrong PIN guesses. A
//! fault raised while fault handling is already in progress means the
//! attacker is glitching the handler itself; that wipes immediately with no
//! further bookkeeping.

use std::hint::black_box;

use rand::rngs::OsRng;
use rand::RngCore;

use super::norcow::NorcowBackend;
use super::pin_log;

#[derive(Default)]
pub struct FaultHandler {
    in_progress: bool,
}

impl FaultHandler {
    pub const fn new() -> Self {
        Self { in_progress: false }
    }

    /// Never returns. Charges a PIN attempt, verifies it was charged, wipes,
    /// and aborts the process.
    pub fn report<B: NorcowBackend>(&mut self, backend: &mut B) -> ! {
        if self.in_progress {
            log::error!("storage: fault while a fault was already being handled, wiping");
            backend.wipe();
            std::process::abort();
        }
        self.in_progress = true;
        log::error!("storage: fault detected, charging a PIN attempt and wiping");

        // These calls take `self` (already marked in_progress) and `backend`.
        // If they hit their own inconsistency they call back into `report`,
        // which now takes the reentrant branch above and aborts directly.
        let before = pin_log::pin_get_fails(self, backend);
        pin_log::pin_fails_increase(self, backend);
        let after = pin_log::pin_get_fails(self, backend);
        if after != before + 1 {
            backend.wipe();
        }

        std::process::abort();
    }
}

/// Burns a random 0-255 iteration delay. An auxiliary counter counts down in
/// lockstep with the one counting up; if an instruction-skipping glitch
/// shortens one but not the other, the two disagree at the end. `black_box`
/// keeps the compiler from proving the redundant counter away.
pub fn wait_random<B: NorcowBackend>(handler: &mut FaultHandler, backend: &mut B) {
    let wait = (OsRng.next_u32() & 0xFF) as i64;
    let mut i: i64 = 0;
    let mut j: i64 = wait;
    while i < wait {
        if black_box(i + j) != wait {
            handler.report(backend);
        }
        i = black_box(i + 1);
        j = black_box(j - 1);
    }
    if i != wait {
        handler.report(backend);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::model::PIN_LOGS_KEY;
    use crate::storage::norcow::MemoryNorcow;

    #[test]
    fn wait_random_completes_without_faulting() {
        let mut handler = FaultHandler::new();
        let mut backend = MemoryNorcow::new();
        for _ in 0..50 {
            wait_random(&mut handler, &mut backend);
        }
        assert!(backend.get(PIN_LOGS_KEY).is_none());
    }
}
