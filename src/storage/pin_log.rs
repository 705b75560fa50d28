//! PIN failure log.
//!
//! A 33-word record: one guard key, a 16-word "success log" and a 16-word
//! "entry log". Both logs encode the failure count redundantly as a string
//! of cleared bits (`0*1*`), interleaved bit-for-bit with bits derived from
//! the guard key so that flash corruption or a targeted glitch shows up as
//! an inconsistency between the data bits and the guard bits rather than a
//! silently-wrong count. Every record word can only have bits cleared after
//! it is written (see [`super::norcow::NorcowBackend`]), which is what makes
//! the monotonically-decreasing "number of set bits" encoding meaningful.

use super::fault::FaultHandler;
use super::model::{PIN_LOGS_KEY, PIN_MAX_TRIES};
use super::norcow::NorcowBackend;

const GUARD_KEY_WORDS: usize = 1;
const PIN_LOG_WORDS: usize = 16;
const LOG_WORDS: usize = GUARD_KEY_WORDS + 2 * PIN_LOG_WORDS;
const LOG_BYTES: usize = LOG_WORDS * 4;
const LOW_MASK: u32 = 0x5555_5555;
const GUARD_KEY_MODULUS: u32 = 6311;
const GUARD_KEY_REMAINDER: u32 = 15;

fn check_guard_key(guard_key: u32) -> bool {
    if guard_key % GUARD_KEY_MODULUS != GUARD_KEY_REMAINDER {
        return false;
    }

    // Each byte of (guard_key & 0xAAAAAAAA) must have exactly two bits set.
    let mut count = (guard_key & 0x2222_2222).wrapping_add((guard_key >> 2) & 0x2222_2222);
    count = count.wrapping_add(count >> 4);
    if (count & 0x0e0e_0e0e) != 0x0404_0404 {
        return false;
    }

    // No run of 5 or more zeros or ones.
    let mut zero_runs = !guard_key;
    zero_runs &= zero_runs >> 2;
    zero_runs &= zero_runs >> 1;
    zero_runs &= zero_runs >> 1;

    let mut one_runs = guard_key;
    one_runs &= one_runs >> 2;
    one_runs &= one_runs >> 1;
    one_runs &= one_runs >> 1;

    zero_runs == 0 && one_runs == 0
}

fn random_uniform(bound: u32) -> u32 {
    let limit = u32::MAX - (u32::MAX % bound);
    loop {
        let candidate = u32::from_le_bytes(super::crypto::random_bytes::<4>());
        if candidate < limit {
            return candidate % bound;
        }
    }
}

fn generate_guard_key() -> u32 {
    loop {
        let candidate = random_uniform(u32::MAX / GUARD_KEY_MODULUS + 1)
            .wrapping_mul(GUARD_KEY_MODULUS)
            .wrapping_add(GUARD_KEY_REMAINDER);
        if check_guard_key(candidate) {
            return candidate;
        }
    }
}

fn expand_guard_key<B: NorcowBackend>(handler: &mut FaultHandler, backend: &mut B, guard_key: u32) -> (u32, u32) {
    if !check_guard_key(guard_key) {
        handler.report(backend);
    }
    let guard_mask = ((guard_key & LOW_MASK) << 1) | (!guard_key & LOW_MASK);
    let guard = (((guard_key & LOW_MASK) << 1) & guard_key) | ((!guard_key & LOW_MASK) & (guard_key >> 1));
    (guard_mask, guard)
}

pub(crate) fn hamming_weight(mut value: u32) -> u32 {
    value = value.wrapping_sub((value >> 1) & 0x5555_5555);
    value = (value & 0x3333_3333) + ((value >> 2) & 0x3333_3333);
    value = (value.wrapping_add(value >> 4)) & 0x0F0F_0F0F;
    value = value.wrapping_add(value >> 8);
    value = value.wrapping_add(value >> 16);
    value & 0x3F
}

fn read_logs<B: NorcowBackend>(backend: &B) -> Option<[u32; LOG_WORDS]> {
    let bytes = backend.get(PIN_LOGS_KEY)?;
    if bytes.len() != LOG_BYTES {
        return None;
    }
    let mut words = [0u32; LOG_WORDS];
    for (word, chunk) in words.iter_mut().zip(bytes.chunks_exact(4)) {
        *word = u32::from_le_bytes(chunk.try_into().unwrap());
    }
    Some(words)
}

fn words_to_bytes(words: &[u32; LOG_WORDS]) -> Vec<u8> {
    let mut out = Vec::with_capacity(LOG_BYTES);
    for word in words {
        out.extend_from_slice(&word.to_le_bytes());
    }
    out
}

/// Creates a fresh PIN log with a freshly generated guard key and `fails`
/// recorded failures. Only called on first initialization and after the
/// log is fully compacted by [`pin_fails_reset`].
pub fn pin_logs_init<B: NorcowBackend>(handler: &mut FaultHandler, backend: &mut B, fails: u32) -> bool {
    if fails >= PIN_MAX_TRIES {
        return false;
    }

    let guard_key = generate_guard_key();
    super::fault::wait_random(handler, backend);
    let (guard_mask, guard) = expand_guard_key(handler, backend, guard_key);

    let unused = guard | !guard_mask;
    let mut words = [unused; LOG_WORDS];
    words[0] = guard_key;
    words[GUARD_KEY_WORDS + PIN_LOG_WORDS] = ((0xFFFF_FFFFu32 >> (2 * fails)) & !guard_mask) | guard;

    backend.set(PIN_LOGS_KEY, &words_to_bytes(&words))
}

/// Compacts the log: copies every settled entry-log word into the
/// corresponding success-log word, then reinitializes from scratch once the
/// whole log has been consumed. Called after a successful unlock.
pub fn pin_fails_reset<B: NorcowBackend>(handler: &mut FaultHandler, backend: &mut B) -> bool {
    let Some(logs) = read_logs(backend) else {
        return false;
    };
    super::fault::wait_random(handler, backend);
    let (guard_mask, guard) = expand_guard_key(handler, backend, logs[0]);

    let unused = guard | !guard_mask;
    let success_log = &logs[GUARD_KEY_WORDS..GUARD_KEY_WORDS + PIN_LOG_WORDS];
    let entry_log = &logs[GUARD_KEY_WORDS + PIN_LOG_WORDS..GUARD_KEY_WORDS + 2 * PIN_LOG_WORDS];

    for i in 0..PIN_LOG_WORDS {
        if entry_log[i] == unused {
            return true;
        }
        if success_log[i] != guard && !backend.update_word(PIN_LOGS_KEY, i + GUARD_KEY_WORDS, entry_log[i]) {
            return false;
        }
    }
    pin_logs_init(handler, backend, 0)
}

/// Marks one more PIN attempt as failed. Diverges into the fault handler if
/// the log is already in an inconsistent state or exhausted.
pub fn pin_fails_increase<B: NorcowBackend>(handler: &mut FaultHandler, backend: &mut B) -> bool {
    super::fault::wait_random(handler, backend);
    let Some(logs) = read_logs(backend) else {
        handler.report(backend);
    };
    super::fault::wait_random(handler, backend);
    let (guard_mask, guard) = expand_guard_key(handler, backend, logs[0]);

    let entry_log = &logs[GUARD_KEY_WORDS + PIN_LOG_WORDS..GUARD_KEY_WORDS + 2 * PIN_LOG_WORDS];
    for i in 0..PIN_LOG_WORDS {
        super::fault::wait_random(handler, backend);
        if (entry_log[i] & guard_mask) != guard {
            handler.report(backend);
        }
        if entry_log[i] != guard {
            super::fault::wait_random(handler, backend);
            let mut word = entry_log[i] & !guard_mask;
            word = ((word >> 1) | word) & LOW_MASK;
            word = (word >> 2) | (word >> 1);

            super::fault::wait_random(handler, backend);
            if !backend.update_word(PIN_LOGS_KEY, i + GUARD_KEY_WORDS + PIN_LOG_WORDS, (word & !guard_mask) | guard) {
                handler.report(backend);
            }
            return true;
        }
    }
    handler.report(backend)
}

/// Reads the current number of consecutive failed PIN attempts. Diverges
/// into the fault handler on any structural inconsistency.
pub fn pin_get_fails<B: NorcowBackend>(handler: &mut FaultHandler, backend: &mut B) -> u32 {
    super::fault::wait_random(handler, backend);
    let Some(logs) = read_logs(backend) else {
        handler.report(backend);
    };
    super::fault::wait_random(handler, backend);
    let (guard_mask, guard) = expand_guard_key(handler, backend, logs[0]);
    let unused = guard | !guard_mask;

    let success_log = &logs[GUARD_KEY_WORDS..GUARD_KEY_WORDS + PIN_LOG_WORDS];
    let entry_log = &logs[GUARD_KEY_WORDS + PIN_LOG_WORDS..GUARD_KEY_WORDS + 2 * PIN_LOG_WORDS];

    let mut current: Option<usize> = None;
    for i in 0..PIN_LOG_WORDS {
        if (entry_log[i] & guard_mask) != guard
            || (success_log[i] & guard_mask) != guard
            || (entry_log[i] & success_log[i]) != entry_log[i]
        {
            handler.report(backend);
        }
        match current {
            None => {
                if entry_log[i] != guard {
                    current = Some(i);
                }
            }
            Some(_) => {
                if entry_log[i] != unused {
                    handler.report(backend);
                }
            }
        }
    }

    let Some(mut current) = current else {
        handler.report(backend);
    };

    super::fault::wait_random(handler, backend);
    let mut word = entry_log[current] & !guard_mask;
    word = ((word >> 1) | word) & LOW_MASK;
    word |= word << 1;
    // Must have the form 0*1*.
    if (word & word.wrapping_add(1)) != 0 {
        handler.report(backend);
    }

    if current == 0 {
        current += 1;
    }

    super::fault::wait_random(handler, backend);
    hamming_weight(success_log[current - 1] ^ entry_log[current - 1]) + hamming_weight(success_log[current] ^ entry_log[current])
}
