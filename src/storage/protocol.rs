//! Top-level orchestration: the single state machine a caller drives through
//! `init` -> `unlock` -> `get`/`set`/`delete` -> `lock`.
//!
//! Mirrors the C original's module-level globals (`initialized`, `unlocked`,
//! `cached_keys`, `authentication_sum`, `hardware_salt`) as fields of
//! [`StorageHandle`] instead, so the crate can host more than one backend
//! (or run more than one in a test) without link-time singletons.

use std::time::Duration;

use zeroize::Zeroize;

use super::auth_tag::{self, AuthSum};
use super::crypto::{random_bytes, secequal, sha256, unwrap_keys, wrap_keys};
use super::entry;
use super::error::{PinOutcome, StorageError, StorageResult};
use super::fault::{self, FaultHandler};
use super::kek::derive_kek;
use super::model::{
    StorageKey, DEK_SIZE, EDEK_PVC_KEY, HARDWARE_SALT_SIZE, KEYS_SIZE, NORCOW_VERSION, PIN_EMPTY, PIN_MAX_TRIES,
    PIN_NOT_SET_KEY, PVC_SIZE, RANDOM_SALT_SIZE, SAK_SIZE, VERSION_KEY,
};
use super::norcow::NorcowBackend;
use super::pin_log;
use super::upgrade;

/// `(remaining_seconds, progress_permille)`, invoked roughly every 100 ms
/// while `unlock` is sleeping off a failed-attempt backoff.
pub type UiCallback = Box<dyn FnMut(u32, u32) + Send>;

/// Runtime knobs that do not belong in the on-flash format. Kept separate
/// from [`StorageHandle`] so defaults live in one place and tests can shrink
/// the backoff poll interval without touching protocol logic.
pub struct StorageConfig {
    /// Wall-clock length of one backoff "tick"; the real device waits
    /// 100 ms here. Tests set this to zero to keep `unlock`'s 2^(ctr-1)
    /// second sleep from actually blocking the test process.
    pub poll_interval: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { poll_interval: Duration::from_millis(100) }
    }
}

/// Encrypts `dek`/`sak` under a PIN-derived KEK and persists `EDEK_PVC_KEY` +
/// `PIN_NOT_SET_KEY`. Free function (rather than a method) so the upgrade
/// path can call it without needing a full `StorageHandle`.
fn set_pin_impl<B: NorcowBackend>(
    backend: &mut B,
    hardware_salt: &[u8; HARDWARE_SALT_SIZE],
    dek: &[u8; DEK_SIZE],
    sak: &[u8; SAK_SIZE],
    pin: u32,
) -> bool {
    let random_salt = random_bytes::<RANDOM_SALT_SIZE>();
    let derived = derive_kek(pin, hardware_salt, &random_salt, || {});

    let mut keys = [0u8; KEYS_SIZE];
    keys[..DEK_SIZE].copy_from_slice(dek);
    keys[DEK_SIZE..].copy_from_slice(sak);
    let (ciphertext, pvc) = wrap_keys(&derived.kek, &derived.keiv, &keys);
    keys.zeroize();

    let mut record = Vec::with_capacity(RANDOM_SALT_SIZE + KEYS_SIZE + PVC_SIZE);
    record.extend_from_slice(&random_salt);
    record.extend_from_slice(&ciphertext);
    record.extend_from_slice(&pvc);
    if !backend.set(EDEK_PVC_KEY, &record) {
        return false;
    }

    let not_set = if pin == PIN_EMPTY { 1u8 } else { 0u8 };
    backend.set(PIN_NOT_SET_KEY, &[not_set])
}

pub struct StorageHandle<B: NorcowBackend> {
    backend: B,
    config: StorageConfig,
    initialized: bool,
    unlocked: bool,
    dek: [u8; DEK_SIZE],
    sak: [u8; SAK_SIZE],
    authentication_sum: AuthSum,
    hardware_salt: [u8; HARDWARE_SALT_SIZE],
    fault_handler: FaultHandler,
    ui_callback: Option<UiCallback>,
}

impl<B: NorcowBackend> Drop for StorageHandle<B> {
    fn drop(&mut self) {
        self.dek.zeroize();
        self.sak.zeroize();
        self.authentication_sum.zeroize();
    }
}

impl<B: NorcowBackend> StorageHandle<B> {
    pub fn new(backend: B, config: StorageConfig) -> Self {
        Self {
            backend,
            config,
            initialized: false,
            unlocked: false,
            dek: [0u8; DEK_SIZE],
            sak: [0u8; SAK_SIZE],
            authentication_sum: [0u8; 32],
            hardware_salt: [0u8; HARDWARE_SALT_SIZE],
            fault_handler: FaultHandler::new(),
            ui_callback: None,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn is_unlocked(&self) -> bool {
        self.unlocked
    }

    /// Idempotent boot call: hashes the hardware salt, migrates a legacy
    /// image if present, and populates a fresh DEK/SAK/PIN if storage has
    /// never been set up. Safe to call again (e.g. after a failed boot) —
    /// every sub-step checks its own precondition before acting.
    pub fn init(&mut self, hw_salt_bytes: &[u8], ui_callback: Option<UiCallback>) -> bool {
        self.initialized = false;
        self.unlocked = false;
        self.ui_callback = ui_callback;
        self.hardware_salt = sha256(hw_salt_bytes);
        self.initialized = true;

        if self.backend.active_version() < NORCOW_VERSION {
            log::debug!("storage: migrating legacy image");
            self.dek = random_bytes::<DEK_SIZE>();
            self.sak = random_bytes::<SAK_SIZE>();
            let dek = self.dek;
            let sak = self.sak;
            let hardware_salt = self.hardware_salt;
            let ok = upgrade::upgrade(&mut self.backend, &mut self.fault_handler, &sak, &dek, |backend, pin| {
                set_pin_impl(backend, &hardware_salt, &dek, &sak, pin)
            });
            if !ok {
                log::error!("storage: upgrade failed, wiping");
                self.wipe();
                return false;
            }
        }

        if self.backend.get(EDEK_PVC_KEY).is_none() {
            log::debug!("storage: no EDEK present, formatting fresh storage");
            if !self.init_wiped_storage() {
                log::error!("storage: failed to format fresh storage, wiping");
                self.wipe();
                return false;
            }
        }

        self.dek.zeroize();
        self.sak.zeroize();
        true
    }

    fn init_wiped_storage(&mut self) -> bool {
        self.dek = random_bytes::<DEK_SIZE>();
        self.sak = random_bytes::<SAK_SIZE>();

        let (ok, mut sum) = auth_tag::auth_init(&mut self.backend, &self.sak);
        if !ok {
            return false;
        }
        let (ok, was_overwrite) = entry::storage_set_encrypted(&mut self.backend, &self.dek, VERSION_KEY, &NORCOW_VERSION.to_le_bytes());
        if !ok || !auth_tag::on_protected_write(&mut self.backend, &self.sak, &mut sum, VERSION_KEY, was_overwrite) {
            return false;
        }
        if !self.set_pin(PIN_EMPTY) {
            return false;
        }
        pin_log::pin_logs_init(&mut self.fault_handler, &mut self.backend, 0)
    }

    /// Encrypts the cached DEK/SAK under a fresh PIN-derived KEK. Does not
    /// require `unlocked`: used both from `init_wiped_storage` (first PIN,
    /// always `PIN_EMPTY`) and from `change_pin`.
    fn set_pin(&mut self, pin: u32) -> bool {
        set_pin_impl(&mut self.backend, &self.hardware_salt, &self.dek, &self.sak, pin)
    }

    /// Attempts to unlock with `pin`. Charges a failed attempt to the PIN
    /// log *before* verification completes (see module docs on ordering),
    /// and wipes the device outright once the budget is exhausted.
    pub fn unlock(&mut self, pin: u32) -> bool {
        if !self.initialized {
            return false;
        }

        let ctr = pin_log::pin_get_fails(&mut self.fault_handler, &mut self.backend);
        fault::wait_random(&mut self.fault_handler, &mut self.backend);
        if ctr >= PIN_MAX_TRIES {
            log::error!("storage: pin fail counter already at max, wiping");
            self.wipe();
            return false;
        }

        self.sleep_backoff(ctr);

        pin_log::pin_fails_increase(&mut self.fault_handler, &mut self.backend);
        let ctr_after_charge = pin_log::pin_get_fails(&mut self.fault_handler, &mut self.backend);
        if ctr + 1 != ctr_after_charge {
            self.fault_handler.report(&mut self.backend);
        }

        if !self.unlock_inner(pin) {
            fault::wait_random(&mut self.fault_handler, &mut self.backend);
            if ctr + 1 >= PIN_MAX_TRIES {
                log::error!("storage: pin attempts exhausted, wiping");
                self.wipe();
            }
            return false;
        }

        self.unlocked = true;
        pin_log::pin_fails_reset(&mut self.fault_handler, &mut self.backend)
    }

    /// Sleeps `2^(ctr-1)` poll intervals (zero for `ctr` 0 or 1), driving the
    /// UI callback with a `(remaining, progress_permille)` pair every tick.
    fn sleep_backoff(&mut self, ctr: u32) {
        let wait = (1u32 << ctr) >> 1;
        if wait == 0 {
            return;
        }
        for rem in (1..=wait).rev() {
            for i in 0..10u32 {
                if let Some(cb) = self.ui_callback.as_mut() {
                    let progress = if wait > 1_000_000 {
                        (wait - rem) / (wait / 1000).max(1)
                    } else {
                        ((wait - rem) * 10 + i) * 100 / wait
                    };
                    cb(rem, progress);
                }
                std::thread::sleep(self.config.poll_interval);
            }
        }
        if let Some(cb) = self.ui_callback.as_mut() {
            cb(0, 1000);
        }
    }

    /// Derives the KEK, unwraps the DEK/SAK, and checks the PVC. Separate
    /// from `unlock` so the PIN-log bookkeeping around it stays linear and
    /// impossible to skip by an early return.
    fn unlock_inner(&mut self, pin: u32) -> bool {
        let Some(buffer) = self.backend.get(EDEK_PVC_KEY) else {
            return false;
        };
        if buffer.len() != RANDOM_SALT_SIZE + KEYS_SIZE + PVC_SIZE {
            return false;
        }

        let mut random_salt = [0u8; RANDOM_SALT_SIZE];
        random_salt.copy_from_slice(&buffer[..RANDOM_SALT_SIZE]);
        let mut ciphertext = [0u8; KEYS_SIZE];
        ciphertext.copy_from_slice(&buffer[RANDOM_SALT_SIZE..RANDOM_SALT_SIZE + KEYS_SIZE]);
        let pvc = &buffer[RANDOM_SALT_SIZE + KEYS_SIZE..];

        let derived = derive_kek(pin, &self.hardware_salt, &random_salt, || {});
        let (mut plaintext, tag) = unwrap_keys(&derived.kek, &derived.keiv, &ciphertext);

        fault::wait_random(&mut self.fault_handler, &mut self.backend);
        if !secequal(&tag, pvc) {
            plaintext.zeroize();
            return false;
        }

        self.dek.copy_from_slice(&plaintext[..DEK_SIZE]);
        self.sak.copy_from_slice(&plaintext[DEK_SIZE..]);
        plaintext.zeroize();

        // Rebuild the authentication sum from a full scan, initializing it
        // for the rest of this unlocked session.
        let Some(result) = auth_tag::auth_get(&self.backend, &self.sak, Some(VERSION_KEY)) else {
            self.fault_handler.report(&mut self.backend);
        };
        self.authentication_sum = result.sum;

        let version_matches = result
            .value
            .and_then(|raw| match entry::decrypt_record(&self.dek, VERSION_KEY, &raw) {
                entry::GetEncryptedOutcome::Found(bytes) if bytes.len() == 4 => {
                    Some(u32::from_le_bytes(bytes.try_into().unwrap()))
                }
                _ => None,
            })
            .map(|version| version == self.backend.active_version())
            .unwrap_or(false);
        if !version_matches {
            self.fault_handler.report(&mut self.backend);
        }

        true
    }

    /// Clears the `unlocked` flag and zeroizes the cached key material.
    /// Conceptual only in the original (no on-flash effect).
    pub fn lock(&mut self) {
        self.unlocked = false;
        self.dek.zeroize();
        self.sak.zeroize();
        self.authentication_sum.zeroize();
    }

    pub fn has_pin(&self) -> bool {
        if !self.initialized {
            return false;
        }
        match self.backend.get(PIN_NOT_SET_KEY) {
            Some(val) => val.first().copied().unwrap_or(0) == 0,
            None => false,
        }
    }

    /// `16 - failure_count`.
    pub fn get_pin_rem(&mut self) -> u32 {
        let ctr = pin_log::pin_get_fails(&mut self.fault_handler, &mut self.backend);
        PIN_MAX_TRIES - ctr
    }

    /// Re-verifies `old` (defence in depth against a stale `unlocked` flag)
    /// before wrapping the cached keys under a KEK derived from `new`.
    pub fn change_pin(&mut self, old: u32, new: u32) -> bool {
        if !self.initialized || !self.unlocked {
            return false;
        }
        if !self.unlock(old) {
            return false;
        }
        self.set_pin(new)
    }

    /// Tri-state variant of [`unlock`] for callers that want to distinguish
    /// a wrong PIN from the device having just wiped itself mid-attempt.
    pub fn unlock_outcome(&mut self, pin: u32) -> PinOutcome {
        let ctr_before = pin_log::pin_get_fails(&mut self.fault_handler, &mut self.backend);
        if self.unlock(pin) {
            PinOutcome::Correct
        } else if ctr_before + 1 >= PIN_MAX_TRIES {
            PinOutcome::Fault
        } else {
            PinOutcome::Wrong
        }
    }

    fn check_app_key(&self, key: StorageKey) -> StorageResult<()> {
        if key.is_reserved_app() {
            return Err(StorageError::InvalidKey(key.raw()));
        }
        Ok(())
    }

    /// Public keys are readable without an unlock; protected keys require one.
    pub fn get(&mut self, key: StorageKey) -> StorageResult<Option<Vec<u8>>> {
        if !self.initialized {
            return Err(StorageError::NotInitialized);
        }
        self.check_app_key(key)?;

        if key.is_public() {
            return Ok(self.backend.get(key));
        }
        if !self.unlocked {
            return Err(StorageError::Locked);
        }
        let Some(result) = auth_tag::auth_get(&self.backend, &self.sak, Some(key)) else {
            return self.fault_handler.report(&mut self.backend);
        };
        let Some(buf) = result.value else {
            return Ok(None);
        };
        match entry::decrypt_record(&self.dek, key, &buf) {
            entry::GetEncryptedOutcome::Found(plaintext) => Ok(Some(plaintext)),
            entry::GetEncryptedOutcome::NotFound => Ok(None),
            entry::GetEncryptedOutcome::Tampered => self.fault_handler.report(&mut self.backend),
        }
    }

    pub fn set(&mut self, key: StorageKey, value: &[u8]) -> StorageResult<()> {
        if !self.initialized {
            return Err(StorageError::NotInitialized);
        }
        if !self.unlocked {
            return Err(StorageError::Locked);
        }
        self.check_app_key(key)?;

        let ok = if key.is_public() {
            self.backend.set(key, value)
        } else {
            let (ok, was_overwrite) = entry::storage_set_encrypted(&mut self.backend, &self.dek, key, value);
            ok && auth_tag::on_protected_write(&mut self.backend, &self.sak, &mut self.authentication_sum, key, was_overwrite)
        };
        if ok {
            Ok(())
        } else {
            Err(StorageError::Backend(format!("failed to write key {:#06x}", key.raw())))
        }
    }

    pub fn delete(&mut self, key: StorageKey) -> StorageResult<()> {
        if !self.initialized {
            return Err(StorageError::NotInitialized);
        }
        if !self.unlocked {
            return Err(StorageError::Locked);
        }
        self.check_app_key(key)?;

        let deleted = self.backend.delete(key);
        if deleted && key.is_protected() {
            auth_tag::on_protected_delete(&mut self.backend, &self.sak, &mut self.authentication_sum, key);
        }
        if deleted {
            Ok(())
        } else {
            Err(StorageError::Backend(format!("key {:#06x} not present", key.raw())))
        }
    }

    /// Wipes the backend and immediately reformats it, mirroring the
    /// original's `storage_wipe` (which always leaves the device in a
    /// freshly-initialized, PIN-less state rather than an uninitialized one).
    pub fn wipe(&mut self) {
        self.backend.wipe();
        self.authentication_sum.zeroize();
        self.dek.zeroize();
        self.sak.zeroize();
        self.unlocked = false;
        self.init_wiped_storage();
        self.dek.zeroize();
        self.sak.zeroize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::norcow::MemoryNorcow;

    fn test_config() -> StorageConfig {
        StorageConfig { poll_interval: Duration::from_millis(0) }
    }

    fn booted() -> StorageHandle<MemoryNorcow> {
        let mut handle = StorageHandle::new(MemoryNorcow::new(), test_config());
        assert!(handle.init(b"hardware-salt", None));
        handle
    }

    #[test]
    fn fresh_storage_has_empty_pin_and_unlocks_with_it() {
        let mut handle = booted();
        assert!(!handle.has_pin());
        assert!(handle.unlock(PIN_EMPTY));
        assert!(handle.is_unlocked());
        assert_eq!(handle.get_pin_rem(), PIN_MAX_TRIES);
    }

    #[test]
    fn wrong_pin_is_rejected_and_charges_an_attempt() {
        let mut handle = booted();
        assert!(handle.unlock(PIN_EMPTY));
        handle.lock();

        assert!(!handle.unlock(9999));
        assert!(!handle.is_unlocked());
        assert_eq!(handle.get_pin_rem(), PIN_MAX_TRIES - 1);

        assert!(handle.unlock(PIN_EMPTY));
        assert_eq!(handle.get_pin_rem(), PIN_MAX_TRIES);
    }

    #[test]
    fn fifteen_wrong_attempts_then_correct_pin_still_unlocks() {
        let mut handle = booted();
        for _ in 0..15 {
            assert!(!handle.unlock(9999));
        }
        assert!(handle.unlock(PIN_EMPTY));
        assert_eq!(handle.get_pin_rem(), PIN_MAX_TRIES);
    }

    #[test]
    fn sixteenth_wrong_attempt_wipes_the_device() {
        let mut handle = booted();
        for _ in 0..15 {
            assert!(!handle.unlock(9999));
        }
        assert!(!handle.unlock(9999));
        // The device wiped and reformatted itself with PIN_EMPTY again.
        assert_eq!(handle.get_pin_rem(), PIN_MAX_TRIES);
        assert!(handle.unlock(PIN_EMPTY));
    }

    #[test]
    fn set_pin_changes_which_pin_unlocks() {
        let mut handle = booted();
        assert!(handle.unlock(PIN_EMPTY));
        assert!(handle.change_pin(PIN_EMPTY, 4242));
        handle.lock();

        assert!(!handle.unlock(PIN_EMPTY));
        handle.lock();
        assert!(handle.unlock(4242));
    }

    #[test]
    fn protected_values_round_trip_and_are_invisible_when_locked() {
        let mut handle = booted();
        assert!(handle.unlock(PIN_EMPTY));
        let key = StorageKey::new(0x01, 0x10);
        handle.set(key, b"secret-value").unwrap();
        assert_eq!(handle.get(key).unwrap(), Some(b"secret-value".to_vec()));

        handle.lock();
        assert!(matches!(handle.get(key), Err(StorageError::Locked)));
        assert!(matches!(handle.set(key, b"nope"), Err(StorageError::Locked)));
    }

    #[test]
    fn public_values_are_readable_without_unlock() {
        let mut handle = booted();
        assert!(handle.unlock(PIN_EMPTY));
        let key = StorageKey::new(0x81, 0x10);
        handle.set(key, b"public-value").unwrap();
        handle.lock();
        assert_eq!(handle.get(key).unwrap(), Some(b"public-value".to_vec()));
    }

    #[test]
    fn reserved_app_keys_are_rejected() {
        let mut handle = booted();
        assert!(handle.unlock(PIN_EMPTY));
        let key = StorageKey::new(0x00, 0x10);
        assert!(matches!(handle.set(key, b"x"), Err(StorageError::InvalidKey(_))));
        assert!(matches!(handle.get(key), Err(StorageError::InvalidKey(_))));
    }

    #[test]
    fn delete_removes_the_value_and_updates_the_tag() {
        let mut handle = booted();
        assert!(handle.unlock(PIN_EMPTY));
        let key = StorageKey::new(0x01, 0x11);
        handle.set(key, b"temp").unwrap();
        handle.delete(key).unwrap();
        assert_eq!(handle.get(key).unwrap(), None);
    }

    #[test]
    fn unlock_outcome_distinguishes_wrong_from_fault_wipe() {
        let mut handle = booted();
        assert_eq!(handle.unlock_outcome(PIN_EMPTY), PinOutcome::Correct);
        handle.lock();
        for _ in 0..15 {
            assert_eq!(handle.unlock_outcome(9999), PinOutcome::Wrong);
        }
        assert_eq!(handle.unlock_outcome(9999), PinOutcome::Fault);
    }
}
