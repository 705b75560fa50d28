//! One-shot migration from the legacy (v0) on-flash layout: a plaintext PIN
//! at key `0x0000` and a bit-cleared fail counter at key `0x0001`.

use super::auth_tag;
use super::entry;
use super::fault::FaultHandler;
use super::model::{StorageKey, NORCOW_VERSION, PIN_EMPTY, VERSION_KEY};
use super::norcow::NorcowBackend;
use super::pin_log;

const V0_PIN_KEY: StorageKey = StorageKey::new(0x00, 0x00);
const V0_PIN_FAIL_KEY: StorageKey = StorageKey::new(0x00, 0x01);

/// Legacy fail-counter encoding: a run of 0xFFFFFFFF words, with one bit
/// cleared per failed attempt in the first word that isn't all-ones.
fn v0_pin_get_fails<B: NorcowBackend>(backend: &B) -> u32 {
    let Some(bytes) = backend.get(V0_PIN_FAIL_KEY) else {
        return 0;
    };
    for chunk in bytes.chunks_exact(4) {
        let word = u32::from_le_bytes(chunk.try_into().unwrap());
        if word != 0 {
            return pin_log::hamming_weight(!word);
        }
    }
    0
}

/// Migrates a v0 image in place. `set_pin` must derive a fresh KEK/KEIV for
/// the given PIN, wrap `dek`/`sak` under it, and persist `EDEK_PVC_KEY` +
/// `PIN_NOT_SET_KEY` — the same thing `protocol::set_pin` does for an
/// ordinary PIN change, passed in so this module stays independent of
/// session state.
pub fn upgrade<B: NorcowBackend>(
    backend: &mut B,
    handler: &mut FaultHandler,
    sak: &[u8; 16],
    dek: &[u8; 32],
    mut set_pin: impl FnMut(&mut B, u32) -> bool,
) -> bool {
    if backend.active_version() != 0 {
        return false;
    }

    let (auth_ok, mut sum) = auth_tag::auth_init(backend, sak);
    if !auth_ok {
        return false;
    }

    let (ok, was_overwrite) = entry::storage_set_encrypted(backend, dek, VERSION_KEY, &NORCOW_VERSION.to_le_bytes());
    if !ok || !auth_tag::on_protected_write(backend, sak, &mut sum, VERSION_KEY, was_overwrite) {
        return false;
    }

    let legacy_pin = backend
        .get(V0_PIN_KEY)
        .and_then(|bytes| bytes.get(0..4).map(|b| u32::from_le_bytes(b.try_into().unwrap())))
        .unwrap_or(PIN_EMPTY);
    if !set_pin(backend, legacy_pin) {
        return false;
    }

    let fails = v0_pin_get_fails(backend);
    if !pin_log::pin_logs_init(handler, backend, fails) {
        return false;
    }

    for key in backend.keys() {
        if key.is_reserved_app() {
            continue;
        }
        let Some(value) = backend.get(key) else {
            continue;
        };
        if key.is_public() {
            if !backend.set(key, &value) {
                return false;
            }
        } else {
            let (ok, was_overwrite) = entry::storage_set_encrypted(backend, dek, key, &value);
            if !ok || !auth_tag::on_protected_write(backend, sak, &mut sum, key, was_overwrite) {
                return false;
            }
        }
    }

    backend.set_active_version(NORCOW_VERSION);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::norcow::MemoryNorcow;

    #[test]
    fn migrates_legacy_pin_fails_and_entries() {
        let mut backend = MemoryNorcow::new();
        backend.set(V0_PIN_KEY, &4321u32.to_le_bytes());
        // Two failed attempts: first word has two bits cleared.
        backend.set(V0_PIN_FAIL_KEY, &(!0b11u32).to_le_bytes());
        backend.set(StorageKey::new(0x81, 0x01), b"public-entry");
        backend.set(StorageKey::new(0x01, 0x01), b"protected-entry");
        backend.set_active_version(0);

        let sak = [9u8; 16];
        let dek = [8u8; 32];
        let mut handler = FaultHandler::new();
        let mut seen_pin = None;
        let ok = upgrade(&mut backend, &mut handler, &sak, &dek, |_backend, pin| {
            seen_pin = Some(pin);
            true
        });

        assert!(ok);
        assert_eq!(seen_pin, Some(4321));
        assert_eq!(backend.active_version(), NORCOW_VERSION);
        assert_eq!(backend.get(StorageKey::new(0x81, 0x01)), Some(b"public-entry".to_vec()));
        assert_ne!(backend.get(StorageKey::new(0x01, 0x01)).unwrap(), b"protected-entry".to_vec());
        assert!(auth_tag::auth_get(&backend, &sak, None).is_some());

        let fails = pin_log::pin_get_fails(&mut handler, &mut backend);
        assert_eq!(fails, 2);
    }

    #[test]
    fn refuses_to_migrate_an_already_current_image() {
        let mut backend = MemoryNorcow::new();
        backend.set_active_version(NORCOW_VERSION);
        let mut handler = FaultHandler::new();
        assert!(!upgrade(&mut backend, &mut handler, &[0u8; 16], &[0u8; 32], |_, _| true));
    }
}
