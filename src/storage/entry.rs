//! Protected-entry encryption.
//!
//! On-flash layout: `[12B IV][L bytes ciphertext][16B Poly1305 tag]`. The
//! buffer is pre-allocated in its erased (all-ones) state through
//! `set_ex`, then the IV and ciphertext are written in
//! [`super::model::CHACHA20_BLOCK_SIZE`]-byte chunks through `update_bytes` —
//! mirroring the bounded-size writes a real flash page allows, rather than
//! handing the backend one large write.

use super::crypto::{aead_decrypt, aead_encrypt, random_bytes};
use super::model::{StorageKey, CHACHA20_BLOCK_SIZE, CHACHA20_IV_SIZE, POLY1305_TAG_SIZE};
use super::norcow::NorcowBackend;

pub enum GetEncryptedOutcome {
    Found(Vec<u8>),
    NotFound,
    /// The stored record is too short to contain an IV + tag, or AEAD
    /// verification failed. Callers must route this into the fault handler.
    Tampered,
}

/// Encrypts `plaintext` under `dek` with the key's little-endian bytes as
/// associated data, and writes it via a pre-allocate-then-stream sequence.
/// Returns `(ok, was_overwrite)` exactly as `NorcowBackend::set_ex` does.
pub fn storage_set_encrypted<B: NorcowBackend>(backend: &mut B, dek: &[u8; 32], key: StorageKey, plaintext: &[u8]) -> (bool, bool) {
    let iv = random_bytes::<CHACHA20_IV_SIZE>();
    let ciphertext = aead_encrypt(dek, &iv, &key.to_le_bytes(), plaintext);
    let total_len = CHACHA20_IV_SIZE + ciphertext.len();

    let (ok, was_overwrite) = backend.set_ex(key, &vec![0xFFu8; total_len]);
    if !ok {
        return (false, was_overwrite);
    }

    if !write_chunked(backend, key, 0, &iv) {
        return (false, was_overwrite);
    }
    if !write_chunked(backend, key, CHACHA20_IV_SIZE, &ciphertext) {
        return (false, was_overwrite);
    }
    (true, was_overwrite)
}

fn write_chunked<B: NorcowBackend>(backend: &mut B, key: StorageKey, start_offset: usize, data: &[u8]) -> bool {
    for chunk_start in (0..data.len()).step_by(CHACHA20_BLOCK_SIZE) {
        let chunk_end = (chunk_start + CHACHA20_BLOCK_SIZE).min(data.len());
        if !backend.update_bytes(key, start_offset + chunk_start, &data[chunk_start..chunk_end]) {
            return false;
        }
    }
    true
}

/// Decrypts a raw `[IV][ciphertext][tag]` record already fetched from the
/// backend. Split out from [`storage_get_encrypted`] so a caller that must
/// fetch the record itself (e.g. through [`super::auth_tag::auth_get`], to
/// verify the global tag in the same scan) doesn't pay for a second lookup.
pub fn decrypt_record(dek: &[u8; 32], key: StorageKey, buf: &[u8]) -> GetEncryptedOutcome {
    if buf.len() < CHACHA20_IV_SIZE + POLY1305_TAG_SIZE {
        return GetEncryptedOutcome::Tampered;
    }

    let mut iv = [0u8; CHACHA20_IV_SIZE];
    iv.copy_from_slice(&buf[..CHACHA20_IV_SIZE]);
    let ciphertext_and_tag = &buf[CHACHA20_IV_SIZE..];

    match aead_decrypt(dek, &iv, &key.to_le_bytes(), ciphertext_and_tag) {
        Some(plaintext) => GetEncryptedOutcome::Found(plaintext),
        None => GetEncryptedOutcome::Tampered,
    }
}

/// Reads and decrypts a protected entry directly from the backend, without
/// checking the global authentication tag. Used where the tag is checked
/// separately (legacy migration) or not applicable (tests).
pub fn storage_get_encrypted<B: NorcowBackend>(backend: &B, dek: &[u8; 32], key: StorageKey) -> GetEncryptedOutcome {
    let Some(buf) = backend.get(key) else {
        return GetEncryptedOutcome::NotFound;
    };
    decrypt_record(dek, key, &buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::norcow::MemoryNorcow;

    #[test]
    fn roundtrip_small_and_multi_block_payloads() {
        let mut backend = MemoryNorcow::new();
        let dek = [1u8; 32];
        let key = StorageKey::new(0x01, 0x20);

        storage_set_encrypted(&mut backend, &dek, key, b"short");
        match storage_get_encrypted(&backend, &dek, key) {
            GetEncryptedOutcome::Found(pt) => assert_eq!(pt, b"short"),
            _ => panic!("expected a decrypted value"),
        }

        let long_payload = vec![0x42u8; CHACHA20_BLOCK_SIZE * 3 + 7];
        storage_set_encrypted(&mut backend, &dek, key, &long_payload);
        match storage_get_encrypted(&backend, &dek, key) {
            GetEncryptedOutcome::Found(pt) => assert_eq!(pt, long_payload),
            _ => panic!("expected a decrypted value"),
        }
    }

    #[test]
    fn missing_key_is_not_found_not_tampered() {
        let backend = MemoryNorcow::new();
        let dek = [1u8; 32];
        assert!(matches!(
            storage_get_encrypted(&backend, &dek, StorageKey::new(0x01, 0x21)),
            GetEncryptedOutcome::NotFound
        ));
    }

    #[test]
    fn wrong_dek_is_tampered() {
        let mut backend = MemoryNorcow::new();
        let key = StorageKey::new(0x01, 0x22);
        storage_set_encrypted(&mut backend, &[1u8; 32], key, b"secret");
        assert!(matches!(
            storage_get_encrypted(&backend, &[2u8; 32], key),
            GetEncryptedOutcome::Tampered
        ));
    }

    #[test]
    fn single_bit_flip_in_ciphertext_is_tampered() {
        let mut backend = MemoryNorcow::new();
        let dek = [1u8; 32];
        let key = StorageKey::new(0x01, 0x23);
        storage_set_encrypted(&mut backend, &dek, key, b"secret-value");

        let mut buf = backend.get(key).unwrap();
        let last = buf.len() - 1;
        buf[last] ^= 0x01;
        backend.set_ex(key, &buf);

        assert!(matches!(
            storage_get_encrypted(&backend, &dek, key),
            GetEncryptedOutcome::Tampered
        ));
    }
}
