//! Global authentication tag: binds the *set* of protected keys present in
//! storage, so an attacker who can write to the backend cannot silently add
//! or remove a protected entry without also forging a SAK-keyed tag.
//!
//! `S = XOR over protected keys of HMAC-SHA256(SAK, key as little-endian u16)`,
//! `STORAGE_TAG = HMAC-SHA256(SAK, S)[..16]`. Per-entry confidentiality and
//! integrity of the *value* under a key is handled separately by
//! [`super::entry`]; this tag only ever certifies which keys exist.

use super::crypto::{hmac_sha256, secequal};
use super::model::{StorageKey, STORAGE_TAG_KEY, STORAGE_TAG_SIZE};
use super::norcow::NorcowBackend;

pub type AuthSum = [u8; 32];

fn key_tag(sak: &[u8; 16], key: StorageKey) -> [u8; 32] {
    hmac_sha256(sak, &key.to_le_bytes())
}

fn storage_tag(sak: &[u8; 16], sum: &AuthSum) -> [u8; STORAGE_TAG_SIZE] {
    let full = hmac_sha256(sak, sum);
    let mut out = [0u8; STORAGE_TAG_SIZE];
    out.copy_from_slice(&full[..STORAGE_TAG_SIZE]);
    out
}

fn xor_into(sum: &mut AuthSum, tag: &[u8; 32]) {
    for (s, t) in sum.iter_mut().zip(tag) {
        *s ^= t;
    }
}

/// Resets the authentication sum to empty (no protected keys) and persists
/// the matching tag. Called only when formatting fresh storage.
pub fn auth_init<B: NorcowBackend>(backend: &mut B, sak: &[u8; 16]) -> (bool, AuthSum) {
    let sum: AuthSum = [0u8; 32];
    let tag = storage_tag(sak, &sum);
    (backend.set(STORAGE_TAG_KEY, &tag), sum)
}

/// Call immediately after a successful write to a protected key. The
/// authentication sum only changes on the *first* write of a given key
/// (`was_overwrite == false`); updating a key's value does not change the
/// set of keys, so no new tag needs to be persisted.
///
/// If the tag fails to persist, the entry that was just written is deleted
/// and `sum` is restored to its pre-call value, so a transient IO failure
/// never leaves the tag on flash out of sync with the key set it certifies.
pub fn on_protected_write<B: NorcowBackend>(backend: &mut B, sak: &[u8; 16], sum: &mut AuthSum, key: StorageKey, was_overwrite: bool) -> bool {
    if was_overwrite {
        return true;
    }
    let key_tag_value = key_tag(sak, key);
    xor_into(sum, &key_tag_value);
    let tag = storage_tag(sak, sum);
    if backend.set(STORAGE_TAG_KEY, &tag) {
        return true;
    }
    xor_into(sum, &key_tag_value);
    backend.delete(key);
    false
}

/// Call immediately after deleting a protected key.
pub fn on_protected_delete<B: NorcowBackend>(backend: &mut B, sak: &[u8; 16], sum: &mut AuthSum, key: StorageKey) -> bool {
    xor_into(sum, &key_tag(sak, key));
    let tag = storage_tag(sak, sum);
    backend.set(STORAGE_TAG_KEY, &tag)
}

pub struct AuthGetResult {
    pub sum: AuthSum,
    pub value: Option<Vec<u8>>,
}

/// Single-pass scan over every live key: rebuilds the authentication sum
/// from scratch, recomputes `STORAGE_TAG`, and optionally looks up
/// `lookup_key`'s current value along the way. Returns `None` if the
/// rebuilt tag disagrees with the one on flash.
pub fn auth_get<B: NorcowBackend>(backend: &B, sak: &[u8; 16], lookup_key: Option<StorageKey>) -> Option<AuthGetResult> {
    let stored_tag = backend.get(STORAGE_TAG_KEY)?;
    if stored_tag.len() != STORAGE_TAG_SIZE {
        return None;
    }

    let mut sum: AuthSum = [0u8; 32];
    let mut value = None;
    for key in backend.keys() {
        if key.is_protected() {
            xor_into(&mut sum, &key_tag(sak, key));
        }
        if Some(key) == lookup_key {
            value = backend.get(key);
        }
    }

    let tag = storage_tag(sak, &sum);
    if !secequal(&tag, &stored_tag) {
        return None;
    }
    Some(AuthGetResult { sum, value })
}
