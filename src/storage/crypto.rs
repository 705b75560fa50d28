//! Cryptographic primitives adapter.
//!
//! Everything here is a thin, audited wrapper around RustCrypto crates; no
//! cipher or hash is hand-rolled. The one piece of custom plumbing is the
//! raw RFC 7539 construction used by [`wrap_keys`]/[`unwrap_keys`], which
//! needs the ChaCha20 keystream and the Poly1305 tag as separate values (the
//! PIN verification code is only the first 8 bytes of that tag) rather than
//! the combined, fully-verifying AEAD the `chacha20poly1305` crate exposes.

use std::hint::black_box;

use chacha20::cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};
use chacha20::ChaCha20;
use chacha20poly1305::aead::{Aead, KeyInit as AeadKeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key as AeadKey, Nonce as AeadNonce};
use hmac::digest::KeyInit as HmacKeyInit;
use hmac::{Hmac, Mac};
use poly1305::universal_hash::{KeyInit as UhKeyInit, UniversalHash};
use poly1305::Poly1305;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use super::model::{KEYS_SIZE, PVC_SIZE};

/// Constant-time byte comparison.
///
/// Combines `subtle`'s branchless comparison with an independent loop
/// counter that must reach `a.len()`. A fault injection that skips
/// iterations of the comparison loop changes the counter but not the
/// `subtle` result, so the two checks have to agree.
pub fn secequal(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let eq = a.ct_eq(b);
    let mut counter = 0usize;
    for _ in a {
        counter = black_box(counter + 1);
    }
    bool::from(eq) & (counter == a.len())
}

pub fn sha256(data: &[u8]) -> [u8; 32] {
    use sha2::Digest;
    Sha256::digest(data).into()
}

/// An HMAC-SHA256 key with the ipad/opad-absorbed digest states already
/// computed. Cloning `Hmac` clones those states, not the key, so repeated
/// calls against varying short messages skip re-absorbing the key.
pub struct PreparedHmacSha256 {
    base: Hmac<Sha256>,
}

impl PreparedHmacSha256 {
    pub fn prepare(key: &[u8]) -> Self {
        Self {
            base: HmacKeyInit::new_from_slice(key).expect("HMAC accepts any key length"),
        }
    }

    pub fn compute(&self, msg: &[u8]) -> [u8; 32] {
        let mut mac = self.base.clone();
        mac.update(msg);
        mac.finalize().into_bytes().into()
    }
}

pub fn hmac_sha256(key: &[u8], msg: &[u8]) -> [u8; 32] {
    PreparedHmacSha256::prepare(key).compute(msg)
}

/// PBKDF2-HMAC-SHA256, producing two concatenated 32-byte output blocks
/// (indices 1 and 2) for a total of 64 bytes. `progress` is called twice per
/// block, once at the halfway point and once on completion, so a caller can
/// drive a UI progress bar without the PBKDF2 arithmetic leaking into it.
pub fn pbkdf2_hmac_sha256_two_blocks(
    password: &[u8],
    salt: &[u8],
    iterations: u32,
    mut progress: impl FnMut(),
) -> [u8; 64] {
    let mut out = [0u8; 64];
    for block_index in 1..=2u32 {
        let block = pbkdf2_block(password, salt, iterations, block_index, &mut progress);
        let offset = (block_index as usize - 1) * 32;
        out[offset..offset + 32].copy_from_slice(&block);
    }
    out
}

fn pbkdf2_block(
    password: &[u8],
    salt: &[u8],
    iterations: u32,
    block_index: u32,
    progress: &mut impl FnMut(),
) -> [u8; 32] {
    let prepared = PreparedHmacSha256::prepare(password);
    let mut salt_and_index = Vec::with_capacity(salt.len() + 4);
    salt_and_index.extend_from_slice(salt);
    salt_and_index.extend_from_slice(&block_index.to_be_bytes());

    let mut u = prepared.compute(&salt_and_index);
    let mut t = u;
    let half = iterations / 2;
    for i in 1..iterations {
        u = prepared.compute(&u);
        for (tb, ub) in t.iter_mut().zip(u.iter()) {
            *tb ^= ub;
        }
        if i == half {
            progress();
        }
    }
    progress();
    t
}

/// 96-bit-nonce ChaCha20-Poly1305 (RFC 7539), used for protected entries.
/// The full 16-byte tag is stored alongside the ciphertext and verified on
/// decrypt by the `chacha20poly1305` crate itself.
pub fn aead_encrypt(key: &[u8; 32], iv: &[u8; 12], aad: &[u8], plaintext: &[u8]) -> Vec<u8> {
    let cipher = ChaCha20Poly1305::new(AeadKey::from_slice(key));
    cipher
        .encrypt(AeadNonce::from_slice(iv), Payload { msg: plaintext, aad })
        .expect("encryption with a correctly sized key/nonce cannot fail")
}

pub fn aead_decrypt(key: &[u8; 32], iv: &[u8; 12], aad: &[u8], ciphertext_and_tag: &[u8]) -> Option<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(AeadKey::from_slice(key));
    cipher
        .decrypt(AeadNonce::from_slice(iv), Payload { msg: ciphertext_and_tag, aad })
        .ok()
}

/// Derives the Poly1305 one-time key from the first 32 bytes of the
/// ChaCha20 keystream and leaves `cipher` seeked to the start of block 1,
/// ready to encrypt/decrypt the message proper.
fn chacha20_poly1305_key(key: &[u8; 32], iv: &[u8; 12]) -> ([u8; 32], ChaCha20) {
    let mut cipher = ChaCha20::new(key.into(), iv.into());
    let mut poly_key = [0u8; 32];
    cipher.apply_keystream(&mut poly_key);
    cipher.seek(64u32);
    (poly_key, cipher)
}

fn rfc7539_tag(poly_key: &[u8; 32], ciphertext: &[u8]) -> [u8; 16] {
    let mut mac = Poly1305::new(poly1305::Key::from_slice(poly_key));
    mac.update_padded(ciphertext);
    let mut lens = [0u8; 16];
    lens[8..16].copy_from_slice(&(ciphertext.len() as u64).to_le_bytes());
    mac.update_padded(&lens);
    mac.finalize().into()
}

/// Encrypts `keys` (DEK || SAK) under KEK/KEIV with no associated data,
/// returning the ciphertext and the 8-byte PIN verification code (the
/// truncated Poly1305 tag). Only the truncated code is ever persisted; the
/// remaining 8 tag bytes are discarded, matching the on-flash layout.
pub fn wrap_keys(kek: &[u8; 32], keiv: &[u8; 12], keys: &[u8; KEYS_SIZE]) -> ([u8; KEYS_SIZE], [u8; PVC_SIZE]) {
    let (poly_key, mut cipher) = chacha20_poly1305_key(kek, keiv);
    let mut ciphertext = *keys;
    cipher.apply_keystream(&mut ciphertext);
    let tag = rfc7539_tag(&poly_key, &ciphertext);
    let mut pvc = [0u8; PVC_SIZE];
    pvc.copy_from_slice(&tag[..PVC_SIZE]);
    (ciphertext, pvc)
}

/// Inverse of [`wrap_keys`]. Always "succeeds" structurally (ChaCha20 has no
/// failure mode); the caller must compare the returned PVC against the
/// stored one with [`secequal`] to learn whether the PIN was correct.
pub fn unwrap_keys(kek: &[u8; 32], keiv: &[u8; 12], ciphertext: &[u8; KEYS_SIZE]) -> ([u8; KEYS_SIZE], [u8; PVC_SIZE]) {
    let (poly_key, mut cipher) = chacha20_poly1305_key(kek, keiv);
    let tag = rfc7539_tag(&poly_key, ciphertext);
    let mut plaintext = *ciphertext;
    cipher.apply_keystream(&mut plaintext);
    let mut pvc = [0u8; PVC_SIZE];
    pvc.copy_from_slice(&tag[..PVC_SIZE]);
    (plaintext, pvc)
}

pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut buf = [0u8; N];
    OsRng.fill_bytes(&mut buf);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secequal_matches_equal_slices_and_rejects_length_mismatch() {
        assert!(secequal(b"abc", b"abc"));
        assert!(!secequal(b"abc", b"abd"));
        assert!(!secequal(b"abc", b"ab"));
    }

    #[test]
    fn prepared_hmac_matches_one_shot_hmac() {
        let key = b"prepared-key";
        let prepared = PreparedHmacSha256::prepare(key);
        assert_eq!(prepared.compute(b"msg"), hmac_sha256(key, b"msg"));
        assert_eq!(prepared.compute(b"other"), hmac_sha256(key, b"other"));
    }

    #[test]
    fn pbkdf2_is_deterministic_and_salt_sensitive() {
        let a = pbkdf2_hmac_sha256_two_blocks(b"1234", b"salt-a", 1000, || {});
        let b = pbkdf2_hmac_sha256_two_blocks(b"1234", b"salt-a", 1000, || {});
        let c = pbkdf2_hmac_sha256_two_blocks(b"1234", b"salt-b", 1000, || {});
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn pbkdf2_progress_called_four_times() {
        let mut calls = 0;
        pbkdf2_hmac_sha256_two_blocks(b"1234", b"salt", 10, || calls += 1);
        assert_eq!(calls, 4);
    }

    #[test]
    fn aead_roundtrip_and_aad_sensitivity() {
        let key = [7u8; 32];
        let iv = [1u8; 12];
        let ct = aead_encrypt(&key, &iv, b"aad", b"hello");
        assert_eq!(aead_decrypt(&key, &iv, b"aad", &ct).unwrap(), b"hello");
        assert!(aead_decrypt(&key, &iv, b"different-aad", &ct).is_none());
    }

    #[test]
    fn wrap_unwrap_keys_roundtrip_and_pvc_matches() {
        let kek = [9u8; 32];
        let keiv = [2u8; 12];
        let keys = [5u8; KEYS_SIZE];
        let (ciphertext, pvc) = wrap_keys(&kek, &keiv, &keys);
        let (plaintext, pvc2) = unwrap_keys(&kek, &keiv, &ciphertext);
        assert_eq!(plaintext, keys);
        assert!(secequal(&pvc, &pvc2));
    }

    #[test]
    fn unwrap_keys_with_wrong_kek_yields_mismatched_pvc() {
        let kek = [9u8; 32];
        let wrong_kek = [10u8; 32];
        let keiv = [2u8; 12];
        let keys = [5u8; KEYS_SIZE];
        let (ciphertext, pvc) = wrap_keys(&kek, &keiv, &keys);
        let (_plaintext, pvc2) = unwrap_keys(&wrong_kek, &keiv, &ciphertext);
        assert!(!secequal(&pvc, &pvc2));
    }
}
