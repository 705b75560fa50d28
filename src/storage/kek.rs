//! Key-encryption-key derivation: PIN + hardware salt + random salt -> KEK/KEIV.

use zeroize::Zeroize;

use super::crypto::pbkdf2_hmac_sha256_two_blocks;
use super::model::{CHACHA20_IV_SIZE, HARDWARE_SALT_SIZE, RANDOM_SALT_SIZE};

/// Total PBKDF2 iterations per 32-byte output block. Two blocks are derived
/// (64 bytes total), so a full unlock attempt costs `2 * PIN_ITER_COUNT`
/// HMAC-SHA256 evaluations.
pub const PIN_ITER_COUNT: u32 = 10_000;

pub struct DerivedKek {
    pub kek: [u8; 32],
    pub keiv: [u8; CHACHA20_IV_SIZE],
}

impl Drop for DerivedKek {
    fn drop(&mut self) {
        self.kek.zeroize();
        self.keiv.zeroize();
    }
}

/// Derives the KEK (32 bytes) and KEIV (first 12 bytes of the second PBKDF2
/// block, used as the ChaCha20 nonce for the wrapped DEK/SAK) from a PIN.
///
/// `progress` is invoked four times total (twice per 32-byte block) and is
/// the hook a caller wires to a UI progress indicator during unlock.
pub fn derive_kek(pin: u32, hardware_salt: &[u8; HARDWARE_SALT_SIZE], random_salt: &[u8; RANDOM_SALT_SIZE], progress: impl FnMut()) -> DerivedKek {
    let mut salt = Vec::with_capacity(HARDWARE_SALT_SIZE + RANDOM_SALT_SIZE);
    salt.extend_from_slice(hardware_salt);
    salt.extend_from_slice(random_salt);

    let password = pin.to_le_bytes();
    let mut out = pbkdf2_hmac_sha256_two_blocks(&password, &salt, PIN_ITER_COUNT, progress);

    let mut kek = [0u8; 32];
    let mut keiv = [0u8; CHACHA20_IV_SIZE];
    kek.copy_from_slice(&out[0..32]);
    keiv.copy_from_slice(&out[32..32 + CHACHA20_IV_SIZE]);
    out.zeroize();
    DerivedKek { kek, keiv }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_pin_and_salts_give_same_kek() {
        let hw = [1u8; HARDWARE_SALT_SIZE];
        let rs = [2u8; RANDOM_SALT_SIZE];
        let a = derive_kek(1234, &hw, &rs, || {});
        let b = derive_kek(1234, &hw, &rs, || {});
        assert_eq!(a.kek, b.kek);
        assert_eq!(a.keiv, b.keiv);
    }

    #[test]
    fn different_pin_gives_different_kek() {
        let hw = [1u8; HARDWARE_SALT_SIZE];
        let rs = [2u8; RANDOM_SALT_SIZE];
        let a = derive_kek(1234, &hw, &rs, || {});
        let b = derive_kek(4321, &hw, &rs, || {});
        assert_ne!(a.kek, b.kek);
    }

    #[test]
    fn different_random_salt_gives_different_kek() {
        let hw = [1u8; HARDWARE_SALT_SIZE];
        let a = derive_kek(1234, &hw, &[2u8; RANDOM_SALT_SIZE], || {});
        let b = derive_kek(1234, &hw, &[3u8; RANDOM_SALT_SIZE], || {});
        assert_ne!(a.kek, b.kek);
    }
}
