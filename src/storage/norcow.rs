//! The append-only flash log ("norcow") adapter contract, plus an in-memory
//! implementation used by tests and by hosted development.
//!
//! Real flash can only ever clear bits of an already-written word (an erase
//! cycle is required to set them back to 1); [`NorcowBackend::update_bytes`]
//! and [`NorcowBackend::update_word`] preserve that constraint (`old & new`)
//! so the PIN failure log's guard-key encoding, which depends on write being
//! clear-only, behaves the same way against every backend.

use std::collections::BTreeMap;

use super::model::StorageKey;

pub trait NorcowBackend {
    fn get(&self, key: StorageKey) -> Option<Vec<u8>>;

    /// Writes `value` as a fresh record for `key`, replacing any prior one.
    /// Returns `(ok, was_overwrite)`; `was_overwrite` is true iff `key` was
    /// already present, which callers use to decide whether the global
    /// authentication tag needs to absorb a new key or just a changed value.
    fn set_ex(&mut self, key: StorageKey, value: &[u8]) -> (bool, bool);

    fn set(&mut self, key: StorageKey, value: &[u8]) -> bool {
        self.set_ex(key, value).0
    }

    /// Clears bits of an existing record's bytes starting at `offset`.
    /// Fails if the key does not exist or the write would run past the
    /// record's length.
    fn update_bytes(&mut self, key: StorageKey, offset: usize, data: &[u8]) -> bool;

    /// Clears bits of a single little-endian `u32` at word index `word_offset`.
    fn update_word(&mut self, key: StorageKey, word_offset: usize, word: u32) -> bool;

    fn delete(&mut self, key: StorageKey) -> bool;

    /// Snapshot of all live keys, in a stable (ascending) order suitable for
    /// a single deterministic scan.
    fn keys(&self) -> Vec<StorageKey>;

    fn wipe(&mut self);

    fn active_version(&self) -> u32;

    fn set_active_version(&mut self, version: u32);
}

#[derive(Default)]
pub struct MemoryNorcow {
    entries: BTreeMap<u16, Vec<u8>>,
    active_version: u32,
}

impl MemoryNorcow {
    pub fn new() -> Self {
        Self::default()
    }
}

impl NorcowBackend for MemoryNorcow {
    fn get(&self, key: StorageKey) -> Option<Vec<u8>> {
        self.entries.get(&key.raw()).cloned()
    }

    fn set_ex(&mut self, key: StorageKey, value: &[u8]) -> (bool, bool) {
        let was_overwrite = self.entries.insert(key.raw(), value.to_vec()).is_some();
        (true, was_overwrite)
    }

    fn update_bytes(&mut self, key: StorageKey, offset: usize, data: &[u8]) -> bool {
        let Some(existing) = self.entries.get_mut(&key.raw()) else {
            return false;
        };
        if offset + data.len() > existing.len() {
            return false;
        }
        for (dst, src) in existing[offset..offset + data.len()].iter_mut().zip(data) {
            *dst &= *src;
        }
        true
    }

    fn update_word(&mut self, key: StorageKey, word_offset: usize, word: u32) -> bool {
        self.update_bytes(key, word_offset * 4, &word.to_le_bytes())
    }

    fn delete(&mut self, key: StorageKey) -> bool {
        self.entries.remove(&key.raw()).is_some()
    }

    fn keys(&self) -> Vec<StorageKey> {
        self.entries.keys().copied().map(StorageKey::from).collect()
    }

    fn wipe(&mut self) {
        self.entries.clear();
        self.active_version = super::model::NORCOW_VERSION;
    }

    fn active_version(&self) -> u32 {
        self.active_version
    }

    fn set_active_version(&mut self, version: u32) {
        self.active_version = version;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_get_roundtrips() {
        let mut backend = MemoryNorcow::new();
        let key = StorageKey::new(0x01, 0x10);
        assert_eq!(backend.set_ex(key, b"hello"), (true, false));
        assert_eq!(backend.get(key), Some(b"hello".to_vec()));
        assert_eq!(backend.set_ex(key, b"world"), (true, true));
        assert_eq!(backend.get(key), Some(b"world".to_vec()));
    }

    #[test]
    fn update_bytes_only_clears_bits() {
        let mut backend = MemoryNorcow::new();
        let key = StorageKey::new(0x01, 0x10);
        backend.set_ex(key, &[0xFF, 0xFF, 0xFF]);
        assert!(backend.update_bytes(key, 1, &[0b1010_1010]));
        assert_eq!(backend.get(key).unwrap(), vec![0xFF, 0b1010_1010, 0xFF]);
        // attempting to set a cleared bit back to 1 has no effect (AND semantics).
        assert!(backend.update_bytes(key, 1, &[0xFF]));
        assert_eq!(backend.get(key).unwrap()[1], 0b1010_1010);
    }

    #[test]
    fn update_bytes_out_of_range_fails() {
        let mut backend = MemoryNorcow::new();
        let key = StorageKey::new(0x01, 0x10);
        backend.set_ex(key, &[0xFF, 0xFF]);
        assert!(!backend.update_bytes(key, 1, &[0x00, 0x00]));
    }

    #[test]
    fn wipe_clears_entries_and_sets_current_version() {
        let mut backend = MemoryNorcow::new();
        backend.set_ex(StorageKey::new(0x01, 0x10), b"x");
        backend.wipe();
        assert!(backend.keys().is_empty());
        assert_eq!(backend.active_version(), super::super::model::NORCOW_VERSION);
    }
}
