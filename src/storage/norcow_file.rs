//! File-backed `NorcowBackend`.
//!
//! Stands in for real flash in hosted development and in the test suite.
//! Every mutation is applied to an in-memory mirror and then the whole log
//! is re-serialized and persisted with a write-temp, fsync, atomic-rename
//! sequence plus an advisory `flock`, so a crash mid-write can never leave a
//! torn file on disk.
//!
//! This is not what a real device ships: firmware supplies its own
//! `NorcowBackend` directly over raw flash sectors. This implementation
//! exists so the crate is runnable and testable end to end outside of a
//! device.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;

#[cfg(unix)]
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

use super::model::StorageKey;
use super::norcow::NorcowBackend;

const MAGIC: &[u8; 8] = b"NORCOWv1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

#[derive(Debug)]
struct NorcowLock {
    #[allow(dead_code)]
    file: File,
}

impl NorcowLock {
    fn acquire(lock_path: &Path, mode: LockMode) -> Result<Self, NorcowIoError> {
        ensure_parent_dir(lock_path)?;

        #[cfg(unix)]
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .mode(0o600)
            .open(lock_path)?;

        #[cfg(not(unix))]
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(lock_path)?;

        set_permissions_0600(lock_path)?;
        lock_file(&file, mode)?;
        Ok(Self { file })
    }
}

#[derive(Debug, Error)]
pub enum NorcowIoError {
    #[error("io error")]
    Io(#[from] std::io::Error),

    #[error("unsupported platform for file locking")]
    UnsupportedPlatform,

    #[error("failed to acquire file lock")]
    LockFailed,

    #[error("norcow log path has no parent directory")]
    NoParentDir,

    #[error("corrupt norcow log: {0}")]
    Corrupt(&'static str),
}

fn lock_path_for(log_path: &Path) -> PathBuf {
    let mut p = log_path.as_os_str().to_os_string();
    p.push(".lock");
    PathBuf::from(p)
}

fn read_log_bytes(log_path: &Path) -> Result<Vec<u8>, NorcowIoError> {
    let _lock = NorcowLock::acquire(&lock_path_for(log_path), LockMode::Shared)?;

    let mut file = File::open(log_path)?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;
    Ok(buf)
}

fn write_log_bytes_atomic(log_path: &Path, bytes: &[u8]) -> Result<(), NorcowIoError> {
    let _lock = NorcowLock::acquire(&lock_path_for(log_path), LockMode::Exclusive)?;
    ensure_parent_dir(log_path)?;

    let dir = log_path.parent().ok_or(NorcowIoError::NoParentDir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;

    tmp.as_file_mut().write_all(bytes)?;
    tmp.as_file_mut().sync_all()?;

    #[cfg(unix)]
    tmp.as_file().set_permissions(fs::Permissions::from_mode(0o600))?;

    let _persisted = tmp.persist(log_path).map_err(std::io::Error::from)?;
    set_permissions_0600(log_path)?;

    fsync_dir(dir)?;
    Ok(())
}

fn ensure_parent_dir(path: &Path) -> Result<(), NorcowIoError> {
    let parent = path.parent().ok_or(NorcowIoError::NoParentDir)?;
    fs::create_dir_all(parent)?;
    Ok(())
}

fn set_permissions_0600(path: &Path) -> Result<(), NorcowIoError> {
    #[cfg(unix)]
    {
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

fn fsync_dir(dir: &Path) -> Result<(), NorcowIoError> {
    #[cfg(unix)]
    {
        let file = File::open(dir)?;
        file.sync_all()?;
    }
    Ok(())
}

fn lock_file(file: &File, mode: LockMode) -> Result<(), NorcowIoError> {
    #[cfg(unix)]
    unsafe {
        let op = match mode {
            LockMode::Shared => libc::LOCK_SH,
            LockMode::Exclusive => libc::LOCK_EX,
        };

        let rc = libc::flock(file.as_raw_fd(), op);
        if rc == 0 {
            return Ok(());
        }
        return Err(NorcowIoError::LockFailed);
    }

    #[cfg(not(unix))]
    {
        let _ = file;
        let _ = mode;
        Err(NorcowIoError::UnsupportedPlatform)
    }
}

fn serialize(active_version: u32, entries: &BTreeMap<u16, Vec<u8>>) -> Vec<u8> {
    let mut out = Vec::with_capacity(16 + entries.values().map(|v| v.len() + 6).sum::<usize>());
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&active_version.to_le_bytes());
    for (key, value) in entries {
        out.extend_from_slice(&key.to_le_bytes());
        out.extend_from_slice(&(value.len() as u32).to_le_bytes());
        out.extend_from_slice(value);
    }
    out
}

fn deserialize(bytes: &[u8]) -> Result<(u32, BTreeMap<u16, Vec<u8>>), NorcowIoError> {
    if bytes.len() < 12 || &bytes[0..8] != MAGIC {
        return Err(NorcowIoError::Corrupt("bad magic"));
    }
    let active_version = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
    let mut entries = BTreeMap::new();
    let mut cursor = 12usize;
    while cursor < bytes.len() {
        if cursor + 6 > bytes.len() {
            return Err(NorcowIoError::Corrupt("truncated record header"));
        }
        let key = u16::from_le_bytes(bytes[cursor..cursor + 2].try_into().unwrap());
        let len = u32::from_le_bytes(bytes[cursor + 2..cursor + 6].try_into().unwrap()) as usize;
        cursor += 6;
        if cursor + len > bytes.len() {
            return Err(NorcowIoError::Corrupt("truncated record body"));
        }
        entries.insert(key, bytes[cursor..cursor + len].to_vec());
        cursor += len;
    }
    Ok((active_version, entries))
}

/// Crash-safe file-backed norcow log. One OS file holds the whole log; each
/// mutation re-serializes and atomically replaces it.
pub struct FileNorcow {
    path: PathBuf,
    entries: BTreeMap<u16, Vec<u8>>,
    active_version: u32,
}

impl FileNorcow {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, NorcowIoError> {
        let path = path.into();
        if path.exists() {
            let bytes = read_log_bytes(&path)?;
            let (active_version, entries) = deserialize(&bytes)?;
            Ok(Self { path, entries, active_version })
        } else {
            Ok(Self { path, entries: BTreeMap::new(), active_version: 0 })
        }
    }

    fn persist(&self) -> Result<(), NorcowIoError> {
        write_log_bytes_atomic(&self.path, &serialize(self.active_version, &self.entries))
    }
}

impl NorcowBackend for FileNorcow {
    fn get(&self, key: StorageKey) -> Option<Vec<u8>> {
        self.entries.get(&key.raw()).cloned()
    }

    fn set_ex(&mut self, key: StorageKey, value: &[u8]) -> (bool, bool) {
        let was_overwrite = self.entries.insert(key.raw(), value.to_vec()).is_some();
        match self.persist() {
            Ok(()) => (true, was_overwrite),
            Err(err) => {
                log::error!("norcow: persist failed on set_ex({:#06x}): {err}", key.raw());
                (false, was_overwrite)
            }
        }
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
        if let Err(err) = self.persist() {
            log::error!("norcow: persist failed on update_bytes({:#06x}): {err}", key.raw());
            return false;
        }
        true
    }

    fn update_word(&mut self, key: StorageKey, word_offset: usize, word: u32) -> bool {
        self.update_bytes(key, word_offset * 4, &word.to_le_bytes())
    }

    fn delete(&mut self, key: StorageKey) -> bool {
        let removed = self.entries.remove(&key.raw()).is_some();
        if removed {
            if let Err(err) = self.persist() {
                log::error!("norcow: persist failed on delete({:#06x}): {err}", key.raw());
            }
        }
        removed
    }

    fn keys(&self) -> Vec<StorageKey> {
        self.entries.keys().copied().map(StorageKey::from).collect()
    }

    fn wipe(&mut self) {
        self.entries.clear();
        self.active_version = super::model::NORCOW_VERSION;
        if let Err(err) = self.persist() {
            log::error!("norcow: persist failed on wipe: {err}");
        }
    }

    fn active_version(&self) -> u32 {
        self.active_version
    }

    fn set_active_version(&mut self, version: u32) {
        self.active_version = version;
        if let Err(err) = self.persist() {
            log::error!("norcow: persist failed on set_active_version: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_is_atomic_and_permissions_are_restrictive() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("storage.norcow");

        let mut backend = FileNorcow::open(&log_path).unwrap();
        backend.set_ex(StorageKey::new(0x01, 0x10), &[b'a'; 1024]);
        backend.set_ex(StorageKey::new(0x01, 0x11), &[b'b'; 1024]);

        let reopened = FileNorcow::open(&log_path).unwrap();
        assert_eq!(reopened.get(StorageKey::new(0x01, 0x10)), Some(vec![b'a'; 1024]));
        assert_eq!(reopened.get(StorageKey::new(0x01, 0x11)), Some(vec![b'b'; 1024]));

        #[cfg(unix)]
        {
            let mode = fs::metadata(&log_path).unwrap().permissions().mode() & 0o777;
            assert_eq!(mode, 0o600);
        }
    }

    #[test]
    fn update_bytes_only_clears_bits_and_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("storage.norcow");
        let key = StorageKey::new(0x01, 0x10);

        let mut backend = FileNorcow::open(&log_path).unwrap();
        backend.set_ex(key, &[0xFF, 0xFF]);
        assert!(backend.update_bytes(key, 1, &[0b1010_1010]));
        drop(backend);

        let reopened = FileNorcow::open(&log_path).unwrap();
        assert_eq!(reopened.get(key).unwrap(), vec![0xFF, 0b1010_1010]);
    }

    #[test]
    fn wipe_resets_entries_and_version() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("storage.norcow");
        let mut backend = FileNorcow::open(&log_path).unwrap();
        backend.set_ex(StorageKey::new(0x01, 0x10), b"x");
        backend.wipe();
        assert!(backend.keys().is_empty());
        assert_eq!(backend.active_version(), super::super::model::NORCOW_VERSION);
    }
}
