//! PIN-gated, authenticated key-value storage core for a hardware
//! cryptocurrency wallet.
//!
//! [`storage::StorageHandle`] is the primary API: construct one over any
//! [`storage::NorcowBackend`] and call its methods directly. The free
//! functions in this module wrap a single process-wide handle backed by
//! [`storage::FileNorcow`], mirroring the global-singleton shape of the
//! original firmware API for callers that want exactly one on-device store.

pub mod storage;

use std::path::Path;
use std::sync::{Mutex, OnceLock};

pub use storage::{FileNorcow, MemoryNorcow, NorcowBackend, PinOutcome, StorageConfig, StorageError, StorageHandle, StorageKey, StorageResult, UiCallback};

static HANDLE: OnceLock<Mutex<StorageHandle<FileNorcow>>> = OnceLock::new();

fn handle() -> &'static Mutex<StorageHandle<FileNorcow>> {
    HANDLE.get().expect("storage_init must be called before any other storage_* function")
}

/// Opens (or creates) the on-disk store at `path` and runs the boot
/// sequence. Only the first call actually opens a backend; later calls
/// re-run `init` against the same one, matching the original's idempotent
/// `storage_init`.
pub fn storage_init(path: impl AsRef<Path>, hw_salt_bytes: &[u8], ui_callback: Option<UiCallback>) -> bool {
    let mutex = HANDLE.get_or_init(|| {
        let backend = FileNorcow::open(path.as_ref())
            .unwrap_or_else(|err| panic!("storage: failed to open backend at {}: {err}", path.as_ref().display()));
        Mutex::new(StorageHandle::new(backend, StorageConfig::default()))
    });
    mutex.lock().unwrap().init(hw_salt_bytes, ui_callback)
}

pub fn storage_unlock(pin: u32) -> bool {
    handle().lock().unwrap().unlock(pin)
}

pub fn storage_unlock_outcome(pin: u32) -> PinOutcome {
    handle().lock().unwrap().unlock_outcome(pin)
}

pub fn storage_lock() {
    handle().lock().unwrap().lock();
}

pub fn storage_has_pin() -> bool {
    handle().lock().unwrap().has_pin()
}

pub fn storage_get_pin_rem() -> u32 {
    handle().lock().unwrap().get_pin_rem()
}

pub fn storage_change_pin(old: u32, new: u32) -> bool {
    handle().lock().unwrap().change_pin(old, new)
}

pub fn storage_get(key: u16) -> StorageResult<Option<Vec<u8>>> {
    handle().lock().unwrap().get(StorageKey::from(key))
}

pub fn storage_set(key: u16, bytes: &[u8]) -> StorageResult<()> {
    handle().lock().unwrap().set(StorageKey::from(key), bytes)
}

pub fn storage_delete(key: u16) -> StorageResult<()> {
    handle().lock().unwrap().delete(StorageKey::from(key))
}

pub fn storage_wipe() {
    handle().lock().unwrap().wipe();
}

pub fn is_initialized() -> bool {
    HANDLE.get().is_some_and(|m| m.lock().unwrap().is_initialized())
}

pub fn is_unlocked() -> bool {
    HANDLE.get().is_some_and(|m| m.lock().unwrap().is_unlocked())
}
