pub mod auth_tag;
pub mod crypto;
pub mod entry;
pub mod error;
pub mod fault;
pub mod kek;
pub mod model;
pub mod norcow;
pub mod norcow_file;
pub mod pin_log;
pub mod protocol;
pub mod upgrade;

pub use error::{PinOutcome, StorageError, StorageResult};
pub use model::StorageKey;
pub use norcow::{MemoryNorcow, NorcowBackend};
pub use norcow_file::{FileNorcow, NorcowIoError};
pub use protocol::{StorageConfig, StorageHandle, UiCallback};
