mod memory;
mod path;
mod sled_backend;

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::StorageConfig;
use crate::logging::Logger;
use crate::wire::Update;

pub use memory::MemoryStore;
use path::expand_home_path;
pub use sled_backend::SledStore;

// Persistent view of one registered channel. `version == 0` means no update
// is pending for it.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct ChannelRecord {
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

// Device/channel/update records live behind this trait; workers treat each
// call as atomic and the store serializes itself.
pub trait Store: Send + Sync {
    fn register(&self, device_id: &str, channel_id: &str, version: u64) -> Result<(), StoreError>;
    fn unregister(&self, device_id: &str, channel_id: &str) -> Result<(), StoreError>;
    // Records an incoming notification version for a registered channel.
    fn update(&self, device_id: &str, channel_id: &str, version: u64) -> Result<(), StoreError>;
    // Clears the pending update; the registration itself stays.
    fn drop_update(&self, device_id: &str, channel_id: &str) -> Result<(), StoreError>;
    fn drop_all(&self, device_id: &str) -> Result<(), StoreError>;
    fn exists(&self, device_id: &str) -> bool;
    fn fetch_all(
        &self,
        device_id: &str,
        since: DateTime<Utc>,
    ) -> Result<(Vec<Update>, Vec<String>), StoreError>;
    fn max_channels(&self) -> usize;
}

#[derive(Debug)]
pub enum StoreError {
    UnsupportedEngine {
        engine: String,
    },
    HomeDirectoryUnavailable,
    CreateDataDir {
        path: PathBuf,
        source: std::io::Error,
    },
    ChannelCeilingExceeded {
        limit: usize,
    },
    SerializeRecord(serde_json::Error),
    DeserializeRecord(serde_json::Error),
    Sled(sled::Error),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedEngine { engine } => write!(
                f,
                "unsupported storage.engine '{engine}'; allowed values: memory, sled"
            ),
            Self::HomeDirectoryUnavailable => {
                write!(f, "cannot resolve storage path because HOME is not set")
            }
            Self::CreateDataDir { path, source } => write!(
                f,
                "failed to create storage data directory '{}': {source}",
                path.display()
            ),
            Self::ChannelCeilingExceeded { limit } => {
                write!(f, "device already holds the maximum of {limit} channels")
            }
            Self::SerializeRecord(source) => {
                write!(f, "failed to serialize channel record: {source}")
            }
            Self::DeserializeRecord(source) => {
                write!(f, "failed to deserialize channel record: {source}")
            }
            Self::Sled(source) => write!(f, "sled storage error: {source}"),
        }
    }
}

impl std::error::Error for StoreError {}

// Builds the store selected by `storage.engine`.
pub fn open_store(config: &StorageConfig, logger: &Logger) -> Result<Arc<dyn Store>, StoreError> {
    let update_ttl = Duration::from_secs(config.update_ttl_secs);
    match config.engine.as_str() {
        "memory" => Ok(Arc::new(MemoryStore::new(
            config.max_channels,
            update_ttl,
        ))),
        "sled" => {
            let data_path = expand_home_path(&config.path)?;
            logger.info(
                Some("store"),
                &format!("opening sled store at '{}'", data_path.display()),
            );
            let store = SledStore::open(&data_path, config.max_channels, update_ttl)?;
            Ok(Arc::new(store))
        }
        other => Err(StoreError::UnsupportedEngine {
            engine: other.to_owned(),
        }),
    }
}
