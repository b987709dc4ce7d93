use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::wire::Update;

use super::{ChannelRecord, Store, StoreError};

const CHANNEL_PREFIX: &str = "v1:c:";

// Durable engine; channel records survive an edge restart so a reconnecting
// device flushes the updates it missed.
pub struct SledStore {
    db: sled::Db,
    max_channels: usize,
    update_ttl: Duration,
}

impl SledStore {
    pub fn open(
        data_path: &Path,
        max_channels: usize,
        update_ttl: Duration,
    ) -> Result<Self, StoreError> {
        if let Some(parent) = data_path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::CreateDataDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let db = sled::Config::new()
            .path(data_path)
            .open()
            .map_err(StoreError::Sled)?;
        Ok(Self {
            db,
            max_channels,
            update_ttl,
        })
    }

    fn expiry_cutoff(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if self.update_ttl.is_zero() {
            return None;
        }
        now.checked_sub_signed(chrono::Duration::from_std(self.update_ttl).ok()?)
    }

    fn put_record(
        &self,
        device_id: &str,
        channel_id: &str,
        record: &ChannelRecord,
    ) -> Result<(), StoreError> {
        let value = serde_json::to_vec(record).map_err(StoreError::SerializeRecord)?;
        self.db
            .insert(channel_key(device_id, channel_id), value)
            .map_err(StoreError::Sled)?;
        self.db.flush().map_err(StoreError::Sled)?;
        Ok(())
    }

    fn get_record(
        &self,
        device_id: &str,
        channel_id: &str,
    ) -> Result<Option<ChannelRecord>, StoreError> {
        let value = self
            .db
            .get(channel_key(device_id, channel_id))
            .map_err(StoreError::Sled)?;
        value
            .map(|raw| {
                serde_json::from_slice(raw.as_ref()).map_err(StoreError::DeserializeRecord)
            })
            .transpose()
    }

    fn channel_count(&self, device_id: &str) -> Result<usize, StoreError> {
        let mut count = 0;
        for entry in self.db.scan_prefix(device_prefix(device_id)) {
            entry.map_err(StoreError::Sled)?;
            count += 1;
        }
        Ok(count)
    }
}

fn device_prefix(device_id: &str) -> Vec<u8> {
    format!("{CHANNEL_PREFIX}{device_id}:").into_bytes()
}

fn channel_key(device_id: &str, channel_id: &str) -> Vec<u8> {
    format!("{CHANNEL_PREFIX}{device_id}:{channel_id}").into_bytes()
}

fn channel_id_from_key(device_id: &str, key: &[u8]) -> Option<String> {
    let key = std::str::from_utf8(key).ok()?;
    key.strip_prefix(&format!("{CHANNEL_PREFIX}{device_id}:"))
        .map(str::to_owned)
}

impl Store for SledStore {
    fn register(&self, device_id: &str, channel_id: &str, version: u64) -> Result<(), StoreError> {
        if self.get_record(device_id, channel_id)?.is_none()
            && self.channel_count(device_id)? >= self.max_channels
        {
            return Err(StoreError::ChannelCeilingExceeded {
                limit: self.max_channels,
            });
        }

        self.put_record(
            device_id,
            channel_id,
            &ChannelRecord {
                version,
                updated_at: Utc::now(),
            },
        )
    }

    fn unregister(&self, device_id: &str, channel_id: &str) -> Result<(), StoreError> {
        self.db
            .remove(channel_key(device_id, channel_id))
            .map_err(StoreError::Sled)?;
        self.db.flush().map_err(StoreError::Sled)?;
        Ok(())
    }

    fn update(&self, device_id: &str, channel_id: &str, version: u64) -> Result<(), StoreError> {
        self.put_record(
            device_id,
            channel_id,
            &ChannelRecord {
                version,
                updated_at: Utc::now(),
            },
        )
    }

    fn drop_update(&self, device_id: &str, channel_id: &str) -> Result<(), StoreError> {
        if self.get_record(device_id, channel_id)?.is_some() {
            self.put_record(
                device_id,
                channel_id,
                &ChannelRecord {
                    version: 0,
                    updated_at: Utc::now(),
                },
            )?;
        }
        Ok(())
    }

    fn drop_all(&self, device_id: &str) -> Result<(), StoreError> {
        let mut batch = sled::Batch::default();
        for entry in self.db.scan_prefix(device_prefix(device_id)) {
            let (key, _) = entry.map_err(StoreError::Sled)?;
            batch.remove(key);
        }
        self.db.apply_batch(batch).map_err(StoreError::Sled)?;
        self.db.flush().map_err(StoreError::Sled)?;
        Ok(())
    }

    fn exists(&self, device_id: &str) -> bool {
        self.db
            .scan_prefix(device_prefix(device_id))
            .next()
            .and_then(Result::ok)
            .is_some()
    }

    fn fetch_all(
        &self,
        device_id: &str,
        since: DateTime<Utc>,
    ) -> Result<(Vec<Update>, Vec<String>), StoreError> {
        let now = Utc::now();
        let cutoff = self.expiry_cutoff(now);

        let mut updates = Vec::new();
        let mut expired = Vec::new();
        for entry in self.db.scan_prefix(device_prefix(device_id)) {
            let (key, value) = entry.map_err(StoreError::Sled)?;
            let Some(channel_id) = channel_id_from_key(device_id, key.as_ref()) else {
                continue;
            };
            let record: ChannelRecord =
                serde_json::from_slice(value.as_ref()).map_err(StoreError::DeserializeRecord)?;

            if record.version == 0 || record.updated_at < since {
                continue;
            }
            if cutoff.is_some_and(|cutoff| record.updated_at < cutoff) {
                expired.push(channel_id.clone());
                self.put_record(
                    device_id,
                    &channel_id,
                    &ChannelRecord {
                        version: 0,
                        updated_at: record.updated_at,
                    },
                )?;
                continue;
            }
            updates.push(Update {
                channel_id,
                version: record.version,
            });
        }

        updates.sort_by(|a, b| a.channel_id.cmp(&b.channel_id));
        expired.sort();
        Ok((updates, expired))
    }

    fn max_channels(&self) -> usize {
        self.max_channels
    }
}
