use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::wire::Update;

use super::{ChannelRecord, Store, StoreError};

// Process-local store; the default engine. Records do not survive a restart,
// which matches the edge's contract of "flush what is persisted at flush
// time" for deployments that run a shared store elsewhere.
pub struct MemoryStore {
    devices: Mutex<HashMap<String, HashMap<String, ChannelRecord>>>,
    max_channels: usize,
    update_ttl: Duration,
}

impl MemoryStore {
    pub fn new(max_channels: usize, update_ttl: Duration) -> Self {
        Self {
            devices: Mutex::new(HashMap::new()),
            max_channels,
            update_ttl,
        }
    }

    fn expiry_cutoff(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if self.update_ttl.is_zero() {
            return None;
        }
        now.checked_sub_signed(chrono::Duration::from_std(self.update_ttl).ok()?)
    }

    #[cfg(test)]
    pub(crate) fn backdate_update(&self, device_id: &str, channel_id: &str, by: Duration) {
        let mut devices = self.devices.lock().expect("memory store lock poisoned");
        if let Some(record) = devices
            .get_mut(device_id)
            .and_then(|channels| channels.get_mut(channel_id))
        {
            record.updated_at -= chrono::Duration::from_std(by).expect("backdate should convert");
        }
    }
}

impl Store for MemoryStore {
    fn register(&self, device_id: &str, channel_id: &str, version: u64) -> Result<(), StoreError> {
        let mut devices = self.devices.lock().expect("memory store lock poisoned");
        let channels = devices.entry(device_id.to_owned()).or_default();
        if !channels.contains_key(channel_id) && channels.len() >= self.max_channels {
            return Err(StoreError::ChannelCeilingExceeded {
                limit: self.max_channels,
            });
        }

        channels.insert(
            channel_id.to_owned(),
            ChannelRecord {
                version,
                updated_at: Utc::now(),
            },
        );
        Ok(())
    }

    fn unregister(&self, device_id: &str, channel_id: &str) -> Result<(), StoreError> {
        let mut devices = self.devices.lock().expect("memory store lock poisoned");
        if let Some(channels) = devices.get_mut(device_id) {
            channels.remove(channel_id);
        }
        Ok(())
    }

    fn update(&self, device_id: &str, channel_id: &str, version: u64) -> Result<(), StoreError> {
        let mut devices = self.devices.lock().expect("memory store lock poisoned");
        let channels = devices.entry(device_id.to_owned()).or_default();
        channels.insert(
            channel_id.to_owned(),
            ChannelRecord {
                version,
                updated_at: Utc::now(),
            },
        );
        Ok(())
    }

    fn drop_update(&self, device_id: &str, channel_id: &str) -> Result<(), StoreError> {
        let mut devices = self.devices.lock().expect("memory store lock poisoned");
        if let Some(record) = devices
            .get_mut(device_id)
            .and_then(|channels| channels.get_mut(channel_id))
        {
            record.version = 0;
            record.updated_at = Utc::now();
        }
        Ok(())
    }

    fn drop_all(&self, device_id: &str) -> Result<(), StoreError> {
        let mut devices = self.devices.lock().expect("memory store lock poisoned");
        devices.remove(device_id);
        Ok(())
    }

    fn exists(&self, device_id: &str) -> bool {
        let devices = self.devices.lock().expect("memory store lock poisoned");
        devices.contains_key(device_id)
    }

    fn fetch_all(
        &self,
        device_id: &str,
        since: DateTime<Utc>,
    ) -> Result<(Vec<Update>, Vec<String>), StoreError> {
        let now = Utc::now();
        let cutoff = self.expiry_cutoff(now);

        let mut devices = self.devices.lock().expect("memory store lock poisoned");
        let Some(channels) = devices.get_mut(device_id) else {
            return Ok((Vec::new(), Vec::new()));
        };

        let mut updates = Vec::new();
        let mut expired = Vec::new();
        for (channel_id, record) in channels.iter_mut() {
            if record.version == 0 || record.updated_at < since {
                continue;
            }
            if cutoff.is_some_and(|cutoff| record.updated_at < cutoff) {
                expired.push(channel_id.clone());
                record.version = 0;
                continue;
            }
            updates.push(Update {
                channel_id: channel_id.clone(),
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
