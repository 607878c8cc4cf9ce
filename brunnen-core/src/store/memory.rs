//! In-process store
//!
//! Mirrors InfluxDB point identity: a point with the same series and
//! timestamp replaces the previous one.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::model::{Device, LogEntry, LogLevel, Measurement, SettingKey, Settings, User};
use crate::protocol::TimeRange;

use super::{window_end, Store, StoreError};

#[derive(Debug, Default)]
struct Inner {
    measurements: BTreeMap<DateTime<Utc>, Measurement>,
    logs: BTreeMap<(DateTime<Utc>, LogLevel), LogEntry>,
    settings: BTreeMap<(SettingKey, DateTime<Utc>), serde_json::Value>,
    users: BTreeMap<String, User>,
    devices: BTreeMap<String, Device>,
}

/// Store backed by ordered maps behind a lock
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn aggregate(rows: Vec<Measurement>, window: Duration) -> Vec<Measurement> {
    // Sums of full-range i64 values need the wider accumulator.
    let mut buckets: BTreeMap<DateTime<Utc>, (i128, i128, i128, i128)> = BTreeMap::new();
    for m in rows {
        let entry = buckets.entry(window_end(m.timestamp, window)).or_default();
        entry.0 += i128::from(m.flow);
        entry.1 += i128::from(m.pressure);
        entry.2 += i128::from(m.level);
        entry.3 += 1;
    }

    buckets
        .into_iter()
        .map(|(timestamp, (flow, pressure, level, n))| {
            // The mean of i64 values fits in i64; truncates toward zero.
            let mean = |sum: i128| (sum / n) as i64;
            Measurement {
                timestamp,
                flow: mean(flow),
                pressure: mean(pressure),
                level: mean(level),
            }
        })
        .collect()
}

#[async_trait]
impl Store for MemoryStore {
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn insert_measurements(&self, rows: &[Measurement]) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        for m in rows {
            inner.measurements.insert(m.timestamp, *m);
        }
        Ok(())
    }

    async fn query_measurements(
        &self,
        range: &TimeRange,
        window: Option<Duration>,
    ) -> Result<Vec<Measurement>, StoreError> {
        let inner = self.inner.read().await;
        let rows: Vec<Measurement> = inner
            .measurements
            .range(range.start..=range.stop)
            .map(|(_, m)| *m)
            .collect();

        Ok(match window {
            Some(window) => aggregate(rows, window),
            None => rows,
        })
    }

    async fn latest_measurement(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.measurements.keys().next_back().copied())
    }

    async fn delete_measurements(&self, range: &TimeRange) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.measurements.retain(|ts, _| !range.contains(ts));
        Ok(())
    }

    async fn insert_logs(&self, rows: &[LogEntry]) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        for e in rows {
            inner.logs.insert((e.timestamp, e.level), e.clone());
        }
        Ok(())
    }

    async fn query_logs(&self, range: &TimeRange) -> Result<Vec<LogEntry>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .logs
            .values()
            .filter(|e| range.contains(&e.timestamp))
            .cloned()
            .collect())
    }

    async fn delete_logs(&self, range: &TimeRange) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.logs.retain(|(ts, _), _| !range.contains(ts));
        Ok(())
    }

    async fn insert_settings(
        &self,
        settings: &Settings,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        for (key, value) in settings {
            inner.settings.insert((*key, at), value.clone());
        }
        Ok(())
    }

    async fn query_settings(&self, since: Option<DateTime<Utc>>) -> Result<Settings, StoreError> {
        let inner = self.inner.read().await;
        let mut latest = Settings::new();
        // Keys are ordered by (key, time), so later writes overwrite earlier ones.
        for ((key, ts), value) in &inner.settings {
            if since.is_none_or(|since| *ts >= since) {
                latest.insert(*key, value.clone());
            }
        }
        Ok(latest)
    }

    async fn delete_settings(&self, range: &TimeRange) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.settings.retain(|(_, ts), _| !range.contains(ts));
        Ok(())
    }

    async fn upsert_user(&self, user: &User) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.users.insert(user.username.clone(), user.clone());
        Ok(())
    }

    async fn get_user(&self, username: &str) -> Result<Option<User>, StoreError> {
        Ok(self.inner.read().await.users.get(username).cloned())
    }

    async fn list_users(&self) -> Result<Vec<User>, StoreError> {
        Ok(self.inner.read().await.users.values().cloned().collect())
    }

    async fn delete_user(&self, username: &str) -> Result<(), StoreError> {
        self.inner.write().await.users.remove(username);
        Ok(())
    }

    async fn upsert_device(&self, device: &Device) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.devices.insert(device.device_id.clone(), device.clone());
        Ok(())
    }

    async fn get_device(&self, device_id: &str) -> Result<Option<Device>, StoreError> {
        Ok(self.inner.read().await.devices.get(device_id).cloned())
    }

    async fn list_devices(&self) -> Result<Vec<Device>, StoreError> {
        Ok(self.inner.read().await.devices.values().cloned().collect())
    }

    async fn delete_device(&self, device_id: &str) -> Result<(), StoreError> {
        self.inner.write().await.devices.remove(device_id);
        Ok(())
    }
}
