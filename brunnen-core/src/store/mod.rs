//! Data access layer
//!
//! Everything the server persists goes through [`Store`]: the well's time
//! series (measurements, logs), the append-only settings and the user and
//! device registries. Two backends exist:
//! - [`InfluxStore`] talks to an InfluxDB v2 server over HTTP
//! - [`MemoryStore`] keeps everything in process (tests, local demos)

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::model::{Device, LogEntry, Measurement, Settings, User};
use crate::protocol::TimeRange;

pub mod influx;
pub mod line_protocol;
pub mod memory;

pub use influx::InfluxStore;
pub use memory::MemoryStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Database rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Database authentication failed")]
    AuthFailed,

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Failed to read query result: {0}")]
    CsvError(#[from] csv::Error),

    #[error("Failed to encode value: {0}")]
    EncodeError(#[from] serde_json::Error),

    #[error("Failed to build line protocol: {0}")]
    LineProtocolError(#[from] influxdb::Error),

    #[error("Timestamp {0} cannot be stored")]
    TimestampOutOfRange(DateTime<Utc>),

    #[error("'{0}' cannot be used as a tag value")]
    InvalidTag(String),
}

/// Persistence for everything the server knows
#[async_trait]
pub trait Store: Send + Sync {
    /// Check the backend is reachable
    async fn ping(&self) -> Result<(), StoreError>;

    // --- Measurements ---

    async fn insert_measurements(&self, rows: &[Measurement]) -> Result<(), StoreError>;

    /// Measurements in the inclusive range, oldest first
    ///
    /// With a window, each field is averaged per window (aligned to the
    /// epoch, stamped with the window end) and truncated to an integer.
    async fn query_measurements(
        &self,
        range: &TimeRange,
        window: Option<Duration>,
    ) -> Result<Vec<Measurement>, StoreError>;

    /// Timestamp of the newest measurement
    async fn latest_measurement(&self) -> Result<Option<DateTime<Utc>>, StoreError>;

    async fn delete_measurements(&self, range: &TimeRange) -> Result<(), StoreError>;

    // --- Logs ---

    async fn insert_logs(&self, rows: &[LogEntry]) -> Result<(), StoreError>;

    async fn query_logs(&self, range: &TimeRange) -> Result<Vec<LogEntry>, StoreError>;

    async fn delete_logs(&self, range: &TimeRange) -> Result<(), StoreError>;

    // --- Settings ---

    /// Append setting values at `at`; later values win per key
    async fn insert_settings(&self, settings: &Settings, at: DateTime<Utc>)
        -> Result<(), StoreError>;

    /// Latest value per key, considering only values written at or after `since`
    async fn query_settings(&self, since: Option<DateTime<Utc>>) -> Result<Settings, StoreError>;

    async fn delete_settings(&self, range: &TimeRange) -> Result<(), StoreError>;

    // --- Users ---

    /// Insert or replace by username
    async fn upsert_user(&self, user: &User) -> Result<(), StoreError>;

    async fn get_user(&self, username: &str) -> Result<Option<User>, StoreError>;

    /// All users sorted by name
    async fn list_users(&self) -> Result<Vec<User>, StoreError>;

    async fn delete_user(&self, username: &str) -> Result<(), StoreError>;

    // --- Devices ---

    /// Insert or replace by device id
    async fn upsert_device(&self, device: &Device) -> Result<(), StoreError>;

    async fn get_device(&self, device_id: &str) -> Result<Option<Device>, StoreError>;

    /// All devices sorted by id
    async fn list_devices(&self) -> Result<Vec<Device>, StoreError>;

    async fn delete_device(&self, device_id: &str) -> Result<(), StoreError>;
}

/// End of the epoch-aligned window `ts` falls into
pub(crate) fn window_end(ts: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    let secs = window.as_secs().max(1) as i64;
    let end = ts.timestamp().div_euclid(secs) * secs + secs;
    DateTime::from_timestamp(end, 0).unwrap_or(ts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_window_end_alignment() {
        let ts = Utc.with_ymd_and_hms(2024, 9, 5, 0, 5, 23).unwrap();
        let end = window_end(ts, Duration::from_secs(60));
        assert_eq!(end, Utc.with_ymd_and_hms(2024, 9, 5, 0, 6, 0).unwrap());

        let on_boundary = Utc.with_ymd_and_hms(2024, 9, 5, 0, 6, 0).unwrap();
        assert_eq!(
            window_end(on_boundary, Duration::from_secs(60)),
            Utc.with_ymd_and_hms(2024, 9, 5, 0, 7, 0).unwrap()
        );
    }
}
