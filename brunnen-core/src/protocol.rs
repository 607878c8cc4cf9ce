//! JSON bodies exchanged with the device and the browser
//!
//! Device uploads are loosely shaped (timestamp-keyed objects), so they are
//! deserialized into raw JSON first and converted here. Conversion errors say
//! which part of the payload is wrong.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::model::{
    Group, LogEntry, LogLevel, Measurement, Series, SettingKey, Settings, MEASUREMENT_FIELDS,
};
use crate::time::{format_timestamp, parse_timestamp, TimeError};

/// Problems with the query string or body of a request
#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("Missing parameter '{0}'.")]
    MissingParameter(&'static str),

    #[error("Problem while parsing parameter '{name}': {source}")]
    InvalidParameter {
        name: &'static str,
        #[source]
        source: TimeError,
    },

    #[error("Invalid time period: stop time has to be later than start time.")]
    InvertedRange,

    #[error("Missing '{0}' field.")]
    MissingField(&'static str),

    #[error("Column '{0}' is missing.")]
    MissingColumn(&'static str),

    #[error("Number of given columns and actual value columns does not match at {0}.")]
    ColumnMismatch(String),

    #[error("Value '{value}' of column '{column}' at {timestamp} is not an integer.")]
    NotAnInteger {
        timestamp: String,
        column: String,
        value: Value,
    },

    #[error("Invalid timestamp in payload: {0}")]
    InvalidTimestamp(#[from] TimeError),

    #[error("Parameter '{0}' does not match the {0} of the given data.")]
    RangeMismatch(&'static str),

    #[error("Log entry at {0} must be [message, level].")]
    MalformedLog(String),

    #[error("Unknown log level '{level}' at {timestamp}.")]
    UnknownLevel { timestamp: String, level: String },

    #[error("Value of '{0}' must be an object of numbers.")]
    NotNumeric(SettingKey),

    #[error("Setting '{0}' cannot be written here.")]
    NotWritable(String),
}

/// Inclusive time period from `start` and `stop` query parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub stop: DateTime<Utc>,
}

impl TimeRange {
    /// Parse the raw query values
    ///
    /// Missing values and an inverted period are unprocessable; values that
    /// are not timestamps are malformed.
    pub fn parse(start: Option<&str>, stop: Option<&str>) -> Result<Self, PayloadError> {
        let start = start.ok_or(PayloadError::MissingParameter("start"))?;
        let start = parse_timestamp(start).map_err(|source| PayloadError::InvalidParameter {
            name: "start",
            source,
        })?;

        let stop = stop.ok_or(PayloadError::MissingParameter("stop"))?;
        let stop = parse_timestamp(stop).map_err(|source| PayloadError::InvalidParameter {
            name: "stop",
            source,
        })?;

        if start > stop {
            return Err(PayloadError::InvertedRange);
        }
        Ok(Self { start, stop })
    }

    pub fn contains(&self, ts: &DateTime<Utc>) -> bool {
        *ts >= self.start && *ts <= self.stop
    }
}

/// Query string of the time-ranged endpoints
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RangeQuery {
    pub start: Option<String>,
    pub stop: Option<String>,
    /// Aggregation window in seconds
    pub window: Option<u64>,
}

impl RangeQuery {
    pub fn range(&self) -> Result<TimeRange, PayloadError> {
        TimeRange::parse(self.start.as_deref(), self.stop.as_deref())
    }
}

/// Body of a device `POST /device/brunnen`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeviceUpload {
    pub data: Option<DataUpload>,
    /// `{ "<timestamp>": ["message", "level"] }`
    pub logs: Option<Map<String, Value>>,
    pub settings: Option<Map<String, Value>>,
}

/// Column-oriented measurement upload
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DataUpload {
    pub columns: Option<Vec<String>>,
    /// `{ "<timestamp>": [v1, v2, ...] }` in the order of `columns`
    pub values: Option<Map<String, Value>>,
}

impl DataUpload {
    /// Convert rows into measurements sorted by time
    ///
    /// The first and last timestamp must equal the announced period.
    pub fn into_measurements(self, range: &TimeRange) -> Result<Vec<Measurement>, PayloadError> {
        let columns = self.columns.ok_or(PayloadError::MissingField("columns"))?;
        let values = self.values.ok_or(PayloadError::MissingField("values"))?;

        let mut index = [0usize; 3];
        for (slot, field) in index.iter_mut().zip(MEASUREMENT_FIELDS) {
            *slot = columns
                .iter()
                .position(|c| c == field)
                .ok_or(PayloadError::MissingColumn(field))?;
        }

        let mut rows = Vec::with_capacity(values.len());
        for (raw_ts, row) in values {
            let row = match row {
                Value::Array(row) if row.len() == columns.len() => row,
                _ => return Err(PayloadError::ColumnMismatch(raw_ts)),
            };
            let timestamp = parse_timestamp(&raw_ts)?;

            let mut fields = [0i64; 3];
            for (field, &col) in fields.iter_mut().zip(index.iter()) {
                *field = row[col]
                    .as_i64()
                    .ok_or_else(|| PayloadError::NotAnInteger {
                        timestamp: raw_ts.clone(),
                        column: columns[col].clone(),
                        value: row[col].clone(),
                    })?;
            }

            rows.push(Measurement {
                timestamp,
                flow: fields[0],
                pressure: fields[1],
                level: fields[2],
            });
        }

        rows.sort_by_key(|m| m.timestamp);
        if let (Some(first), Some(last)) = (rows.first(), rows.last()) {
            if first.timestamp != range.start {
                return Err(PayloadError::RangeMismatch("start"));
            }
            if last.timestamp != range.stop {
                return Err(PayloadError::RangeMismatch("stop"));
            }
        }
        Ok(rows)
    }
}

/// Convert `{ "<timestamp>": ["message", "level"] }` into log entries
pub fn logs_from_payload(logs: Map<String, Value>) -> Result<Vec<LogEntry>, PayloadError> {
    let mut entries = Vec::with_capacity(logs.len());
    for (raw_ts, entry) in logs {
        let (message, level) = match &entry {
            Value::Array(parts) if parts.len() == 2 => match (&parts[0], &parts[1]) {
                (Value::String(m), Value::String(l)) => (m.clone(), l.clone()),
                _ => return Err(PayloadError::MalformedLog(raw_ts)),
            },
            _ => return Err(PayloadError::MalformedLog(raw_ts)),
        };

        let timestamp = parse_timestamp(&raw_ts)?;
        let level: LogLevel = level.parse().map_err(|_| PayloadError::UnknownLevel {
            timestamp: raw_ts.clone(),
            level,
        })?;

        entries.push(LogEntry {
            timestamp,
            message,
            level,
        });
    }
    entries.sort_by_key(|e| e.timestamp);
    Ok(entries)
}

/// Keep only the keys `writable` allows; unknown or protected keys are dropped
pub fn filter_settings<F>(raw: Map<String, Value>, writable: F) -> Settings
where
    F: Fn(&SettingKey) -> bool,
{
    raw.into_iter()
        .filter_map(|(key, value)| {
            let key: SettingKey = key.parse().ok()?;
            writable(&key).then_some((key, value))
        })
        .collect()
}

/// Parse an operator settings update, rejecting keys the browser may not write
pub fn settings_from_web(raw: Map<String, Value>) -> Result<Settings, PayloadError> {
    let mut settings = Settings::new();
    for (key, value) in raw {
        let parsed: SettingKey = key
            .parse()
            .map_err(|_| PayloadError::NotWritable(key.clone()))?;
        if !parsed.web_writable() {
            return Err(PayloadError::NotWritable(key));
        }
        if matches!(parsed, SettingKey::Intervals | SettingKey::Thresholds) {
            require_numeric_object(parsed, &value)?;
        }
        settings.insert(parsed, value);
    }
    Ok(settings)
}

/// Intervals and thresholds are flat objects of numbers
pub fn require_numeric_object(key: SettingKey, value: &Value) -> Result<(), PayloadError> {
    match value {
        Value::Object(map) if map.values().all(Value::is_number) => Ok(()),
        _ => Err(PayloadError::NotNumeric(key)),
    }
}

/// Body of a `DELETE` on the device or browser settings endpoints
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeleteRequest {
    pub select: Option<Vec<String>>,
}

impl DeleteRequest {
    /// Selected series; unknown names are ignored
    pub fn series(&self) -> Result<Vec<Series>, PayloadError> {
        let select = self.select.as_ref().ok_or(PayloadError::MissingField("select"))?;
        Ok(select
            .iter()
            .filter_map(|s| serde_json::from_value(Value::String(s.clone())).ok())
            .collect())
    }
}

/// Reply to every device sync
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settings: Option<Settings>,
}

impl SyncResponse {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings: (!settings.is_empty()).then_some(settings),
        }
    }
}

/// Column-oriented table used by the dashboard charts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Table {
    pub columns: Vec<String>,
    pub data: Vec<Vec<Value>>,
}

impl Table {
    pub fn from_measurements(rows: &[Measurement]) -> Self {
        Self {
            columns: ["timestamp", "flow", "pressure", "level"]
                .into_iter()
                .map(String::from)
                .collect(),
            data: rows
                .iter()
                .map(|m| {
                    vec![
                        Value::String(format_timestamp(&m.timestamp)),
                        m.flow.into(),
                        m.pressure.into(),
                        m.level.into(),
                    ]
                })
                .collect(),
        }
    }

    pub fn from_logs(rows: &[LogEntry]) -> Self {
        Self {
            columns: ["timestamp", "message", "level"]
                .into_iter()
                .map(String::from)
                .collect(),
            data: rows
                .iter()
                .map(|e| {
                    vec![
                        Value::String(format_timestamp(&e.timestamp)),
                        Value::String(e.message.clone()),
                        Value::String(e.level.to_string()),
                    ]
                })
                .collect(),
        }
    }
}

/// Browser login
#[derive(Debug, Clone, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginResponse {
    pub username: String,
    pub group: Group,
    pub expires_in: u64,
}

/// Create or update an operator account
#[derive(Debug, Clone, Deserialize)]
pub struct UserRequest {
    pub username: String,
    /// Required when creating, optional when only changing the group
    pub password: Option<String>,
    pub group: Option<Group>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserResponse {
    pub username: String,
    pub group: Group,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PasswordChange {
    pub current: String,
    pub new: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UsernameQuery {
    pub username: Option<String>,
}

/// Register a device; a token is generated when none is given
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceRequest {
    pub device_id: String,
    pub token: Option<String>,
}

/// Returned once on registration; the token is not retrievable later
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceCreated {
    pub device_id: String,
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceResponse {
    pub device_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceQuery {
    pub device_id: Option<String>,
}

/// Browser settings write
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SettingsUpdate {
    pub settings: Option<Map<String, Value>>,
}

/// Recent activity as seen by the dashboard
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncStatus {
    pub mode: crate::sync::SyncMode,
    pub period: u64,
    pub last_visit: DateTime<Utc>,
    /// Latest sync per device id
    pub last_sync: BTreeMap<String, DateTime<Utc>>,
    pub latest_measurement: Option<DateTime<Utc>>,
    pub requests: u64,
}

/// Value of the `firmware` setting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareInfo {
    pub version: String,
    pub file: String,
    pub size: u64,
    pub uploaded: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FirmwareQuery {
    pub version: Option<String>,
}
