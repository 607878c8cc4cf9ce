//! Points written to InfluxDB
//!
//! Each record type maps to one measurement. Points are built with the
//! `influxdb` crate and rendered to line protocol for `/api/v2/write`.

use chrono::{DateTime, Utc};
use influxdb::{InfluxDbWriteable, Query, Timestamp, WriteQuery};

use crate::model::{is_valid_name, Device, LogEntry, Measurement, Settings, User};
use crate::time::epoch_nanos;

use super::StoreError;

pub const MEASUREMENT: &str = "water";
pub const LOGS: &str = "logs";
pub const SETTINGS: &str = "settings";
pub const USERS: &str = "users";
pub const DEVICES: &str = "devices";

#[derive(InfluxDbWriteable)]
struct WaterPoint {
    time: Timestamp,
    flow: i64,
    pressure: i64,
    level: i64,
}

#[derive(InfluxDbWriteable)]
struct LogPoint {
    time: Timestamp,
    #[influxdb(tag)]
    level: String,
    message: String,
}

#[derive(InfluxDbWriteable)]
struct UserPoint {
    time: Timestamp,
    #[influxdb(tag)]
    username: String,
    group: String,
    token: String,
}

#[derive(InfluxDbWriteable)]
struct DevicePoint {
    time: Timestamp,
    #[influxdb(tag)]
    device_id: String,
    token: String,
}

fn timestamp(ts: &DateTime<Utc>) -> Result<Timestamp, StoreError> {
    epoch_nanos(ts)
        .map(Timestamp::Nanoseconds)
        .ok_or(StoreError::TimestampOutOfRange(*ts))
}

fn tag(value: &str) -> Result<String, StoreError> {
    if is_valid_name(value) {
        Ok(value.to_string())
    } else {
        Err(StoreError::InvalidTag(value.to_string()))
    }
}

/// Line protocol has no escape for line breaks inside a value
fn single_line(text: &str) -> String {
    text.chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect()
}

fn render(points: impl IntoIterator<Item = WriteQuery>) -> Result<String, StoreError> {
    let mut lines = Vec::new();
    for point in points {
        lines.push(point.build()?.get());
    }
    Ok(lines.join("\n"))
}

pub fn measurements(rows: &[Measurement]) -> Result<String, StoreError> {
    let points = rows
        .iter()
        .map(|m| {
            Ok(WaterPoint {
                time: timestamp(&m.timestamp)?,
                flow: m.flow,
                pressure: m.pressure,
                level: m.level,
            }
            .into_query(MEASUREMENT))
        })
        .collect::<Result<Vec<_>, StoreError>>()?;
    render(points)
}

pub fn logs(rows: &[LogEntry]) -> Result<String, StoreError> {
    let points = rows
        .iter()
        .map(|e| {
            Ok(LogPoint {
                time: timestamp(&e.timestamp)?,
                level: e.level.as_str().to_string(),
                message: single_line(&e.message),
            }
            .into_query(LOGS))
        })
        .collect::<Result<Vec<_>, StoreError>>()?;
    render(points)
}

/// All keys in one point; values are stored as JSON text
pub fn settings(settings: &Settings, at: &DateTime<Utc>) -> Result<String, StoreError> {
    if settings.is_empty() {
        return Ok(String::new());
    }
    let mut point = timestamp(at)?.into_query(SETTINGS);
    for (key, value) in settings {
        point = point.add_field(key.as_str(), serde_json::to_string(value)?);
    }
    render([point])
}

pub fn user(user: &User, at: &DateTime<Utc>) -> Result<String, StoreError> {
    let point = UserPoint {
        time: timestamp(at)?,
        username: tag(&user.username)?,
        group: user.group.as_str().to_string(),
        token: user.token.clone(),
    };
    render([point.into_query(USERS)])
}

pub fn device(device: &Device, at: &DateTime<Utc>) -> Result<String, StoreError> {
    let point = DevicePoint {
        time: timestamp(at)?,
        device_id: tag(&device.device_id)?,
        token: device.token.clone(),
    };
    render([point.into_query(DEVICES)])
}
