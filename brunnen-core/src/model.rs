//! Data model shared by the device and web endpoints
//!
//! Measurements and logs are time series; settings are append-only with
//! latest-value-wins per key; users and devices are keyed records.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One sample from the well sensors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Measurement {
    pub timestamp: DateTime<Utc>,
    pub flow: i64,
    pub pressure: i64,
    pub level: i64,
}

/// Field names a measurement row is made of, in storage order
pub const MEASUREMENT_FIELDS: [&str; 3] = ["flow", "pressure", "level"];

/// Severity of a device log line
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warning" | "warn" => Ok(LogLevel::Warning),
            "error" => Ok(LogLevel::Error),
            _ => Err(UnknownVariant(s.to_string())),
        }
    }
}

/// A device log line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub level: LogLevel,
}

/// Returned when parsing a string into one of the closed enums fails
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown value: {0}")]
pub struct UnknownVariant(pub String);

/// Names of the settings the server keeps for the well
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettingKey {
    Sync,
    Intervals,
    Pump,
    Thresholds,
    Firmware,
    Software,
}

impl SettingKey {
    pub const ALL: [SettingKey; 6] = [
        SettingKey::Sync,
        SettingKey::Intervals,
        SettingKey::Pump,
        SettingKey::Thresholds,
        SettingKey::Firmware,
        SettingKey::Software,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SettingKey::Sync => "sync",
            SettingKey::Intervals => "intervals",
            SettingKey::Pump => "pump",
            SettingKey::Thresholds => "thresholds",
            SettingKey::Firmware => "firmware",
            SettingKey::Software => "software",
        }
    }

    /// Keys a device may overwrite through its sync endpoint
    pub fn device_writable(&self) -> bool {
        matches!(self, SettingKey::Pump)
    }

    /// Keys an operator may overwrite through the browser API
    pub fn web_writable(&self) -> bool {
        matches!(
            self,
            SettingKey::Sync | SettingKey::Intervals | SettingKey::Thresholds | SettingKey::Software
        )
    }
}

impl fmt::Display for SettingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SettingKey {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SettingKey::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| UnknownVariant(s.to_string()))
    }
}

/// Latest value per setting key
pub type Settings = BTreeMap<SettingKey, serde_json::Value>;

/// Access group of an operator account
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Group {
    #[default]
    User,
    Admin,
}

impl Group {
    pub fn as_str(&self) -> &'static str {
        match self {
            Group::User => "user",
            Group::Admin => "admin",
        }
    }
}

impl fmt::Display for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Group {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Group::User),
            "admin" => Ok(Group::Admin),
            _ => Err(UnknownVariant(s.to_string())),
        }
    }
}

/// Operator account. `token` is an argon2 PHC string, never the password.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub username: String,
    pub group: Group,
    pub token: String,
}

/// Registered sensor device. `token` is an argon2 PHC string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub device_id: String,
    pub token: String,
}

/// Whether `name` can be a username or device id
///
/// Both end up as InfluxDB tag values and in `id:token` credentials, so
/// control characters, backslashes and colons are refused.
pub fn is_valid_name(name: &str) -> bool {
    !name.trim().is_empty() && !name.chars().any(|c| c.is_control() || c == '\\' || c == ':')
}

/// Which series a delete request targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Series {
    Data,
    Logs,
    Settings,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_parsing() {
        assert_eq!("INFO".parse::<LogLevel>().unwrap(), LogLevel::Info);
        assert_eq!("warn".parse::<LogLevel>().unwrap(), LogLevel::Warning);
        assert!("fatal".parse::<LogLevel>().is_err());
    }

    #[test]
    fn test_setting_key_serialization() {
        let mut settings = Settings::new();
        settings.insert(SettingKey::Pump, serde_json::json!({ "on": true }));
        let json = serde_json::to_string(&settings).unwrap();
        assert_eq!(json, r#"{"pump":{"on":true}}"#);

        let parsed: Settings = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, settings);
        assert_eq!("thresholds".parse::<SettingKey>().unwrap(), SettingKey::Thresholds);
    }

    #[test]
    fn test_writable_keys() {
        assert!(SettingKey::Pump.device_writable());
        assert!(!SettingKey::Sync.device_writable());
        assert!(SettingKey::Intervals.web_writable());
        assert!(!SettingKey::Firmware.web_writable());
        assert!(!SettingKey::Pump.web_writable());
    }

    #[test]
    fn test_valid_names() {
        assert!(is_valid_name("well-1"));
        assert!(is_valid_name("Anna Berg"));
        assert!(!is_valid_name("  "));
        assert!(!is_valid_name("ops\\"));
        assert!(!is_valid_name("well:1"));
        assert!(!is_valid_name("line\nbreak"));
    }
}
