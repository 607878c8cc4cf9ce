//! Adaptive synchronization interval for the well device
//!
//! The device asks the server for its settings on every sync. How often it
//! does so depends on whether somebody is looking at the dashboard:
//! - short: an operator visited recently, poll in near real time
//! - medium: nobody around, stand by
//! - long: nobody around for a long time and it is night, sleep
//!
//! The mode is a pure function of the last visit, the device's previous sync
//! and the current time. It is stored inside the `sync` setting so the device
//! learns about changes through the normal settings snapshot.

use std::fmt;

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Invalid sync setting: {0}")]
    InvalidValue(#[from] serde_json::Error),

    #[error("Thresholds must satisfy short <= medium <= long (got {short}/{medium}/{long})")]
    ThresholdOrder { short: u64, medium: u64, long: u64 },

    #[error("Daytime hours must be below 24 (got {start}..{stop})")]
    InvalidDaytime { start: u32, stop: u32 },
}

/// Device polling tier
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Real time
    #[default]
    Short,
    /// Standby
    Medium,
    /// Sleep
    Long,
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SyncMode::Short => "short",
            SyncMode::Medium => "medium",
            SyncMode::Long => "long",
        })
    }
}

/// Value of the `sync` setting
///
/// `short`, `medium` and `long` are in seconds. They are both the polling
/// period the device uses in that mode and the visit age at which the
/// server steps down to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSettings {
    #[serde(default)]
    pub mode: SyncMode,

    #[serde(default = "default_short")]
    pub short: u64,

    #[serde(default = "default_medium")]
    pub medium: u64,

    #[serde(default = "default_long")]
    pub long: u64,

    /// First daytime hour (UTC, inclusive)
    #[serde(default = "default_day_start")]
    pub day_start: u32,

    /// End of daytime (UTC hour, exclusive)
    #[serde(default = "default_day_stop")]
    pub day_stop: u32,
}

fn default_short() -> u64 {
    10
}
fn default_medium() -> u64 {
    600 // 10 minutes
}
fn default_long() -> u64 {
    3600 // 1 hour
}
fn default_day_start() -> u32 {
    7
}
fn default_day_stop() -> u32 {
    19
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            mode: SyncMode::default(),
            short: default_short(),
            medium: default_medium(),
            long: default_long(),
            day_start: default_day_start(),
            day_stop: default_day_stop(),
        }
    }
}

/// Timestamps the mode is derived from
#[derive(Debug, Clone, Copy)]
pub struct SyncContext {
    /// Last authenticated browser request
    pub last_visit: DateTime<Utc>,
    /// Previous sync of the requesting device, if any since startup
    pub last_sync: Option<DateTime<Utc>>,
    /// Time of the current sync
    pub now: DateTime<Utc>,
}

/// Outcome of applying the state machine to a stored setting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: SyncMode,
    pub to: SyncMode,
}

impl Transition {
    pub fn changed(&self) -> bool {
        self.from != self.to
    }
}

impl SyncSettings {
    /// Parse and validate a stored `sync` value
    pub fn from_value(value: &serde_json::Value) -> Result<Self, SyncError> {
        let settings: SyncSettings = serde_json::from_value(value.clone())?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        if self.short > self.medium || self.medium > self.long {
            return Err(SyncError::ThresholdOrder {
                short: self.short,
                medium: self.medium,
                long: self.long,
            });
        }
        if self.day_start >= 24 || self.day_stop >= 24 {
            return Err(SyncError::InvalidDaytime {
                start: self.day_start,
                stop: self.day_stop,
            });
        }
        Ok(())
    }

    /// Whether `now` falls into the daytime window `[day_start, day_stop)`
    ///
    /// A window with `day_start > day_stop` wraps midnight. An empty window
    /// (`day_start == day_stop`) means it is always night.
    pub fn is_daytime(&self, now: DateTime<Utc>) -> bool {
        let hour = now.hour();
        if self.day_start <= self.day_stop {
            hour >= self.day_start && hour < self.day_stop
        } else {
            hour >= self.day_start || hour < self.day_stop
        }
    }

    /// Mode the device should be in, given the visit history
    ///
    /// Both thresholds count once reached: a visit exactly `medium` seconds
    /// old already gives medium, exactly `long` seconds old gives long at night.
    pub fn evaluate(&self, ctx: &SyncContext) -> SyncMode {
        if let Some(last_sync) = ctx.last_sync {
            if last_sync <= ctx.last_visit {
                return SyncMode::Short;
            }
        }

        let delta = (ctx.now - ctx.last_visit).num_seconds();
        if delta < self.medium as i64 {
            SyncMode::Short
        } else if delta >= self.long as i64 && !self.is_daytime(ctx.now) {
            SyncMode::Long
        } else {
            SyncMode::Medium
        }
    }

    /// Evaluate and store the new mode
    pub fn apply(&mut self, ctx: &SyncContext) -> Transition {
        let from = self.mode;
        self.mode = self.evaluate(ctx);
        Transition { from, to: self.mode }
    }

    /// Polling period the device uses in its current mode
    pub fn period(&self) -> std::time::Duration {
        let secs = match self.mode {
            SyncMode::Short => self.short,
            SyncMode::Medium => self.medium,
            SyncMode::Long => self.long,
        };
        std::time::Duration::from_secs(secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 9, 5, hour, 30, 0).unwrap()
    }

    fn ctx(now: DateTime<Utc>, visit_age_secs: i64) -> SyncContext {
        SyncContext {
            last_visit: now - Duration::seconds(visit_age_secs),
            last_sync: Some(now - Duration::seconds(5)),
            now,
        }
    }

    #[test]
    fn test_recent_visit_is_short() {
        let settings = SyncSettings::default();
        for hour in [2, 12, 22] {
            assert_eq!(settings.evaluate(&ctx(at(hour), 0)), SyncMode::Short);
            assert_eq!(settings.evaluate(&ctx(at(hour), 599)), SyncMode::Short);
        }
    }

    #[test]
    fn test_visit_since_last_sync_is_short() {
        let settings = SyncSettings::default();
        let now = at(2);
        let c = SyncContext {
            last_visit: now - Duration::seconds(7200),
            last_sync: Some(now - Duration::seconds(10_800)),
            now,
        };
        assert_eq!(settings.evaluate(&c), SyncMode::Short);
    }

    #[test]
    fn test_standby_between_thresholds() {
        let settings = SyncSettings::default();
        assert_eq!(settings.evaluate(&ctx(at(2), 600)), SyncMode::Medium);
        assert_eq!(settings.evaluate(&ctx(at(12), 3599)), SyncMode::Medium);
    }

    #[test]
    fn test_thresholds_count_once_reached() {
        let settings = SyncSettings::default();
        for mode in [SyncMode::Short, SyncMode::Medium, SyncMode::Long] {
            let current = SyncSettings { mode, ..settings.clone() };
            assert_eq!(current.evaluate(&ctx(at(2), 599)), SyncMode::Short);
            assert_eq!(current.evaluate(&ctx(at(2), 600)), SyncMode::Medium);
            assert_eq!(current.evaluate(&ctx(at(2), 3599)), SyncMode::Medium);
            assert_eq!(current.evaluate(&ctx(at(2), 3600)), SyncMode::Long);
        }
    }

    #[test]
    fn test_long_only_at_night() {
        let settings = SyncSettings::default();
        assert_eq!(settings.evaluate(&ctx(at(2), 3600)), SyncMode::Long);
        assert_eq!(settings.evaluate(&ctx(at(22), 86_400)), SyncMode::Long);
        assert_eq!(settings.evaluate(&ctx(at(12), 86_400)), SyncMode::Medium);
        assert_eq!(settings.evaluate(&ctx(at(7), 86_400)), SyncMode::Medium);
        assert_eq!(settings.evaluate(&ctx(at(19), 86_400)), SyncMode::Long);
    }

    #[test]
    fn test_first_sync_uses_visit_age() {
        let settings = SyncSettings::default();
        let now = at(2);
        let c = SyncContext {
            last_visit: now - Duration::seconds(7200),
            last_sync: None,
            now,
        };
        assert_eq!(settings.evaluate(&c), SyncMode::Long);
    }

    #[test]
    fn test_mode_is_monotone_in_visit_age() {
        let settings = SyncSettings::default();
        for hour in 0..24 {
            let mut previous = SyncMode::Short;
            for age in (0..10_000).step_by(50) {
                let mode = settings.evaluate(&ctx(at(hour), age));
                assert!(mode >= previous, "hour {hour}, age {age}");
                previous = mode;
            }
        }
    }

    #[test]
    fn test_wrapping_daytime_window() {
        let settings = SyncSettings {
            day_start: 22,
            day_stop: 6,
            ..Default::default()
        };
        assert!(settings.is_daytime(at(23)));
        assert!(settings.is_daytime(at(3)));
        assert!(!settings.is_daytime(at(12)));
    }

    #[test]
    fn test_apply_reports_transition() {
        let mut settings = SyncSettings::default();
        let t = settings.apply(&ctx(at(2), 0));
        assert!(!t.changed());

        let t = settings.apply(&ctx(at(2), 900));
        assert!(t.changed());
        assert_eq!(t.from, SyncMode::Short);
        assert_eq!(t.to, SyncMode::Medium);
        assert_eq!(settings.mode, SyncMode::Medium);
        assert_eq!(settings.period(), std::time::Duration::from_secs(600));
    }

    #[test]
    fn test_from_value_fills_defaults_and_validates() {
        let settings =
            SyncSettings::from_value(&serde_json::json!({ "mode": "long", "medium": 60 })).unwrap();
        assert_eq!(settings.mode, SyncMode::Long);
        assert_eq!(settings.medium, 60);
        assert_eq!(settings.long, 3600);

        let err = SyncSettings::from_value(&serde_json::json!({ "medium": 7200 })).unwrap_err();
        assert!(matches!(err, SyncError::ThresholdOrder { .. }));

        let err = SyncSettings::from_value(&serde_json::json!({ "mode": "fast" })).unwrap_err();
        assert!(matches!(err, SyncError::InvalidValue(_)));
    }
}
