//! brunnen-core: Shared library for the Brunnen well monitor
//!
//! This crate provides:
//! - Data model for measurements, logs, settings, users and devices
//! - The adaptive sync interval state machine
//! - Password hashing, browser sessions and device credentials
//! - JSON payloads of the device and browser endpoints
//! - Storage backends (InfluxDB, in-memory)

pub mod auth;
pub mod config;
pub mod model;
pub mod protocol;
pub mod store;
pub mod sync;
pub mod time;

pub use auth::{Claims, Permission, SessionAuth, SessionToken};
pub use config::Config;
pub use model::{Device, Group, LogEntry, LogLevel, Measurement, SettingKey, Settings, User};
pub use store::{InfluxStore, MemoryStore, Store, StoreError};
pub use sync::{SyncMode, SyncSettings};

/// Default HTTP port of brunnen-server
pub const DEFAULT_PORT: u16 = 5000;
