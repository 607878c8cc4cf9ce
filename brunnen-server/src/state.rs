//! Shared server state

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, MutexGuard, RwLock};

use brunnen_core::auth::{self, AuthError};
use brunnen_core::store::StoreError;
use brunnen_core::{Config, Group, SessionAuth, SettingKey, Settings, Store, SyncSettings, User};

pub type SharedState = Arc<AppState>;

/// Who looked at the dashboard and which device synced when
#[derive(Debug, Clone)]
pub struct Activity {
    /// Last successful browser request; startup counts as a visit
    pub last_visit: DateTime<Utc>,
    /// Previous sync per device id since startup
    pub last_sync: BTreeMap<String, DateTime<Utc>>,
}

/// Shared application state
pub struct AppState {
    /// Measurements, logs, settings and registries
    pub store: Arc<dyn Store>,

    /// Browser session tokens
    pub sessions: SessionAuth,

    pub config: Config,

    pub activity: RwLock<Activity>,

    /// Browser requests served since startup
    requests: AtomicU64,

    /// Serializes the device sync step
    sync_gate: Mutex<()>,
}

impl AppState {
    pub fn new(store: Arc<dyn Store>, sessions: SessionAuth, config: Config) -> Self {
        Self {
            store,
            sessions,
            config,
            activity: RwLock::new(Activity {
                last_visit: brunnen_core::time::now(),
                last_sync: BTreeMap::new(),
            }),
            requests: AtomicU64::new(0),
            sync_gate: Mutex::new(()),
        }
    }

    pub async fn record_visit(&self, at: DateTime<Utc>) {
        let mut activity = self.activity.write().await;
        if at > activity.last_visit {
            activity.last_visit = at;
        }
    }

    pub async fn record_sync(&self, device_id: &str, at: DateTime<Utc>) {
        self.activity
            .write()
            .await
            .last_sync
            .insert(device_id.to_string(), at);
    }

    /// Last visit and the device's previous sync
    pub async fn sync_context(&self, device_id: &str) -> (DateTime<Utc>, Option<DateTime<Utc>>) {
        let activity = self.activity.read().await;
        (activity.last_visit, activity.last_sync.get(device_id).copied())
    }

    pub fn count_request(&self) -> u64 {
        self.requests.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    /// Hold while running one device sync
    pub async fn lock_sync(&self) -> MutexGuard<'_, ()> {
        self.sync_gate.lock().await
    }

    /// Store settings stamped with the current time
    ///
    /// Runs under the sync gate, so a value is either stamped before a
    /// concurrent sync and part of its snapshot, or after it and part of
    /// the next one.
    pub async fn write_settings(&self, settings: &Settings) -> Result<(), StoreError> {
        let _gate = self.lock_sync().await;
        self.store
            .insert_settings(settings, brunnen_core::time::now())
            .await
    }

    /// Stored settings laid over the configured defaults
    pub async fn current_settings(&self) -> Result<Settings, StoreError> {
        let mut settings = self.config.brunnen.clone();
        settings.extend(self.store.query_settings(None).await?);
        Ok(settings)
    }

    /// Current `sync` setting; an unreadable stored value falls back to the default
    pub async fn sync_settings(&self) -> Result<SyncSettings, StoreError> {
        let stored = self.store.query_settings(None).await?;
        Ok(match stored.get(&SettingKey::Sync) {
            Some(value) => SyncSettings::from_value(value).unwrap_or_else(|e| {
                tracing::warn!("Ignoring stored sync setting: {}", e);
                self.config.default_sync()
            }),
            None => self.config.default_sync(),
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Auth(#[from] AuthError),
}

/// Create the admin account unless a user with that name exists
///
/// Returns whether an account was created.
pub async fn bootstrap_admin(
    store: &dyn Store,
    username: &str,
    password: &str,
) -> Result<bool, BootstrapError> {
    if store.get_user(username).await?.is_some() {
        return Ok(false);
    }

    let token = auth::hash_secret_blocking(password.to_string()).await?;
    store
        .upsert_user(&User {
            username: username.to_string(),
            group: Group::Admin,
            token,
        })
        .await?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use brunnen_core::MemoryStore;
    use chrono::Duration;
    use serde_json::json;

    fn state() -> AppState {
        AppState::new(
            Arc::new(MemoryStore::new()),
            SessionAuth::new(&auth::generate_secret(), 60),
            Config::default(),
        )
    }

    #[tokio::test]
    async fn test_visits_only_move_forward() {
        let state = state();
        let (start, _) = state.sync_context("well-1").await;

        state.record_visit(start - Duration::seconds(30)).await;
        assert_eq!(state.sync_context("well-1").await.0, start);

        state.record_visit(start + Duration::seconds(30)).await;
        assert_eq!(state.sync_context("well-1").await.0, start + Duration::seconds(30));
    }

    #[tokio::test]
    async fn test_last_sync_is_per_device() {
        let state = state();
        let now = brunnen_core::time::now();
        state.record_sync("well-1", now).await;

        assert_eq!(state.sync_context("well-1").await.1, Some(now));
        assert_eq!(state.sync_context("well-2").await.1, None);
    }

    #[tokio::test]
    async fn test_current_settings_overlay_defaults() {
        let state = state();
        let mut stored = Settings::new();
        stored.insert(SettingKey::Intervals, json!({ "measure": 5 }));
        state
            .store
            .insert_settings(&stored, brunnen_core::time::now())
            .await
            .unwrap();

        let settings = state.current_settings().await.unwrap();
        assert_eq!(settings[&SettingKey::Intervals], json!({ "measure": 5 }));
        assert!(settings.contains_key(&SettingKey::Sync));
    }

    #[tokio::test]
    async fn test_invalid_stored_sync_falls_back() {
        let state = state();
        let mut stored = Settings::new();
        stored.insert(SettingKey::Sync, json!({ "short": 900, "medium": 10 }));
        state
            .store
            .insert_settings(&stored, brunnen_core::time::now())
            .await
            .unwrap();

        assert_eq!(state.sync_settings().await.unwrap(), SyncSettings::default());
    }

    #[tokio::test]
    async fn test_bootstrap_admin_once() {
        let store = MemoryStore::new();
        assert!(bootstrap_admin(&store, "admin", "pw").await.unwrap());
        assert!(!bootstrap_admin(&store, "admin", "other").await.unwrap());

        let admin = store.get_user("admin").await.unwrap().unwrap();
        assert_eq!(admin.group, Group::Admin);
        assert!(auth::verify_secret("pw", &admin.token));
    }

    #[test]
    fn test_request_counter() {
        let state = state();
        assert_eq!(state.count_request(), 1);
        assert_eq!(state.count_request(), 2);
        assert_eq!(state.requests(), 2);
    }
}
