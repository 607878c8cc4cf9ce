//! Device sync endpoint
//!
//! Every request from the well controller (upload, delete or plain poll)
//! ends with a sync: the adaptive mode is re-evaluated and the device gets
//! the settings that changed since its previous sync.

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::Json;

use brunnen_core::protocol::{
    filter_settings, logs_from_payload, DeleteRequest, DeviceUpload, RangeQuery, SyncResponse,
};
use brunnen_core::sync::SyncContext;
use brunnen_core::{time, SettingKey, Settings};

use crate::error::ApiError;
use crate::extract::{json_or_default, DeviceAuth};
use crate::state::{AppState, SharedState};

use super::delete_series;

/// `GET /device/brunnen`
pub async fn poll(
    State(state): State<SharedState>,
    device: DeviceAuth,
    Query(query): Query<RangeQuery>,
) -> Result<Json<SyncResponse>, ApiError> {
    query.range()?;
    sync_device(&state, &device.device_id).await.map(Json)
}

/// `POST /device/brunnen`: store measurements, logs and device-owned settings
pub async fn upload(
    State(state): State<SharedState>,
    device: DeviceAuth,
    Query(query): Query<RangeQuery>,
    body: Bytes,
) -> Result<Json<SyncResponse>, ApiError> {
    let range = query.range()?;
    let upload: DeviceUpload = json_or_default(&body)?;

    // Validate everything before writing anything.
    let measurements = match upload.data {
        Some(data) => data.into_measurements(&range)?,
        None => Vec::new(),
    };
    let logs = match upload.logs {
        Some(logs) => logs_from_payload(logs)?,
        None => Vec::new(),
    };
    let settings = upload
        .settings
        .map(|raw| filter_settings(raw, SettingKey::device_writable))
        .unwrap_or_default();

    if !measurements.is_empty() {
        state.store.insert_measurements(&measurements).await?;
    }
    if !logs.is_empty() {
        state.store.insert_logs(&logs).await?;
    }
    if !settings.is_empty() {
        state.write_settings(&settings).await?;
    }
    tracing::debug!(
        "Device '{}' uploaded {} measurements, {} log entries, {} settings",
        device.device_id,
        measurements.len(),
        logs.len(),
        settings.len()
    );

    sync_device(&state, &device.device_id).await.map(Json)
}

/// `DELETE /device/brunnen`
pub async fn delete(
    State(state): State<SharedState>,
    device: DeviceAuth,
    Query(query): Query<RangeQuery>,
    body: Bytes,
) -> Result<Json<SyncResponse>, ApiError> {
    let range = query.range()?;
    let request: DeleteRequest = json_or_default(&body)?;
    delete_series(state.store.as_ref(), &request.series()?, &range).await?;

    sync_device(&state, &device.device_id).await.map(Json)
}

/// Re-evaluate the sync mode and collect the settings the device has not seen
///
/// A device without a previous sync gets the full snapshot. Otherwise it
/// gets the values stamped after its previous sync; a `sync` value written
/// here is delivered now and not again.
pub(crate) async fn sync_device(
    state: &AppState,
    device_id: &str,
) -> Result<SyncResponse, ApiError> {
    let _gate = state.lock_sync().await;
    let now = time::now();
    let (last_visit, last_sync) = state.sync_context(device_id).await;

    let mut sync = state.sync_settings().await?;
    let transition = sync.apply(&SyncContext {
        last_visit,
        last_sync,
        now,
    });
    if transition.changed() {
        tracing::info!(
            "Sync mode {} -> {} (device '{}')",
            transition.from,
            transition.to,
            device_id
        );
        let mut update = Settings::new();
        update.insert(SettingKey::Sync, sync.to_value());
        state.store.insert_settings(&update, now).await?;
    }

    let snapshot = match last_sync {
        Some(since) => {
            let after = since + chrono::Duration::nanoseconds(1);
            state.store.query_settings(Some(after)).await?
        }
        None => state.current_settings().await?,
    };
    state.record_sync(device_id, now).await;

    Ok(SyncResponse::new(snapshot))
}
