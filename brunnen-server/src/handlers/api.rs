//! Settings snapshot and maintenance endpoints for the dashboard

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::Json;

use brunnen_core::auth::Permission;
use brunnen_core::protocol::{
    settings_from_web, DeleteRequest, PayloadError, RangeQuery, SettingsUpdate,
};
use brunnen_core::{SettingKey, Settings, SyncSettings};

use crate::error::ApiError;
use crate::extract::{json_body, json_or_default, Session};
use crate::state::SharedState;

use super::delete_series;

/// `GET /api/brunnen`: latest value of every setting
pub async fn settings(
    State(state): State<SharedState>,
    session: Session,
) -> Result<Json<Settings>, ApiError> {
    session.require(Permission::ViewData)?;
    Ok(Json(state.current_settings().await?))
}

/// `POST /api/brunnen`
pub async fn update_settings(
    State(state): State<SharedState>,
    session: Session,
    body: Bytes,
) -> Result<Json<Settings>, ApiError> {
    session.require(Permission::EditSettings)?;
    let update: SettingsUpdate = json_body(&body)?;
    let raw = update.settings.ok_or(PayloadError::MissingField("settings"))?;
    let settings = settings_from_web(raw)?;
    if let Some(sync) = settings.get(&SettingKey::Sync) {
        SyncSettings::from_value(sync)?;
    }

    state.write_settings(&settings).await?;
    tracing::info!(
        "'{}' updated settings: {:?}",
        session.username,
        settings.keys().collect::<Vec<_>>()
    );

    Ok(Json(state.current_settings().await?))
}

/// `DELETE /api/brunnen?start&stop`
pub async fn delete(
    State(state): State<SharedState>,
    session: Session,
    Query(query): Query<RangeQuery>,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    session.require(Permission::DeleteData)?;
    let range = query.range()?;
    let request: DeleteRequest = json_or_default(&body)?;
    delete_series(state.store.as_ref(), &request.series()?, &range).await?;
    Ok(StatusCode::NO_CONTENT)
}
