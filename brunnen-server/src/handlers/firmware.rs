//! Firmware images
//!
//! Uploads land in `server.firmware_dir` as `brunnen-<version>.bin`; the
//! `firmware` setting points at the current one and reaches the device with
//! the next sync.

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::Json;

use brunnen_core::auth::Permission;
use brunnen_core::protocol::{FirmwareInfo, FirmwareQuery, PayloadError};
use brunnen_core::{time, SettingKey, Settings};

use crate::error::ApiError;
use crate::extract::{DeviceAuth, Session};
use crate::state::{AppState, SharedState};

fn valid_version(version: &str) -> bool {
    !version.is_empty()
        && version.len() <= 64
        && !version.starts_with('.')
        && version
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

async fn current(state: &AppState) -> Result<FirmwareInfo, ApiError> {
    let settings = state.current_settings().await?;
    settings
        .get(&SettingKey::Firmware)
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .ok_or_else(|| ApiError::NotFound("No firmware uploaded yet.".to_string()))
}

/// `GET /web/firmware`
pub async fn info(
    State(state): State<SharedState>,
    session: Session,
) -> Result<Json<FirmwareInfo>, ApiError> {
    session.require(Permission::ViewData)?;
    current(&state).await.map(Json)
}

/// `POST /web/firmware?version=` with the raw image as body
pub async fn upload(
    State(state): State<SharedState>,
    session: Session,
    Query(query): Query<FirmwareQuery>,
    body: Bytes,
) -> Result<(StatusCode, Json<FirmwareInfo>), ApiError> {
    session.require(Permission::ManageFirmware)?;
    let version = query
        .version
        .ok_or(PayloadError::MissingParameter("version"))?;
    if !valid_version(&version) {
        return Err(ApiError::Unprocessable(format!(
            "Invalid firmware version '{version}'."
        )));
    }
    if body.is_empty() {
        return Err(ApiError::Unprocessable("Firmware image is empty.".to_string()));
    }

    let dir = &state.config.server.firmware_dir;
    let file = format!("brunnen-{version}.bin");
    tokio::fs::create_dir_all(dir).await?;
    tokio::fs::write(dir.join(&file), &body).await?;

    let info = FirmwareInfo {
        version,
        file,
        size: body.len() as u64,
        uploaded: time::now(),
    };
    let mut update = Settings::new();
    update.insert(SettingKey::Firmware, serde_json::to_value(&info)?);
    state.write_settings(&update).await?;
    tracing::info!(
        "Firmware {} ({} bytes) uploaded by '{}'",
        info.version,
        info.size,
        session.username
    );

    Ok((StatusCode::CREATED, Json(info)))
}

/// `GET /device/firmware`: the current image as octet stream
pub async fn download(
    State(state): State<SharedState>,
    device: DeviceAuth,
) -> Result<impl IntoResponse, ApiError> {
    let info = current(&state).await?;
    let path = state.config.server.firmware_dir.join(&info.file);
    let image = match tokio::fs::read(&path).await {
        Ok(image) => image,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ApiError::NotFound(format!(
                "Firmware file {} is missing.",
                path.display()
            )));
        }
        Err(e) => return Err(e.into()),
    };
    tracing::info!("Device '{}' downloads firmware {}", device.device_id, info.version);

    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (header::HeaderName::from_static("x-firmware-version"), info.version),
        ],
        image,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_version() {
        assert!(valid_version("1.4.2"));
        assert!(valid_version("2024-09-05_rc1"));
        assert!(!valid_version(""));
        assert!(!valid_version("../etc/passwd"));
        assert!(!valid_version("1.0/x"));
        assert!(!valid_version(".hidden"));
    }
}
