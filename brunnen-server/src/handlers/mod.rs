//! HTTP handlers
//!
//! - `device`: sync endpoint used by the well controller
//! - `web`: dashboard data, accounts and device registry
//! - `api`: settings snapshot and series deletion
//! - `firmware`: firmware upload and download
//! - `session`: browser login and logout

pub mod api;
pub mod device;
pub mod firmware;
pub mod session;
pub mod web;

use axum::{response::IntoResponse, Json};

use brunnen_core::model::Series;
use brunnen_core::protocol::TimeRange;
use brunnen_core::store::StoreError;
use brunnen_core::Store;

/// Health check endpoint
pub async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "brunnen-server"
    }))
}

/// Delete the selected series inside `range`
pub(crate) async fn delete_series(
    store: &dyn Store,
    series: &[Series],
    range: &TimeRange,
) -> Result<(), StoreError> {
    for s in series {
        match s {
            Series::Data => store.delete_measurements(range).await?,
            Series::Logs => store.delete_logs(range).await?,
            Series::Settings => store.delete_settings(range).await?,
        }
        tracing::info!("Deleted {:?} between {} and {}", s, range.start, range.stop);
    }
    Ok(())
}
