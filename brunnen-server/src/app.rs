//! Router assembly

use axum::extract::{DefaultBodyLimit, Request, State};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use brunnen_core::time;

use crate::handlers::{self, api, device, firmware, session, web};
use crate::state::SharedState;

/// Count browser requests and record successful ones as visits
///
/// Only routes that check credentials sit behind this layer.
async fn track_visit(State(state): State<SharedState>, request: Request, next: Next) -> Response {
    let response = next.run(request).await;
    state.count_request();
    if response.status().is_success() {
        state.record_visit(time::now()).await;
    }
    response
}

pub fn router(state: SharedState) -> Router {
    let browser = Router::new()
        .route("/login", post(session::login))
        .route("/web/logs", get(web::logs))
        .route("/web/data", get(web::data))
        .route("/web/sync", get(web::sync_status))
        .route(
            "/web/user",
            get(web::current_user)
                .post(web::upsert_user)
                .delete(web::delete_user),
        )
        .route("/web/users", get(web::list_users))
        .route("/web/password", post(web::change_password))
        .route(
            "/web/devices",
            get(web::list_devices)
                .post(web::register_device)
                .delete(web::delete_device),
        )
        .route("/web/intervals", get(web::intervals).post(web::set_intervals))
        .route("/web/thresholds", get(web::thresholds).post(web::set_thresholds))
        .route("/web/firmware", get(firmware::info).post(firmware::upload))
        .route(
            "/api/brunnen",
            get(api::settings)
                .post(api::update_settings)
                .delete(api::delete),
        )
        .route_layer(middleware::from_fn_with_state(state.clone(), track_visit));

    let device = Router::new()
        .route(
            "/device/brunnen",
            get(device::poll).post(device::upload).delete(device::delete),
        )
        .route("/device/firmware", get(firmware::download));

    Router::new()
        .route("/health", get(handlers::health_handler))
        // Succeeds without credentials, so it is not a visit.
        .route("/logout", post(session::logout))
        .merge(browser)
        .merge(device)
        .layer(DefaultBodyLimit::max(state.config.server.max_upload_bytes))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
