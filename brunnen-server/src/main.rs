//! brunnen-server: HTTP backend of the Brunnen well monitor
//!
//! This server sits between the well controller, the dashboard and InfluxDB:
//! - Accepts measurement, log and settings uploads from the device
//! - Adapts how often the device syncs to whether anybody is watching
//! - Serves time series, settings and account management to the dashboard
//! - Hands out firmware images

mod app;
mod error;
mod extract;
mod handlers;
mod state;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use base64::Engine;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use brunnen_core::config::Backend;
use brunnen_core::{Config, InfluxStore, MemoryStore, SessionAuth, Store};

use crate::state::AppState;

const ENV_SESSION_KEY: &str = "BRUNNEN_SESSION_KEY";
const ENV_ADMIN_USER: &str = "BRUNNEN_ADMIN_USER";
const ENV_ADMIN_PASSWORD: &str = "BRUNNEN_ADMIN_PASSWORD";

#[derive(Debug, Parser)]
#[command(name = "brunnen-server", version, about = "Brunnen well monitor server")]
struct Args {
    /// Config file (JSON, or TOML by extension)
    #[arg(short, long, env = "BRUNNEN_CONFIG")]
    config: Option<PathBuf>,

    /// Override the listen address from the config
    #[arg(long)]
    listen: Option<String>,

    /// Override the port from the config
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "brunnen_server=debug,brunnen_core=info,tower_http=debug".into()
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let (mut config, source) = match Config::load(args.config.as_deref()) {
        Ok(loaded) => loaded,
        // An explicitly named file has to load.
        Err(e) if args.config.is_some() => return Err(e).context("Failed to load config"),
        Err(e) => {
            tracing::warn!("Failed to load config: {}, using defaults", e);
            (Config::default(), None)
        }
    };
    match source {
        Some(path) => tracing::info!("Loaded config from {}", path.display()),
        None => tracing::info!("No config file found, using defaults"),
    }
    config.apply_env();
    if let Some(listen) = args.listen {
        config.server.listen_addr = listen;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }

    let store: Arc<dyn Store> = match config.database.backend {
        Backend::Influx => {
            let store = InfluxStore::new(&config.database).context("Failed to create database client")?;
            tracing::info!("InfluxDB backend: {} (bucket {})", store.base_url(), config.database.bucket);
            Arc::new(store)
        }
        Backend::Memory => {
            tracing::warn!("Using in-memory store, data is lost on shutdown");
            Arc::new(MemoryStore::new())
        }
    };
    store.ping().await.context("Database is not reachable")?;

    let session_key = match std::env::var(ENV_SESSION_KEY) {
        Ok(key) => base64::engine::general_purpose::STANDARD
            .decode(key.trim())
            .with_context(|| format!("Invalid {ENV_SESSION_KEY} (must be base64)"))?,
        Err(_) => {
            tracing::info!("Generated random session key (sessions end on restart)");
            brunnen_core::auth::generate_secret().to_vec()
        }
    };
    let sessions = SessionAuth::new(&session_key, config.server.session_ttl);

    if let Ok(password) = std::env::var(ENV_ADMIN_PASSWORD) {
        let username = std::env::var(ENV_ADMIN_USER).unwrap_or_else(|_| "admin".to_string());
        if state::bootstrap_admin(store.as_ref(), &username, &password).await? {
            tracing::info!("Created admin account '{}'", username);
        }
    }

    let addr = SocketAddr::from((
        config.server.listen_addr.parse::<std::net::IpAddr>()?,
        config.server.port,
    ));
    let state = Arc::new(AppState::new(store, sessions, config));
    let router = app::router(state);

    tracing::info!("brunnen-server listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}
