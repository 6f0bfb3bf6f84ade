mod api;
mod cache;
mod catalog;
mod config;
mod export;
mod merge;
mod query;
mod state;
mod store;
mod utils;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use api::api_router;
use catalog::Catalog;
use config::{config_path_from_env, load_or_create_config, resolve_path};
use state::AppState;
use store::{open_or_create_db, SongStore};
use tower_http::request_id::{MakeRequestUuid, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config_path = config_path_from_env();
    let (config, created) = load_or_create_config(&config_path)?;
    if created {
        info!("Created default config at {:?}", config_path);
    } else {
        info!("Loaded config from {:?}", config_path);
    }
    let config = Arc::new(config);

    let db_path = resolve_path(&config_path, &config.db_path);
    let store = SongStore::new(Arc::new(open_or_create_db(&db_path)?));
    store.init_tables()?;
    info!("Opened catalog at {:?}", db_path);

    let persistent = if config.persistent_cache {
        let cache_path = resolve_path(&config_path, &config.cache_path);
        match open_or_create_db(&cache_path) {
            Ok(db) => Some(Arc::new(db)),
            Err(err) => {
                warn!("Persistent cache at {:?} unavailable: {}", cache_path, err);
                None
            }
        }
    } else {
        None
    };
    let catalog = Catalog::with_tiers(store, persistent, Arc::clone(&config))?;
    let state = AppState { catalog };

    let app = Router::new()
        .nest("/api/v1", api_router(state))
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(TraceLayer::new_for_http());

    let bind_addr = config.listen_addr();
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("Listening on {}", bind_addr);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(signal) => signal,
            Err(err) => {
                warn!("Failed to install terminate signal handler: {}", err);
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = term.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for ctrl-c: {}", err);
        }
    }

    info!("Shutdown signal received.");
}
