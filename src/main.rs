mod auth;
mod config;
mod db;
mod handlers;
mod messaging;
mod models;
mod provisioning;
mod router;
mod ws;

use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use config::Config;
use db::Store;
use messaging::{BrokerConnection, MessageBus, OutboxRelay, RedisBroker};
use provisioning::{ProvisioningCoordinator, TaskTracker, TenantResolver};
use ws::Hub;

/// Application state shared across handlers
pub struct AppState {
    pub store: Store,
    pub config: Config,
    pub ws_hub: Option<Arc<Hub>>,
    pub coordinator: ProvisioningCoordinator,
    pub tracker: TaskTracker,
    pub resolver: TenantResolver,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("Failed to read .env: {}", e);
        }
    }

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tenant_orchestrator=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let mut cfg = Config::load();
    if cfg.jwt_secret.is_empty() {
        tracing::warn!("JWT_SECRET not set - generating random secret (tokens will be invalidated on restart)");
        cfg.jwt_secret = uuid::Uuid::new_v4().to_string();
    }
    tracing::info!("Starting tenant orchestrator");
    tracing::info!("Database: {}", cfg.db_path);
    tracing::info!("Listen: {}", cfg.listen_addr);

    // Initialize database
    let store = Store::with_pool_size(&cfg.db_path, cfg.db_max_connections).await?;
    tracing::info!("Database initialized (pool_size={})", cfg.db_max_connections);

    // Broker is optional: without it tasks stay in the outbox until it returns
    let bus = Arc::new(MessageBus::new(connect_broker(&cfg).await));

    let ws_hub = Arc::new(Hub::new());

    let relay = OutboxRelay::new(store.clone(), bus, cfg.outbox_batch_size);
    relay.start(cfg.outbox_sweep_secs);

    let settings = cfg.provisioning_settings();
    let tracker = TaskTracker::new(store.clone(), relay.clone(), Some(ws_hub.clone()), &settings.subject);
    let coordinator = ProvisioningCoordinator::new(store.clone(), relay, Some(ws_hub.clone()), settings);
    let resolver = TenantResolver::new(store.clone());

    // Create app state
    let state = Arc::new(AppState {
        store,
        config: cfg.clone(),
        ws_hub: Some(ws_hub),
        coordinator,
        tracker,
        resolver,
    });

    // Build router
    let app = router::build(state);

    // Start server
    let listener = tokio::net::TcpListener::bind(&cfg.listen_addr).await?;
    tracing::info!("Tenant orchestrator listening on {}", cfg.listen_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Tenant orchestrator shutting down");
    Ok(())
}

async fn connect_broker(cfg: &Config) -> BrokerConnection {
    if !cfg.broker_enabled {
        tracing::warn!("Broker disabled, running in degraded mode");
        return BrokerConnection::Disconnected;
    }

    let timeout = Duration::from_millis(cfg.broker_connect_timeout_ms);
    match RedisBroker::connect(&cfg.broker_url, timeout).await {
        Ok(broker) => {
            tracing::info!("Connected to broker at {}", cfg.broker_url);
            BrokerConnection::Connected(Arc::new(broker))
        }
        Err(e) => {
            tracing::warn!("Broker unavailable ({:#}), running in degraded mode", e);
            BrokerConnection::Disconnected
        }
    }
}

/// WebSocket upgrade handler
pub async fn ws_upgrade_handler(
    _auth: auth::AuthUser,
    ws: axum::extract::ws::WebSocketUpgrade,
    axum::extract::State(state): axum::extract::State<Arc<AppState>>,
) -> axum::response::Response {
    use axum::response::IntoResponse;

    if let Some(hub) = &state.ws_hub {
        ws::ws_handler(ws, axum::extract::State(hub.clone())).await
    } else {
        axum::http::StatusCode::SERVICE_UNAVAILABLE.into_response()
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => { sig.recv().await; }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
