pub mod auth;
pub mod session;
pub mod uploads;

use crate::config::ServerConfig;
use crate::metrics::Metrics;
use axum::extract::State;
use axum::http::StatusCode;
use axum::middleware as axum_middleware;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use courier_broker::{Broker, BrokerError};
use courier_storage::{Storage, StorageError};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

#[derive(Debug)]
pub enum ServerError {
    Storage,
    Broker,
    Http,
}

impl Display for ServerError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Storage => write!(f, "storage failure"),
            Self::Broker => write!(f, "broker failure"),
            Self::Http => write!(f, "http client failure"),
        }
    }
}

impl Error for ServerError {}

impl From<StorageError> for ServerError {
    fn from(_: StorageError) -> Self {
        Self::Storage
    }
}

impl From<BrokerError> for ServerError {
    fn from(_: BrokerError) -> Self {
        Self::Broker
    }
}

pub struct AppState {
    pub config: ServerConfig,
    pub storage: Arc<Storage>,
    pub broker: Arc<Broker>,
    pub metrics: Arc<Metrics>,
    pub http: reqwest::Client,
}

/// Connects the external collaborators and assembles shared state.
/// Store, migration or broker failure here terminates the process.
pub async fn init(config: ServerConfig) -> Result<Arc<AppState>, ServerError> {
    let storage = Arc::new(courier_storage::connect(&config.postgres_dsn, &config.redis_url).await?);
    storage.migrate().await?;
    let broker = Arc::new(
        courier_broker::connect(&config.amqp_url, &config.exchange_name, &config.queue_name)
            .await?,
    );
    let http = reqwest::Client::builder()
        .user_agent("courier-server/0.1")
        .timeout(Duration::from_secs(30))
        .build()
        .map_err(|_| ServerError::Http)?;
    Ok(Arc::new(AppState {
        config,
        storage,
        broker,
        metrics: Arc::new(Metrics::new()),
        http,
    }))
}

pub fn router(state: Arc<AppState>) -> Router {
    let session_routes = Router::new()
        .route("/ws", get(session::ws_handler))
        .route_layer(axum_middleware::from_fn_with_state(
            Arc::clone(&state),
            auth::check_auth,
        ))
        .with_state(Arc::clone(&state));
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_text))
        .with_state(state)
        .merge(session_routes)
}

async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.storage.readiness().await {
        Ok(()) => (StatusCode::OK, "ok"),
        Err(err) => {
            warn!("readiness probe failed: {}", err);
            (StatusCode::SERVICE_UNAVAILABLE, "degraded")
        }
    }
}

async fn metrics_text(State(state): State<Arc<AppState>>) -> String {
    state.metrics.encode_prometheus()
}
