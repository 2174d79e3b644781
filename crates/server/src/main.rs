mod app;
mod config;
mod metrics;

use std::env;
use tokio::runtime::Builder;
use tracing::info;

fn main() {
    let log_filter = env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(log_filter)
        .json()
        .init();

    let config = config::load_from_env().expect("configuration");

    let runtime = Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("runtime");
    runtime.block_on(async move {
        let state = app::init(config).await.expect("state");
        let bind = state.config.bind.clone();
        let listener = tokio::net::TcpListener::bind(&bind).await.expect("listener");
        info!(address = %bind, "courier listening");
        axum::serve(listener, app::router(state)).await.expect("server");
    });
}
