use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tradeloop_api::TradeloopApi;
use tradeloop_core::TenantRegistry;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let registry = match std::env::var("TRADELOOP_DATA_DIR") {
        Ok(dir) => TenantRegistry::with_persistence(PathBuf::from(dir)),
        Err(_) => TenantRegistry::new(),
    };
    let api = TradeloopApi::new(registry);
    let ticker_registry = api.registry.clone();

    // Maintenance ticker: TTL sweeps, cache sweeps, log compaction.
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        loop {
            interval.tick().await;
            let registry = ticker_registry.clone();
            let _ = tokio::task::spawn_blocking(move || registry.tick_all(Instant::now())).await;
        }
    });

    let addr = std::env::var("TRADELOOP_LISTEN").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let listener = TcpListener::bind(&addr).await?;
    info!(%addr, "tradeloop api listening");
    axum::serve(listener, api.router()).await?;
    Ok(())
}
