use std::time::Duration;

use parley_server::{serve, AppState, ServerConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,parley_server=debug")),
        )
        .init();

    info!("Starting Parley relay v{}", env!("CARGO_PKG_VERSION"));

    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");

    let http_addr = config.http_addr;
    let buffer_ttl_ms = i64::try_from(config.offline_buffer_ttl_secs.saturating_mul(1000))
        .unwrap_or(i64::MAX);
    let state = AppState::new(config);

    // Evict rate-limit buckets idle for more than 10 minutes.
    let limiter = state.rate_limiter.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(300));
        loop {
            interval.tick().await;
            let dropped = limiter.purge_stale(Duration::from_secs(600)).await;
            tracing::debug!(dropped, "rate-limit buckets purged");
        }
    });

    let relay = state.relay.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(3600));
        loop {
            interval.tick().await;
            relay.purge_expired_buffers(buffer_ttl_ms).await;
        }
    });

    tokio::select! {
        result = serve(state, http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
