use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use parkline::config::Config;
use parkline::engine::Engine;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env()?;
    parkline::observability::init(config.metrics_port)?;

    std::fs::create_dir_all(&config.data_dir)?;
    let wal_path = config.data_dir.join("parkline.wal");
    let engine = Arc::new(Engine::new(wal_path.clone(), config.engine.clone())?);

    let compactor_engine = engine.clone();
    let threshold = config.compact_threshold;
    tokio::spawn(async move {
        parkline::maintenance::run_compactor(compactor_engine, threshold, Duration::from_secs(30)).await;
    });

    info!("parkline engine ready");
    info!("  wal: {}", wal_path.display());
    info!("  lock_timeout: {:?}", config.engine.lock_timeout);
    info!("  ticket_prefix: {}", config.engine.ticket_prefix);
    info!("  fallback_hourly_rate: {}", config.engine.fallback_hourly_rate);
    info!("  compact_threshold: {threshold}");
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    shutdown_signal().await?;
    info!("shutdown signal received");

    // Leave a compact log behind so the next start replays quickly.
    match engine.compact_wal().await {
        Ok(records) => info!("final compaction: {records} records"),
        Err(e) => tracing::warn!("final compaction failed: {e}"),
    }
    info!("parkline stopped");
    Ok(())
}

async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
