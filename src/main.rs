use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use slotkeeper::config::Config;
use slotkeeper::engine::now_ms;
use slotkeeper::tenant::TenantManager;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Arc::new(Config::from_env()?);
    slotkeeper::observability::init(config.metrics_port)?;

    std::fs::create_dir_all(&config.data_dir)?;

    let tenant_manager = Arc::new(TenantManager::new(config.data_dir.clone(), config.clone()));
    let loaded = tenant_manager.load_existing()?;

    info!("slotkeeper started");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  tenants: {loaded}");
    info!("  reserve attempts: {}", config.engine.reserve_max_attempts);
    info!("  rate limiting: {}", if config.rate_limit.enabled { "enabled" } else { "disabled" });
    info!("  metrics: {}", config.metrics_port.map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics")));

    // Idle limiter windows and abandoned notice channels are dropped once per window.
    let maintenance = tenant_manager.clone();
    let evict_every = Duration::from_millis(config.rate_limit.window_ms.max(1_000) as u64);
    let evictor = tokio::spawn(async move {
        let mut interval = tokio::time::interval(evict_every);
        loop {
            interval.tick().await;
            let evicted = maintenance.limiter().evict_idle(now_ms());
            let pruned = maintenance.prune_channels();
            if evicted > 0 || pruned > 0 {
                tracing::debug!(evicted, pruned, "idle limiter windows and channels dropped");
            }
        }
    });

    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }

    info!("shutdown signal received, stopping reconcilers");
    evictor.abort();
    let drain = tokio::time::timeout(Duration::from_secs(10), tenant_manager.shutdown());
    if drain.await.is_err() {
        tracing::warn!("reconcilers did not stop within 10s");
    }

    info!("slotkeeper stopped");
    Ok(())
}
