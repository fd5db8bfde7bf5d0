use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use reservation_engine::access::{
    AccessCodeMachine, AccessCodeProvider, HttpAccessCodeProvider, MemoryProvider,
};
use reservation_engine::config::Config;
use reservation_engine::engine::{BufferCalculator, Engine};
use reservation_engine::reaper::{self, JobSchedule};
use reservation_engine::service::BookingService;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env()?;
    reservation_engine::observability::init(config.metrics_port);

    std::fs::create_dir_all(&config.data_dir)?;
    let engine = Arc::new(Engine::new(
        config.wal_path(),
        BufferCalculator::new(config.timezone),
    )?);

    let provider: Arc<dyn AccessCodeProvider> = match &config.provider_url {
        Some(url) => Arc::new(HttpAccessCodeProvider::new(url.clone(), config.provider_api_key.clone())),
        None => {
            warn!("RESV_PROVIDER_URL not set, access codes are kept in memory only");
            Arc::new(MemoryProvider::new())
        }
    };
    let machine = Arc::new(AccessCodeMachine::new(engine.clone(), provider, config.access_code()));
    let service = BookingService::new(engine.clone(), machine.clone());

    let schedule = JobSchedule {
        staleness_bound: config.staleness_bound,
        span_rebuild_interval: config.span_rebuild_interval,
        sweep_interval: config.sweep_interval,
        compact_threshold: config.compact_threshold,
        ..JobSchedule::default()
    };
    let jobs = reaper::spawn_jobs(engine.clone(), machine, schedule);

    info!("reservation engine running");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  timezone: {}", config.timezone);
    info!("  provider: {}", config.provider_url.as_deref().unwrap_or("in-memory"));
    info!("  bookings: {}", service.engine().booking_count());
    info!("  metrics: {}", config.metrics_port.map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics")));

    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }

    info!("shutdown signal received, stopping background jobs");
    for job in jobs {
        job.abort();
    }
    if let Err(e) = engine.compact_wal().await {
        warn!("final WAL compaction failed: {e}");
    }
    info!("reservation engine stopped");
    Ok(())
}
