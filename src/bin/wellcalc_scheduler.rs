use std::{net::SocketAddr, sync::Arc, time::Duration};

use tracing::{error, info};
use wellcalc::{
    app_config_from_env, init_logging, log_app_start, log_mode_selected, log_status_bind,
    logging_config_from_env, status_router, AppConfig, ConversionFactorCache,
    EntityProgressTracker, FixedTimeScheduler, HttpCalculationService, HttpTelemetryClient,
    SchedulerMode, SqliteEntityStore, TelemetryPipeline, WalkForwardScheduler, WindowCache,
    WindowFetcher,
};

// The blocking HTTP clients must be built and dropped outside the async
// runtime, so the runtime is started by hand.
fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;
    let app_cfg = app_config_from_env()?;
    log_app_start(&logging_cfg, &app_cfg);

    let store = Arc::new(SqliteEntityStore::open(&app_cfg.store_path)?);
    let telemetry = Arc::new(HttpTelemetryClient::new(app_cfg.telemetry.clone())?);
    let calculation = Arc::new(HttpCalculationService::new(app_cfg.calculation.clone())?);
    // Declared before the runtime so the last client handles drop after it.
    let _clients = (telemetry.clone(), calculation.clone());
    let factors = Arc::new(ConversionFactorCache::new(telemetry.clone()));
    let fetcher = WindowFetcher::new(telemetry.clone(), factors.clone(), Arc::new(WindowCache::new()));
    let pipeline = Arc::new(TelemetryPipeline::new(
        telemetry,
        store.clone(),
        fetcher,
        factors.clone(),
        calculation,
        app_cfg.scheduler.check_step_after,
    ));
    let tracker = EntityProgressTracker::new(app_cfg.scheduler.default_start());

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async move {
        log_mode_selected(app_cfg.scheduler.mode, app_cfg.scheduler.tick_interval_ms);
        spawn_factor_refresh(factors, app_cfg.factor_refresh_interval_ms);

        let addr: SocketAddr = app_cfg.status_addr.parse()?;
        let listener = tokio::net::TcpListener::bind(addr).await?;
        log_status_bind(listener.local_addr()?);
        let app = status_router(app_cfg.scheduler.mode, tracker.clone());
        tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, app).await {
                error!(
                    component = "wellcalc_scheduler",
                    event = "app.serve_failed",
                    error = %err
                );
            }
        });

        run_mode(&app_cfg, pipeline, store, tracker).await;
        Ok::<(), Box<dyn std::error::Error>>(())
    })?;

    Ok(())
}

async fn run_mode(
    app_cfg: &AppConfig,
    pipeline: Arc<TelemetryPipeline>,
    store: Arc<SqliteEntityStore>,
    tracker: EntityProgressTracker,
) {
    match app_cfg.scheduler.mode {
        SchedulerMode::DataFound => {
            let scheduler =
                WalkForwardScheduler::new(pipeline, store, tracker, app_cfg.scheduler.clone());
            let stopper = scheduler.clone();
            tokio::select! {
                _ = scheduler.run_forever() => {}
                _ = tokio::signal::ctrl_c() => stopper.shutdown(),
            }
        }
        SchedulerMode::FixedTime => {
            let scheduler = FixedTimeScheduler::new(pipeline, store, app_cfg.scheduler.clone());
            let stopper = scheduler.clone();
            tokio::select! {
                _ = scheduler.run_forever() => {}
                _ = tokio::signal::ctrl_c() => stopper.shutdown(),
            }
        }
        SchedulerMode::Off => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
    info!(component = "wellcalc_scheduler", event = "app.stop");
}

fn spawn_factor_refresh(factors: Arc<ConversionFactorCache>, interval_ms: u64) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(interval_ms.max(1_000)));
        interval.tick().await;
        loop {
            interval.tick().await;
            let factors = Arc::clone(&factors);
            if let Err(err) = tokio::task::spawn_blocking(move || factors.refresh_all()).await {
                error!(
                    component = "wellcalc_scheduler",
                    event = "conversion.refresh.join_failed",
                    error = %err
                );
            }
        }
    });
}
