//! Logging setup for the scheduler binary and its startup events.

use std::env;
use std::net::SocketAddr;

use thiserror::Error;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::{AppConfig, SchedulerMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    /// An `EnvFilter` directive, e.g. `info` or `wellcalc=debug,reqwest=warn`.
    pub level: String,
    pub format: LogFormat,
    pub include_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Json,
            include_target: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum LoggingInitError {
    #[error("logging already initialized: {0}")]
    AlreadyInitialized(#[from] tracing::subscriber::SetGlobalDefaultError),
}

/// Reads `WELLCALC_LOG_LEVEL`, `WELLCALC_LOG_FORMAT` and `WELLCALC_LOG_TARGET`.
/// Unparseable values keep the defaults.
pub fn logging_config_from_env() -> LoggingConfig {
    let mut config = LoggingConfig::default();

    if let Some(level) = env::var("WELLCALC_LOG_LEVEL")
        .ok()
        .map(|raw| raw.trim().to_string())
        .filter(|raw| !raw.is_empty())
    {
        config.level = level;
    }
    if let Some(format) = env::var("WELLCALC_LOG_FORMAT")
        .ok()
        .and_then(|raw| parse_log_format(&raw))
    {
        config.format = format;
    }
    if let Some(include_target) = env::var("WELLCALC_LOG_TARGET")
        .ok()
        .and_then(|raw| parse_bool(&raw))
    {
        config.include_target = include_target;
    }

    config
}

pub fn init_logging(config: &LoggingConfig) -> Result<(), LoggingInitError> {
    let env_filter =
        EnvFilter::try_new(&config.level).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(config.include_target)
        .with_ansi(matches!(config.format, LogFormat::Pretty));

    match config.format {
        LogFormat::Json => tracing::subscriber::set_global_default(builder.json().finish())?,
        LogFormat::Pretty => tracing::subscriber::set_global_default(builder.pretty().finish())?,
    }

    Ok(())
}

pub fn log_app_start(logging: &LoggingConfig, app: &AppConfig) {
    info!(
        component = "wellcalc_scheduler",
        event = "app.start",
        log_level = %logging.level,
        log_format = ?logging.format,
        store_path = %app.store_path.display(),
        telemetry_base_url = %app.telemetry.base_url,
        calculation_base_url = %app.calculation.base_url,
        worker_pool_size = app.scheduler.worker_pool_size
    );
}

pub fn log_status_bind(bound_addr: SocketAddr) {
    info!(
        component = "wellcalc_scheduler",
        event = "app.bind",
        bind_addr = %bound_addr,
        route = "/status"
    );
}

pub fn log_mode_selected(mode: SchedulerMode, tick_interval_ms: u64) {
    info!(
        component = "wellcalc_scheduler",
        event = "scheduler.mode.selected",
        mode = mode.as_str(),
        tick_interval_ms
    );
}

fn parse_log_format(raw: &str) -> Option<LogFormat> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "json" => Some(LogFormat::Json),
        "pretty" | "text" => Some(LogFormat::Pretty),
        _ => None,
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
