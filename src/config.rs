//! Environment-driven runtime configuration.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::calc_client::CalculationHttpConfig;
use crate::clock::{correct_month_boundary, parse_timestamp, ClockError};
use crate::http_telemetry::TelemetryHttpConfig;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid {key} '{raw}': {source}")]
    InvalidTimestamp {
        key: &'static str,
        raw: String,
        source: ClockError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedulerMode {
    DataFound,
    FixedTime,
    Off,
}

impl SchedulerMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DataFound => "data_found",
            Self::FixedTime => "fixed_time",
            Self::Off => "off",
        }
    }
}

impl FromStr for SchedulerMode {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "data_found" => Ok(Self::DataFound),
            "fixed_time" => Ok(Self::FixedTime),
            "off" | "scheduler_off" => Ok(Self::Off),
            other => Err(format!("unknown scheduler mode '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub mode: SchedulerMode,
    pub task_date_start: DateTime<Utc>,
    pub tick_interval_ms: u64,
    pub validation_window_days: u32,
    /// Steps past the cursor at which fresh data is probed.
    pub deep_check_steps: u32,
    /// How many steps past the probe a lookahead sample may land.
    pub check_step_after: u32,
    pub bad_tag_tolerance: usize,
    /// Failed computes tolerated at one instant before it is skipped.
    pub retry_tolerance: u32,
    pub worker_pool_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            mode: SchedulerMode::DataFound,
            task_date_start: Utc
                .with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
                .single()
                .unwrap_or_default(),
            tick_interval_ms: 30_000,
            validation_window_days: 5,
            deep_check_steps: 2,
            check_step_after: 2,
            bad_tag_tolerance: 0,
            retry_tolerance: 1,
            worker_pool_size: 30,
        }
    }
}

impl SchedulerConfig {
    /// Cursor for entities that have never been scheduled.
    pub fn default_start(&self) -> DateTime<Utc> {
        correct_month_boundary(self.task_date_start)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub scheduler: SchedulerConfig,
    pub telemetry: TelemetryHttpConfig,
    pub calculation: CalculationHttpConfig,
    pub store_path: PathBuf,
    pub status_addr: String,
    pub factor_refresh_interval_ms: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            telemetry: TelemetryHttpConfig::default(),
            calculation: CalculationHttpConfig::default(),
            store_path: PathBuf::from("data/wellcalc.sqlite"),
            status_addr: "127.0.0.1:8090".to_string(),
            factor_refresh_interval_ms: 3_600_000,
        }
    }
}

pub fn scheduler_config_from_env() -> Result<SchedulerConfig, ConfigError> {
    let mut config = SchedulerConfig::default();

    if let Some(raw) = env_string("WELLCALC_SCHEDULER_MODE") {
        match raw.parse() {
            Ok(mode) => config.mode = mode,
            Err(reason) => warn!(
                component = "config",
                event = "config.invalid_value",
                key = "WELLCALC_SCHEDULER_MODE",
                reason = %reason
            ),
        }
    }

    if let Some(raw) = env_string("WELLCALC_TASK_DATE_START") {
        config.task_date_start =
            parse_timestamp(&raw).map_err(|source| ConfigError::InvalidTimestamp {
                key: "WELLCALC_TASK_DATE_START",
                raw,
                source,
            })?;
    }

    env_parse("WELLCALC_TICK_INTERVAL_MS", &mut config.tick_interval_ms);
    env_parse(
        "WELLCALC_VALIDATION_WINDOW_DAYS",
        &mut config.validation_window_days,
    );
    env_parse("WELLCALC_DEEP_CHECK_STEPS", &mut config.deep_check_steps);
    env_parse("WELLCALC_CHECK_STEP_AFTER", &mut config.check_step_after);
    env_parse("WELLCALC_BAD_TAG_TOLERANCE", &mut config.bad_tag_tolerance);
    env_parse("WELLCALC_RETRY_TOLERANCE", &mut config.retry_tolerance);
    env_parse("WELLCALC_WORKER_POOL_SIZE", &mut config.worker_pool_size);
    config.worker_pool_size = config.worker_pool_size.max(1);
    config.tick_interval_ms = config.tick_interval_ms.max(1);

    Ok(config)
}

pub fn telemetry_http_config_from_env() -> TelemetryHttpConfig {
    let mut config = TelemetryHttpConfig::default();
    env_assign("WELLCALC_TELEMETRY_BASE_URL", &mut config.base_url);
    env_assign("WELLCALC_TELEMETRY_VALUES_PATH", &mut config.values_path);
    env_assign("WELLCALC_TELEMETRY_VALUE_PATH", &mut config.value_path);
    env_assign("WELLCALC_TELEMETRY_NEXT_PATH", &mut config.next_value_path);
    env_assign("WELLCALC_TELEMETRY_WRITE_PATH", &mut config.write_path);
    env_assign("WELLCALC_TELEMETRY_UOM_PATH", &mut config.uom_path);
    env_parse("WELLCALC_TELEMETRY_TIMEOUT_MS", &mut config.http_timeout_ms);
    env_parse("WELLCALC_TELEMETRY_MAX_RETRIES", &mut config.max_retries);
    env_parse(
        "WELLCALC_TELEMETRY_RETRY_BACKOFF_MS",
        &mut config.retry_backoff_ms,
    );
    config
}

pub fn calculation_http_config_from_env() -> CalculationHttpConfig {
    let mut config = CalculationHttpConfig::default();
    env_assign("WELLCALC_CALC_BASE_URL", &mut config.base_url);
    env_assign("WELLCALC_CALC_VALIDATE_PATH", &mut config.validate_path);
    env_assign("WELLCALC_CALC_COMPUTE_PATH", &mut config.compute_path);
    env_parse("WELLCALC_CALC_TIMEOUT_MS", &mut config.http_timeout_ms);
    env_parse("WELLCALC_CALC_MAX_RETRIES", &mut config.max_retries);
    env_parse("WELLCALC_CALC_RETRY_BACKOFF_MS", &mut config.retry_backoff_ms);
    config
}

pub fn app_config_from_env() -> Result<AppConfig, ConfigError> {
    let mut config = AppConfig {
        scheduler: scheduler_config_from_env()?,
        telemetry: telemetry_http_config_from_env(),
        calculation: calculation_http_config_from_env(),
        ..AppConfig::default()
    };
    if let Some(path) = env_string("WELLCALC_STORE_PATH") {
        config.store_path = PathBuf::from(path);
    }
    env_assign("WELLCALC_STATUS_ADDR", &mut config.status_addr);
    env_parse(
        "WELLCALC_FACTOR_REFRESH_INTERVAL_MS",
        &mut config.factor_refresh_interval_ms,
    );
    Ok(config)
}

fn env_string(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|raw| raw.trim().to_string())
        .filter(|raw| !raw.is_empty())
}

fn env_assign(key: &str, target: &mut String) {
    if let Some(raw) = env_string(key) {
        *target = raw;
    }
}

/// Malformed values keep the default and are reported.
fn env_parse<T: FromStr>(key: &'static str, target: &mut T) {
    let Some(raw) = env_string(key) else {
        return;
    };
    match raw.parse() {
        Ok(parsed) => *target = parsed,
        Err(_) => warn!(
            component = "config",
            event = "config.invalid_value",
            key,
            raw = %raw
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Mutex, OnceLock};

    fn env_lock() -> &'static Mutex<()> {
        static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        ENV_LOCK.get_or_init(|| Mutex::new(()))
    }

    fn with_env_vars<R>(vars: &[(&str, Option<&str>)], f: impl FnOnce() -> R) -> R {
        let _guard = env_lock().lock().expect("env lock should not be poisoned");
        let previous: Vec<(String, Option<String>)> = vars
            .iter()
            .map(|(key, _)| ((*key).to_string(), env::var(key).ok()))
            .collect();

        for (key, value) in vars {
            match value {
                Some(v) => env::set_var(key, v),
                None => env::remove_var(key),
            }
        }

        let output = f();

        for (key, value) in previous {
            match value {
                Some(v) => env::set_var(key, v),
                None => env::remove_var(key),
            }
        }

        output
    }

    const SCHEDULER_KEYS: [&str; 9] = [
        "WELLCALC_SCHEDULER_MODE",
        "WELLCALC_TASK_DATE_START",
        "WELLCALC_TICK_INTERVAL_MS",
        "WELLCALC_VALIDATION_WINDOW_DAYS",
        "WELLCALC_DEEP_CHECK_STEPS",
        "WELLCALC_CHECK_STEP_AFTER",
        "WELLCALC_BAD_TAG_TOLERANCE",
        "WELLCALC_RETRY_TOLERANCE",
        "WELLCALC_WORKER_POOL_SIZE",
    ];

    fn cleared() -> Vec<(&'static str, Option<&'static str>)> {
        SCHEDULER_KEYS.iter().map(|key| (*key, None)).collect()
    }

    #[test]
    fn defaults_when_env_missing() {
        let cfg = with_env_vars(&cleared(), scheduler_config_from_env).unwrap();
        assert_eq!(cfg, SchedulerConfig::default());
        assert_eq!(cfg.validation_window_days, 5);
        assert_eq!(cfg.retry_tolerance, 1);
        assert_eq!(cfg.worker_pool_size, 30);
    }

    #[test]
    fn parses_mode_start_and_numbers() {
        let mut vars = cleared();
        vars.push(("WELLCALC_SCHEDULER_MODE", Some("fixed-time")));
        vars.push(("WELLCALC_TASK_DATE_START", Some("2024-03-01T00:00:00.000Z")));
        vars.push(("WELLCALC_DEEP_CHECK_STEPS", Some("4")));
        vars.push(("WELLCALC_WORKER_POOL_SIZE", Some("0")));

        let cfg = with_env_vars(&vars, scheduler_config_from_env).unwrap();
        assert_eq!(cfg.mode, SchedulerMode::FixedTime);
        assert_eq!(cfg.deep_check_steps, 4);
        assert_eq!(cfg.worker_pool_size, 1);
        assert_eq!(
            crate::clock::format_timestamp(cfg.default_start()),
            "2024-03-01T00:00:30.000Z"
        );
    }

    #[test]
    fn malformed_values_fall_back_but_bad_start_date_fails() {
        let mut vars = cleared();
        vars.push(("WELLCALC_SCHEDULER_MODE", Some("sometimes")));
        vars.push(("WELLCALC_RETRY_TOLERANCE", Some("many")));
        let cfg = with_env_vars(&vars, scheduler_config_from_env).unwrap();
        assert_eq!(cfg.mode, SchedulerMode::DataFound);
        assert_eq!(cfg.retry_tolerance, 1);

        let mut vars = cleared();
        vars.push(("WELLCALC_TASK_DATE_START", Some("last tuesday")));
        let err = with_env_vars(&vars, scheduler_config_from_env).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidTimestamp { .. }));
    }

    #[test]
    fn telemetry_endpoints_from_env() {
        let cfg = with_env_vars(
            &[
                ("WELLCALC_TELEMETRY_BASE_URL", Some("http://zif:9000")),
                ("WELLCALC_TELEMETRY_MAX_RETRIES", Some("5")),
            ],
            telemetry_http_config_from_env,
        );
        assert_eq!(cfg.base_url, "http://zif:9000");
        assert_eq!(cfg.max_retries, 5);
        assert_eq!(cfg.retry_backoff_ms, 2_000);
    }
}
