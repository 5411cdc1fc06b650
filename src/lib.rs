//! Well production-rate orchestration core.
//!
//! - `window_cache`: per-entity cache of aligned telemetry windows with
//!   incremental reconcile and merge
//! - `scheduler` / `fixed_time`: walk-forward and fixed-time step schedulers
//! - `pipeline`: lookahead, validation and compute callbacks over the
//!   telemetry platform and the calculation services

mod calc_client;
mod clock;
mod config;
mod conversion;
mod fixed_time;
mod http_telemetry;
mod observability;
mod pipeline;
mod progress;
mod scheduler;
mod status;
mod store;
mod telemetry;
mod transport;
mod window_cache;
mod window_fetch;

pub use calc_client::{CalculationHttpConfig, HttpCalculationService};
pub use clock::{
    canonicalize, correct_month_boundary, floor_to_minute, format_timestamp, minus_days,
    parse_timestamp, sample_count, step, steps, time_grid, ClockError, STEP_SECONDS,
    TIMESTAMP_FORMAT,
};
pub use config::{
    app_config_from_env, calculation_http_config_from_env, scheduler_config_from_env,
    telemetry_http_config_from_env, AppConfig, ConfigError, SchedulerConfig, SchedulerMode,
};
pub use conversion::{CanonicalFactorSource, ConversionFactorCache};
pub use fixed_time::{FixedTickKind, FixedTickReport, FixedTimeScheduler};
pub use http_telemetry::{HttpTelemetryClient, TelemetryHttpConfig};
pub use observability::{
    init_logging, log_app_start, log_mode_selected, log_status_bind, logging_config_from_env,
    LogFormat, LoggingConfig, LoggingInitError,
};
pub use pipeline::{
    evaluate_lookahead, CalculationOutputs, CalculationService, ComputeRequest, LookaheadVerdict,
    PipelineError, StepPipeline, TelemetryPipeline, ValidationRequest,
};
pub use progress::{BusyGuard, EntityProgress, EntityProgressTracker};
pub use scheduler::{TickReport, WalkForwardScheduler, WalkOutcome, WalkStop};
pub use status::{status_router, StatusSnapshot};
pub use store::{EntityRecord, EntityStore, SqliteEntityStore, StoreError, TagDirectory, TagRole};
pub use telemetry::{
    InMemoryTelemetrySource, RawSample, TagRef, TelemetryError, TelemetryPoint, TelemetrySource,
};
pub use transport::{
    endpoint_url, retry, HttpTransport, ReqwestBlockingTransport, RetryPolicy, TransportError,
};
pub use window_cache::{
    CacheError, CachedWindow, FetchKind, FetchPlan, NamedSeries, WindowCache,
};
pub use window_fetch::{WindowFetchError, WindowFetcher};
