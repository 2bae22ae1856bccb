//! Replay-safe logging for orchestration code and subscriber setup.
//!
//! Orchestrations are re-run on every turn, so a plain `tracing::info!` inside
//! one fires once per replay. The `durable_*!` macros only emit when the
//! context is executing new work.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Target used by the `durable_*!` macros.
pub const ORCHESTRATION_TARGET: &str = "durasql::orchestration";
/// Target used for activity logs emitted by the worker dispatcher.
pub const ACTIVITY_TARGET: &str = "durasql::activity";

#[macro_export]
macro_rules! durable_trace {
    ($ctx:expr, $($arg:tt)+) => {{
        if !$ctx.is_replaying() {
            ::tracing::trace!(
                target: $crate::logging::ORCHESTRATION_TARGET,
                instance_id = %$ctx.instance_id(),
                execution_id = $ctx.execution_id(),
                $($arg)+
            );
        }
    }};
}

#[macro_export]
macro_rules! durable_debug {
    ($ctx:expr, $($arg:tt)+) => {{
        if !$ctx.is_replaying() {
            ::tracing::debug!(
                target: $crate::logging::ORCHESTRATION_TARGET,
                instance_id = %$ctx.instance_id(),
                execution_id = $ctx.execution_id(),
                $($arg)+
            );
        }
    }};
}

#[macro_export]
macro_rules! durable_info {
    ($ctx:expr, $($arg:tt)+) => {{
        if !$ctx.is_replaying() {
            ::tracing::info!(
                target: $crate::logging::ORCHESTRATION_TARGET,
                instance_id = %$ctx.instance_id(),
                execution_id = $ctx.execution_id(),
                $($arg)+
            );
        }
    }};
}

#[macro_export]
macro_rules! durable_warn {
    ($ctx:expr, $($arg:tt)+) => {{
        if !$ctx.is_replaying() {
            ::tracing::warn!(
                target: $crate::logging::ORCHESTRATION_TARGET,
                instance_id = %$ctx.instance_id(),
                execution_id = $ctx.execution_id(),
                $($arg)+
            );
        }
    }};
}

#[macro_export]
macro_rules! durable_error {
    ($ctx:expr, $($arg:tt)+) => {{
        if !$ctx.is_replaying() {
            ::tracing::error!(
                target: $crate::logging::ORCHESTRATION_TARGET,
                instance_id = %$ctx.instance_id(),
                execution_id = $ctx.execution_id(),
                $($arg)+
            );
        }
    }};
}

/// Log output format.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Structured JSON output for log aggregators
    Json,
    /// Human-readable multi-line output
    Pretty,
    /// One line per event
    #[default]
    Compact,
}

/// Subscriber configuration. `RUST_LOG` overrides `log_level` when set.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub log_format: LogFormat,
    /// Level applied to the orchestration, activity and runtime targets.
    pub log_level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_format: LogFormat::Compact,
            log_level: "info".to_string(),
        }
    }
}

fn default_filter_expression(level: &str) -> String {
    format!("warn,durasql::orchestration={level},durasql::activity={level},durasql::runtime={level}")
}

/// Install a global tracing subscriber. Fails if one is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<(), String> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter_expression(&config.log_level)));

    match config.log_format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .map_err(|e| format!("Failed to initialize JSON logging: {e}")),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().pretty())
            .try_init()
            .map_err(|e| format!("Failed to initialize pretty logging: {e}")),
        LogFormat::Compact => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().compact())
            .try_init()
            .map_err(|e| format!("Failed to initialize compact logging: {e}")),
    }
}
