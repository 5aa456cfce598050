//! Structured logging.
//!
//! `Logger` stamps every record with the service name; `CorrelatedLogger`
//! also carries a correlation id (the job id for per-job lines). Records are
//! emitted with `log_event!`, which takes typed `key = value` fields; the JSON
//! subscriber flattens them next to `timestamp`, `level` and `message`.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

/// Output format of the process-wide subscriber.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// One flat JSON object per line.
    #[default]
    Json,
    /// Multi-line, human readable.
    Pretty,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "pretty" => Ok(LogFormat::Pretty),
            other => Err(format!("unknown log format: {other}")),
        }
    }
}

/// Install the global subscriber.
///
/// Filter comes from `RUST_LOG` (default `info`). Safe to call multiple
/// times; only the first call has an effect.
pub fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .flatten_event(true)
            .with_timer(tracing_subscriber::fmt::time::SystemTime)
            .with_target(false)
            .try_init(),
        LogFormat::Pretty => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .pretty()
            .with_target(false)
            .try_init(),
    };
}

/// Service-scoped logger.
#[derive(Debug, Clone)]
pub struct Logger {
    service: Arc<str>,
}

impl Logger {
    pub fn new(service: impl Into<Arc<str>>) -> Self {
        Self {
            service: service.into(),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn correlation_id(&self) -> Option<&str> {
        None
    }

    /// Child logger whose records carry `correlation_id`.
    pub fn with_correlation(&self, correlation_id: impl fmt::Display) -> CorrelatedLogger {
        CorrelatedLogger {
            service: Arc::clone(&self.service),
            correlation_id: correlation_id.to_string(),
        }
    }
}

/// Logger bound to one correlation id.
#[derive(Debug, Clone)]
pub struct CorrelatedLogger {
    service: Arc<str>,
    correlation_id: String,
}

impl CorrelatedLogger {
    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn correlation_id(&self) -> Option<&str> {
        Some(&self.correlation_id)
    }
}

/// Emit one record through a `Logger` or `CorrelatedLogger`.
///
/// ```ignore
/// log_event!(Level::INFO, log, "job added", priority = job.priority);
/// ```
///
/// Fields follow the message (no trailing comma) and use `tracing` field
/// syntax, so `%value` and `?value` work as usual.
macro_rules! log_event {
    ($level:expr, $logger:expr, $message:literal $(, $($fields:tt)+)?) => {
        ::tracing::event!(
            $level,
            service = $logger.service(),
            correlation_id = $logger.correlation_id(),
            $($($fields)+,)?
            $message
        )
    };
}

pub(crate) use log_event;
