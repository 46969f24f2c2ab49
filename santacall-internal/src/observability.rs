use clap::ValueEnum;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter, Layer, Registry};

use crate::error::{Error, ErrorDetails};

#[derive(Clone, Debug, Default, ValueEnum)]
#[clap(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogFormat::Pretty => write!(f, "pretty"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

const DEFAULT_LOG_FILTER: &str = "warn,gateway=info,santacall_internal=info";
const DEBUG_LOG_FILTER: &str = "warn,gateway=debug,santacall_internal=debug";

/// Handle for raising the log level once the config file has been read
pub struct DelayedDebugLogs {
    handle: reload::Handle<EnvFilter, Registry>,
}

impl DelayedDebugLogs {
    /// Switch to debug logs for our crates, unless `RUST_LOG` was set explicitly
    pub fn enable_debug(&self) -> Result<(), Error> {
        if std::env::var("RUST_LOG").is_ok() {
            tracing::info!("`RUST_LOG` is set, so `gateway.debug` does not change the log filter");
            return Ok(());
        }
        self.handle
            .modify(|filter| *filter = EnvFilter::new(DEBUG_LOG_FILTER))
            .map_err(|e| {
                Error::new(ErrorDetails::Observability {
                    message: format!("Failed to enable debug logs: {e}"),
                })
            })
    }
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over the built-in filter.
pub fn setup_observability(log_format: LogFormat) -> Result<DelayedDebugLogs, Error> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let (filter, handle) = reload::Layer::new(filter);

    let fmt_layer = match log_format {
        LogFormat::Pretty => tracing_subscriber::fmt::layer().boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer().json().boxed(),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| {
            Error::new_without_logging(ErrorDetails::Observability {
                message: format!("Failed to initialize tracing subscriber: {e}"),
            })
        })?;

    Ok(DelayedDebugLogs { handle })
}

/// Install the Prometheus recorder. Render the handle to serve `/metrics`.
pub fn setup_metrics() -> Result<PrometheusHandle, Error> {
    let handle = PrometheusBuilder::new().install_recorder().map_err(|e| {
        Error::new(ErrorDetails::Observability {
            message: format!("Failed to install Prometheus exporter: {e}"),
        })
    })?;
    describe_metrics();
    Ok(handle)
}

fn describe_metrics() {
    metrics::describe_counter!(
        "santacall_sessions_recorded_total",
        "Call sessions recorded against the daily quota"
    );
    metrics::describe_histogram!(
        "santacall_session_recorded_seconds",
        metrics::Unit::Seconds,
        "Seconds added to the daily total per recorded session, after clamping"
    );
    metrics::describe_counter!(
        "santacall_backend_failures_total",
        "Usage store operations that failed or timed out"
    );
    metrics::describe_counter!(
        "santacall_retention_swept_total",
        "Expired usage records removed from the in-memory store"
    );
    metrics::describe_counter!(
        "santacall_geoblocked_requests_total",
        "Geoblock checks that answered blocked"
    );
}
