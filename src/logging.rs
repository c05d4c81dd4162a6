//! Log subscriber for the CLI and other native hosts.
//!
//! Everything goes to stderr so command output on stdout stays machine-readable.

use tracing_subscriber::{fmt, EnvFilter};

const DEFAULT_FILTER: &str = "beezap=info,warn";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    /// One JSON object per line.
    Json,
}

impl LogFormat {
    /// `BEEZAP_LOG_JSON=1` (or `true`) selects JSON.
    pub fn from_env() -> Self {
        match std::env::var("BEEZAP_LOG_JSON").as_deref().map(str::trim) {
            Ok("1") | Ok("true") => LogFormat::Json,
            _ => LogFormat::Pretty,
        }
    }
}

/// Install the subscriber in the format chosen by the environment.
/// `RUST_LOG` overrides the default filter.
pub fn init_logging() {
    init_with(LogFormat::from_env());
}

/// Install the subscriber. Later calls are no-ops.
pub fn init_with(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    let installed = match format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Pretty => builder.compact().with_target(false).try_init(),
    };
    if installed.is_err() {
        tracing::debug!(?format, "log subscriber already installed");
    }
}
