//! Tracing subscriber setup.

use std::path::PathBuf;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

const LOG_FILE_PREFIX: &str = "ripple.log";

#[derive(Clone, Debug, Default)]
pub struct TelemetryOptions {
    /// 0 = warn, 1 = info, 2 = debug, 3+ = trace. Overridden by the `LOG`
    /// env var when set.
    pub verbosity: u8,
    /// Directory for a rotating log file; stderr only when `None`.
    pub log_dir: Option<PathBuf>,
}

/// Keeps the non-blocking file writer alive; drop on shutdown to flush.
pub struct TelemetryGuard {
    _guards: Vec<tracing_appender::non_blocking::WorkerGuard>,
}

/// Install the global subscriber. Returns an error message instead of
/// panicking when a subscriber is already set (tests init repeatedly).
pub fn init(options: TelemetryOptions) -> std::result::Result<TelemetryGuard, String> {
    let filter = EnvFilter::builder()
        .with_default_directive(level_from_verbosity(options.verbosity).into())
        .with_env_var("LOG")
        .from_env_lossy();

    let mut guards = Vec::new();
    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();

    layers.push(
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .boxed(),
    );

    if let Some(dir) = &options.log_dir {
        let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        guards.push(guard);
        layers.push(
            tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .boxed(),
        );
    }

    // Layer vec first: the boxed layers are typed against the bare Registry.
    Registry::default()
        .with(layers)
        .with(filter)
        .try_init()
        .map_err(|e| e.to_string())?;

    Ok(TelemetryGuard { _guards: guards })
}

fn level_from_verbosity(verbosity: u8) -> Level {
    match verbosity {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    }
}
