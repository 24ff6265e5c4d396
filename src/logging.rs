//! Logging setup for the CLI.
//!
//! Structured logging via tracing: compact human format on stderr by
//! default, a verbose structured format behind `--verbose`, and an
//! optional daily-rolled file sink when a log directory is configured.

use camino::Utf8Path;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer,
};

/// Initialize the global tracing subscriber.
///
/// Returns the file appender guard when a log directory is in use: the
/// caller must keep it alive for the sink to flush.
pub fn init(
    verbose: bool,
    log_directory: Option<&Utf8Path>,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| {
            if verbose {
                EnvFilter::try_new("codegraph=debug,info")
            } else {
                EnvFilter::try_new("codegraph=info,warn")
            }
        })
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let stderr_layer = if verbose {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .compact()
            .boxed()
    } else {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .compact()
            .boxed()
    };

    let (file_layer, guard) = match log_directory {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir.as_std_path(), "codegraph.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true)
                .boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .with(file_layer);
    // A second init (tests, embedding) is not an error worth dying for.
    let _ = registry.try_init();
    guard
}
