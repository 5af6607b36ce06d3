use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::paths;

const DEFAULT_FILTER: &str = "info,reqwest=warn,hyper=warn,tungstenite=warn";

pub struct LoggingHandle {
    pub guard: WorkerGuard,
}

fn filter_from_env() -> EnvFilter {
    std::env::var("WFGAME_LOG_FILTER")
        .ok()
        .and_then(|value| EnvFilter::try_new(value).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_FILTER))
}

/// Log to `<data-dir>/logs/cli.log`, optionally mirrored to stderr.
pub fn init_logging(log_stderr: bool) -> anyhow::Result<LoggingHandle> {
    let log_dir = paths::log_dir();
    std::fs::create_dir_all(&log_dir)?;
    let log_path = paths::log_path();

    let file_appender = tracing_appender::rolling::never(&log_dir, "cli.log");
    let (writer, guard) = tracing_appender::non_blocking(file_appender);
    let format = std::env::var("WFGAME_LOG_FORMAT").unwrap_or_else(|_| "json".into());

    let file_layer = if format.eq_ignore_ascii_case("pretty") {
        fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .pretty()
            .with_file(true)
            .with_line_number(true)
            .with_target(true)
            .boxed()
    } else {
        fmt::layer()
            .with_writer(writer)
            .json()
            .flatten_event(true)
            .with_file(true)
            .with_line_number(true)
            .with_target(true)
            .with_current_span(true)
            .boxed()
    };

    let stderr_layer = log_stderr.then(|| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .compact()
            .with_target(false)
            .with_filter(EnvFilter::new("warn"))
    });

    tracing_subscriber::registry()
        .with(file_layer.with_filter(filter_from_env()))
        .with(stderr_layer)
        .init();

    tracing::info!(
        component = "logging",
        event = "logging.initialized",
        log_path = %log_path.display(),
        format = %format,
        filter = %std::env::var("WFGAME_LOG_FILTER")
            .or_else(|_| std::env::var("RUST_LOG"))
            .unwrap_or_else(|_| DEFAULT_FILTER.to_string()),
        pid = std::process::id(),
    );

    Ok(LoggingHandle { guard })
}
