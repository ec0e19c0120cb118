//! Logging setup for the runner
//!
//! Placement and volume work runs on caller threads, so every layer records
//! the thread id. Per-leg propagation traces go to [`TRACE_TARGET`] and are
//! switched off unless `enable_tracing` is set.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::RollingFileAppender;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::config::AppConfig;

/// Target used by the per-hop trace logs of the engines
pub const TRACE_TARGET: &str = "POWERLINE::TRACE";

fn file_appender(config: &AppConfig) -> RollingFileAppender {
    let (dir, file) = (&config.log_dir, &config.log_file);
    match config.rotation.as_str() {
        "hourly" => tracing_appender::rolling::hourly(dir, file),
        "daily" => tracing_appender::rolling::daily(dir, file),
        _ => tracing_appender::rolling::never(dir, file),
    }
}

/// Default filter when `RUST_LOG` is unset
pub fn filter_directive(config: &AppConfig) -> String {
    if config.enable_tracing {
        config.log_level.clone()
    } else {
        format!("{},{}=off", config.log_level, TRACE_TARGET)
    }
}

/// Install the global subscriber; keep the guard alive until exit so the
/// file writer flushes.
pub fn init_logging(config: &AppConfig) -> WorkerGuard {
    let (writer, guard) = tracing_appender::non_blocking(file_appender(config));
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directive(config)));
    let registry = tracing_subscriber::registry().with(filter);

    if config.use_json {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_writer(writer)
                    .with_ansi(false),
            )
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(true)
                    .with_writer(writer)
                    .with_ansi(false),
            )
            .with(fmt::layer().with_target(false).with_ansi(true))
            .init();
    }

    guard
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(enable_tracing: bool) -> AppConfig {
        AppConfig {
            log_level: "debug".to_string(),
            log_dir: "./logs".to_string(),
            log_file: "powerline.log".to_string(),
            use_json: false,
            rotation: "never".to_string(),
            enable_tracing,
            root_node_id: "ROOT".to_string(),
            placement: Default::default(),
            qualification: Default::default(),
            journal: Default::default(),
            reporting: Default::default(),
        }
    }

    #[test]
    fn test_trace_target_silenced_by_default() {
        assert_eq!(filter_directive(&config(false)), "debug,POWERLINE::TRACE=off");
        assert_eq!(filter_directive(&config(true)), "debug");
    }
}
