use std::fs;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const LOG_DIR: &str = "logs";

/// Set up console logging plus a daily-rotated JSON log file under `logs/`.
/// `RUST_LOG` overrides the default `festcal=info` filter.
pub fn init_logging() {
    let _ = fs::create_dir_all(LOG_DIR);

    let file_appender = tracing_appender::rolling::daily(LOG_DIR, "festcal.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(
            EnvFilter::from_default_env()
                .add_directive("festcal=info".parse().expect("valid directive")),
        )
        .with(fmt::layer().json().with_writer(file_writer))
        .with(fmt::layer().with_writer(std::io::stdout))
        .init();

    // The writer guard must outlive main or buffered records are lost.
    std::mem::forget(guard);
}
