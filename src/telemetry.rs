//! Tracing setup for embedders and binaries.

use std::path::PathBuf;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

const LOG_FILE_PREFIX: &str = "annal.log";

#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// 0 = error, 1 = info, 2+ = debug. Overridable via `ANNAL_LOG`.
    pub verbosity: u8,
    pub stderr: bool,
    /// When set, also write daily-rotated logs into this directory.
    pub log_dir: Option<PathBuf>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            verbosity: 1,
            stderr: true,
            log_dir: None,
        }
    }
}

/// Keeps the non-blocking file writer alive; drop to flush.
pub struct TelemetryGuard {
    _guards: Vec<tracing_appender::non_blocking::WorkerGuard>,
}

pub fn init(config: TelemetryConfig) -> TelemetryGuard {
    let filter = EnvFilter::builder()
        .with_default_directive(level_from_verbosity(config.verbosity).into())
        .with_env_var("ANNAL_LOG")
        .from_env_lossy();

    let mut guards = Vec::new();
    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();

    if config.stderr {
        layers.push(Box::new(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_names(true),
        ));
    }

    if let Some(dir) = &config.log_dir {
        match std::fs::create_dir_all(dir) {
            Ok(()) => {
                let appender = tracing_appender::rolling::RollingFileAppender::new(
                    tracing_appender::rolling::Rotation::DAILY,
                    dir,
                    LOG_FILE_PREFIX,
                );
                let (writer, guard) = tracing_appender::non_blocking(appender);
                layers.push(Box::new(
                    tracing_subscriber::fmt::layer()
                        .compact()
                        .with_writer(writer)
                        .with_ansi(false)
                        .with_target(true)
                        .with_thread_names(true),
                ));
                guards.push(guard);
            }
            Err(err) => {
                eprintln!("log dir init failed for {}: {err}", dir.display());
            }
        }
    }

    layers.push(Box::new(filter));
    Registry::default().with(layers).init();

    TelemetryGuard { _guards: guards }
}

fn level_from_verbosity(verbosity: u8) -> tracing::metadata::LevelFilter {
    match verbosity {
        0 => tracing::metadata::LevelFilter::ERROR,
        1 => tracing::metadata::LevelFilter::INFO,
        _ => tracing::metadata::LevelFilter::DEBUG,
    }
}
