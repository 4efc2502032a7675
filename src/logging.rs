//! `tracing-subscriber` setup driven by `config::LoggingConfig`.
//!
//! `RUST_LOG` wins if set; otherwise `UCR_LOG_LEVEL`; otherwise the config
//! file's `logging.level` (ADDED-11).

use std::fs::OpenOptions;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::LoggingConfig;

fn resolve_filter(configured_level: &str) -> EnvFilter {
    if let Ok(from_env) = std::env::var("RUST_LOG") {
        return EnvFilter::new(from_env);
    }
    if let Ok(from_env) = std::env::var("UCR_LOG_LEVEL") {
        return EnvFilter::new(from_env);
    }
    EnvFilter::new(configured_level)
}

/// Initializes the global subscriber. Call once at startup, before anything
/// else logs.
pub fn init(config: &LoggingConfig) -> anyhow::Result<()> {
    let filter = resolve_filter(&config.level);

    let stdout_layer = if config.pretty {
        tracing_subscriber::fmt::layer().pretty().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };

    let registry = tracing_subscriber::registry().with(filter).with(stdout_layer);

    match &config.file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            let file_layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(file)
                .boxed();
            registry.with(file_layer).init();
        }
        None => registry.init(),
    }

    Ok(())
}
