//! Logging initialization
//!
//! Builds one `tracing` subscriber from the `LOG_*` options: an optional
//! stdout layer and an optional file layer, each with its own level.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Arc;

use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, Layer, Registry};

use crate::config::LogConfig;
use crate::error::{Error, Result};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync + 'static>;

/// Initialize the global subscriber from the log configuration.
pub fn init(config: &LogConfig) -> Result<()> {
    let mut layers: Vec<BoxedLayer> = Vec::new();

    for output in &config.output {
        match output.as_str() {
            "stdout" => {
                layers.push(
                    fmt::layer()
                        .with_filter(parse_level(&config.console_level))
                        .boxed(),
                );
            }
            "file" => {
                let path = config
                    .file
                    .as_deref()
                    .ok_or_else(|| Error::Config("Log file not specified".to_string()))?;
                if let Some(dir) = Path::new(path).parent() {
                    if !dir.as_os_str().is_empty() {
                        std::fs::create_dir_all(dir)?;
                    }
                }
                let file = OpenOptions::new().create(true).append(true).open(path)?;
                layers.push(
                    fmt::layer()
                        .with_ansi(false)
                        .with_writer(Arc::new(file))
                        .with_filter(parse_level(&config.file_level))
                        .boxed(),
                );
            }
            other => {
                return Err(Error::Config(format!("Unknown log output: {}", other)));
            }
        }
    }

    tracing_subscriber::registry().with(layers).init();
    Ok(())
}

fn parse_level(level: &str) -> LevelFilter {
    match level.to_ascii_lowercase().as_str() {
        "trace" => LevelFilter::TRACE,
        "debug" => LevelFilter::DEBUG,
        "info" => LevelFilter::INFO,
        "warn" => LevelFilter::WARN,
        "error" => LevelFilter::ERROR,
        "off" => LevelFilter::OFF,
        _ => LevelFilter::INFO,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("trace"), LevelFilter::TRACE);
        assert_eq!(parse_level("DEBUG"), LevelFilter::DEBUG);
        assert_eq!(parse_level("warn"), LevelFilter::WARN);
        assert_eq!(parse_level("bogus"), LevelFilter::INFO);
    }
}
