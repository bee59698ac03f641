//! # Observability
//!
//! Logging setup shared by the Ledgerflow binaries.
//!
//! Library crates only emit events through the `tracing` macros. A binary
//! calls [`init_with_config`] once at startup and decides where those events
//! go:
//!
//! - a compact human-readable stream on stderr
//! - optionally, structured JSONL appended to a log file
//!   (`~/.ledgerflow/logs/engine.jsonl` unless another path is given)
//!
//! The file can be followed with `tail -f ... | jq` while the engine runs.
//! `RUST_LOG` overrides the configured default level for both outputs.
//!
//! ## Usage
//!
//! ```rust,ignore
//! fn main() {
//!     observability::init_with_config(observability::LogConfig {
//!         service_name: "flow-engine".into(),
//!         default_level: "debug".into(),
//!         json_file: true,
//!         ..Default::default()
//!     });
//!
//!     tracing::info!("engine started");
//! }
//! ```

mod file;
mod json_layer;

use std::io;
use std::path::PathBuf;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

pub use file::{default_log_path, LogFileWriter, WriterFactory};
pub use json_layer::{JsonLayer, LogEntry};

/// Configuration for the logging system.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Name of the service, included in every JSONL line.
    pub service_name: String,

    /// Default level filter (e.g. "debug", "info", "warn").
    /// `RUST_LOG` takes precedence when set.
    pub default_level: String,

    /// Append JSONL records to a log file.
    pub json_file: bool,

    /// Log file path. Defaults to [`default_log_path`].
    pub log_path: Option<PathBuf>,

    /// Emit compact logs to stderr.
    pub also_stderr: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            service_name: "unknown".into(),
            default_level: "info".into(),
            json_file: false,
            log_path: None,
            also_stderr: true,
        }
    }
}

impl LogConfig {
    /// File the JSONL layer writes to, if the file layer is enabled.
    pub fn resolved_log_path(&self) -> Option<PathBuf> {
        if !self.json_file {
            return None;
        }
        self.log_path.clone().or_else(default_log_path)
    }

    fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.default_level))
    }
}

/// Initialize logging with defaults for `service_name`.
pub fn init(service_name: &str) {
    init_with_config(LogConfig {
        service_name: service_name.into(),
        ..Default::default()
    });
}

/// Install the global subscriber described by `config`.
///
/// If the log file cannot be opened, logging continues on stderr only and a
/// warning is emitted once the subscriber is installed. Calling this twice is
/// harmless: the second subscriber is not installed.
pub fn init_with_config(config: LogConfig) {
    let mut open_error = None;
    let json_layer = match config.resolved_log_path() {
        Some(path) => match LogFileWriter::open(&path) {
            Ok(writer) => Some(
                JsonLayer::new(config.service_name.clone(), WriterFactory::new(writer))
                    .with_filter(config.env_filter()),
            ),
            Err(e) => {
                open_error = Some((path, e));
                None
            }
        },
        None => None,
    };

    // Without a file the stderr stream is the only output.
    let stderr_enabled = config.also_stderr || json_layer.is_none();
    let stderr_layer = stderr_enabled.then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .compact()
            .with_writer(io::stderr)
            .with_filter(config.env_filter())
    });

    let installed = tracing_subscriber::registry()
        .with(json_layer)
        .with(stderr_layer)
        .try_init()
        .is_ok();
    if !installed {
        return;
    }

    match (open_error, config.resolved_log_path()) {
        (Some((path, e)), _) => {
            tracing::warn!(path = %path.display(), error = %e, "log file unavailable, logging to stderr only");
        }
        (None, Some(path)) => {
            tracing::debug!(service = %config.service_name, path = %path.display(), "logging initialized");
        }
        (None, None) => {
            tracing::debug!(service = %config.service_name, "logging initialized");
        }
    }
}

/// Re-export tracing macros for convenience.
pub use tracing::{debug, error, info, instrument, trace, warn};

pub use tracing::Level;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = LogConfig::default();
        assert_eq!(config.service_name, "unknown");
        assert_eq!(config.default_level, "info");
        assert!(!config.json_file);
        assert!(config.log_path.is_none());
        assert!(config.also_stderr);
        assert!(config.resolved_log_path().is_none());
    }

    #[test]
    fn test_explicit_log_path_wins() {
        let config = LogConfig {
            json_file: true,
            log_path: Some(PathBuf::from("/tmp/ledgerflow-test.jsonl")),
            ..Default::default()
        };
        assert_eq!(
            config.resolved_log_path(),
            Some(PathBuf::from("/tmp/ledgerflow-test.jsonl"))
        );
    }
}
