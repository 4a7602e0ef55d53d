use std::path::Path;

use anyhow::{Context, Result};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Registry, fmt};

pub const LOG_FILE: &str = "nodeflow.log";
pub const EVENT_FILE: &str = "workflow-events.log";

/// Target used for per-run workflow reports. Events logged with it land in
/// the JSON event file when file logging is on.
pub const WORKFLOW_EVENT_TARGET: &str = "workflow";

/// `RUST_LOG` wins over the configured level.
fn env_filter(log_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level))
}

/// Install the global subscriber: stdout always, plus a daily text log and a
/// JSON workflow event log under `log_dir` when one is set.
///
/// Calling this twice is harmless; the second call leaves the first
/// subscriber in place.
pub fn init_tracing(log_level: &str, log_dir: Option<&Path>) -> Result<()> {
    let stdout_layer = fmt::layer().with_target(false);

    match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("could not create log dir {}", dir.display()))?;
            let txt_layer = fmt::Layer::default()
                .with_writer(daily(dir, LOG_FILE))
                .with_ansi(false);
            let json_layer = fmt::layer()
                .json()
                .with_writer(daily(dir, EVENT_FILE))
                .with_target(true)
                .with_filter(EnvFilter::new(format!("{WORKFLOW_EVENT_TARGET}=info")));

            let _ = Registry::default()
                .with(env_filter(log_level))
                .with(stdout_layer)
                .with(txt_layer)
                .with(json_layer)
                .try_init();
        }
        None => {
            let _ = Registry::default()
                .with(env_filter(log_level))
                .with(stdout_layer)
                .try_init();
        }
    }
    Ok(())
}

fn daily(dir: &Path, file: &str) -> RollingFileAppender {
    RollingFileAppender::new(Rotation::DAILY, dir, file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn file_logging_creates_the_directory() {
        let dir = TempDir::new().unwrap();
        let logs = dir.path().join("logs");
        init_tracing("debug", Some(&logs)).unwrap();
        assert!(logs.is_dir());
        // second install is a no-op
        init_tracing("info", None).unwrap();
    }
}
