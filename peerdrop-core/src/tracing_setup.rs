//! Tracing setup for Peerdrop binaries.
//!
//! The console shows Peerdrop's own events at the chosen level and only
//! warnings from dependencies. `RUST_LOG` replaces the console filter. A
//! full trace of the run goes to `<logs_dir>/peerdrop-<role>-last-run.log`.

use std::fs::{File, create_dir_all};
use std::path::{Path, PathBuf};

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

const PEERDROP_TARGETS: [&str; 3] = ["peerdrop_core", "peerdrop_tracker", "peerdrop"];

/// Installs the global subscriber.
///
/// `role` names the process (`tracker`, `peer`) in the log file name so a
/// tracker and its peers can share a logs directory.
///
/// # Errors
///
/// - `std::io::Error` - If the logs directory or log file cannot be created
pub fn init_tracing(
    console_level: Level,
    logs_dir: Option<&Path>,
    role: &str,
) -> Result<(), std::io::Error> {
    let log_file_path = log_file_path(logs_dir, role);
    if let Some(parent) = log_file_path.parent() {
        create_dir_all(parent)?;
    }
    let log_file = File::create(&log_file_path)?;

    let console_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(console_directives(console_level)));

    let console_layer = fmt::layer()
        .compact()
        .with_target(false)
        .with_filter(console_filter);

    let file_layer = fmt::layer()
        .with_thread_ids(true)
        .with_line_number(true)
        .with_ansi(false)
        .with_writer(log_file)
        .with_filter(EnvFilter::new("trace"));

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .init();

    tracing::info!(
        role,
        console = %console_level,
        trace_file = %log_file_path.display(),
        "Tracing initialized"
    );

    Ok(())
}

fn log_file_path(logs_dir: Option<&Path>, role: &str) -> PathBuf {
    logs_dir
        .unwrap_or_else(|| Path::new("logs"))
        .join(format!("peerdrop-{role}-last-run.log"))
}

fn console_directives(level: Level) -> String {
    let level = level.as_str().to_ascii_lowercase();
    let mut directives = vec!["warn".to_string()];
    directives.extend(
        PEERDROP_TARGETS
            .iter()
            .map(|target| format!("{target}={level}")),
    );
    directives.push(format!("tower_http={level}"));
    directives.join(",")
}

/// Console verbosity accepted by `--log-level`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum CliLogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    /// Everything, including per-piece events
    Trace,
}

impl CliLogLevel {
    /// Converts CLI log level to tracing Level enum.
    ///
    /// # Examples
    /// ```
    /// use peerdrop_core::tracing_setup::CliLogLevel;
    ///
    /// let level = CliLogLevel::Info.as_tracing_level();
    /// assert_eq!(level, tracing::Level::INFO);
    /// ```
    pub fn as_tracing_level(self) -> Level {
        match self {
            CliLogLevel::Error => Level::ERROR,
            CliLogLevel::Warn => Level::WARN,
            CliLogLevel::Info => Level::INFO,
            CliLogLevel::Debug => Level::DEBUG,
            CliLogLevel::Trace => Level::TRACE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_mapping() {
        assert_eq!(CliLogLevel::Error.as_tracing_level(), Level::ERROR);
        assert_eq!(CliLogLevel::Trace.as_tracing_level(), Level::TRACE);
        assert_eq!(CliLogLevel::default(), CliLogLevel::Info);
    }

    #[test]
    fn test_console_directives_quiet_dependencies() {
        let directives = console_directives(Level::DEBUG);

        assert!(directives.starts_with("warn,"));
        assert!(directives.contains("peerdrop_core=debug"));
        assert!(directives.contains("peerdrop_tracker=debug"));
        assert!(directives.contains("tower_http=debug"));
        assert!(EnvFilter::try_new(&directives).is_ok());
    }

    #[test]
    fn test_log_file_is_named_by_role() {
        let path = log_file_path(Some(Path::new("/tmp/peerdrop-logs")), "tracker");
        assert_eq!(
            path,
            Path::new("/tmp/peerdrop-logs/peerdrop-tracker-last-run.log")
        );
        assert_eq!(
            log_file_path(None, "peer"),
            Path::new("logs/peerdrop-peer-last-run.log")
        );
    }
}
