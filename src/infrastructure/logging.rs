//! Logging system configuration and initialization
//!
//! - File logging, with the previous run's file renamed aside on startup
//! - Log level from configuration, overridable through `RUST_LOG`
//! - Optional JSON file output
//! - Timestamps rendered in the configured UTC offset

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Result, anyhow};
use chrono::{FixedOffset, Utc};
use lazy_static::lazy_static;
use tracing::{info, warn};
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{
    EnvFilter, Registry,
    filter::Directive,
    fmt::{self, time::FormatTime},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

pub use crate::infrastructure::config::LoggingConfig;
use crate::infrastructure::config::parse_utc_offset;

const LOG_FILE_NAME: &str = "spidermail.log";

// Global guard to keep the log file writer alive
lazy_static! {
    static ref LOG_GUARDS: Mutex<Vec<tracing_appender::non_blocking::WorkerGuard>> = Mutex::new(Vec::new());
}

/// Renders timestamps in a fixed UTC offset
#[derive(Debug, Clone, Copy)]
pub struct OffsetTimeFormatter {
    offset: FixedOffset,
}

impl OffsetTimeFormatter {
    pub const fn new(offset: FixedOffset) -> Self {
        Self { offset }
    }
}

impl FormatTime for OffsetTimeFormatter {
    fn format_time(&self, w: &mut fmt::format::Writer<'_>) -> std::fmt::Result {
        let local = Utc::now().with_timezone(&self.offset);
        write!(w, "{}", local.format("%Y-%m-%d %H:%M:%S%.3f %:z"))
    }
}

/// Get the log directory relative to the executable location
pub fn get_log_directory() -> PathBuf {
    let exe_dir = std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_default());

    exe_dir.join("logs")
}

/// Rename the previous run's log file with its timestamp
fn rotate_existing_log_file(log_dir: &Path, offset: FixedOffset) -> Result<()> {
    let log_file_path = log_dir.join(LOG_FILE_NAME);
    if !log_file_path.exists() {
        return Ok(());
    }

    let metadata = std::fs::metadata(&log_file_path).map_err(|e| anyhow!("Failed to get log file metadata: {e}"))?;
    let file_time = metadata
        .modified()
        .or_else(|_| metadata.created())
        .unwrap_or_else(|_| std::time::SystemTime::now());

    let datetime: chrono::DateTime<Utc> = file_time.into();
    let stamp = datetime.with_timezone(&offset).format("%Y%m%dT%H%M%S");
    let rotated_path = log_dir.join(format!("spidermail.{stamp}.log"));

    std::fs::rename(&log_file_path, &rotated_path).map_err(|e| {
        anyhow!(
            "Failed to rotate log file {} to {}: {}",
            log_file_path.display(),
            rotated_path.display(),
            e
        )
    })?;
    Ok(())
}

/// Remove the oldest log files beyond `max_files`
fn cleanup_old_logs(log_dir: &Path, max_files: usize) -> Result<usize> {
    let mut log_files = Vec::new();
    for entry in std::fs::read_dir(log_dir)? {
        let entry = entry?;
        let path = entry.path();
        let is_log = path.extension().is_some_and(|ext| ext == "log");
        if path.is_file() && is_log {
            if let Ok(modified) = entry.metadata().and_then(|m| m.modified()) {
                log_files.push((path, modified));
            }
        }
    }

    // Newest first
    log_files.sort_by(|a, b| b.1.cmp(&a.1));

    let mut removed = 0;
    for (path, _) in log_files.iter().skip(max_files) {
        match std::fs::remove_file(path) {
            Ok(()) => removed += 1,
            Err(e) => warn!("Failed to remove old log file {:?}: {}", path, e),
        }
    }
    Ok(removed)
}

/// Default filter: the configured level for this crate, noisy dependencies demoted unless tracing
fn build_env_filter(level: &str) -> Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }

    let mut filter = EnvFilter::new(level);
    if !level.to_lowercase().contains("trace") {
        for directive in [
            "sqlx::query=warn",
            "sqlx::sqlite=warn",
            "reqwest=info",
            "hyper=warn",
            "hyper_util=warn",
            "h2=warn",
            "html5ever=warn",
            "selectors=warn",
        ] {
            filter = filter.add_directive(directive.parse::<Directive>()?);
        }
        filter = filter.add_directive(format!("spidermail_lib={level}").parse::<Directive>()?);
    }
    Ok(filter)
}

/// Initialize the logging system with default configuration
pub fn init_logging() -> Result<()> {
    init_logging_with_config(&LoggingConfig::default())
}

/// Initialize logging with custom configuration
///
/// Verbose dependency targets (`sqlx::query`, `reqwest`, `hyper`, the HTML
/// parser) are suppressed unless the level is `trace`. `RUST_LOG` replaces
/// the whole filter:
/// ```bash
/// RUST_LOG="debug,sqlx::query=debug" spidermail
/// ```
pub fn init_logging_with_config(config: &LoggingConfig) -> Result<()> {
    if !config.file_output && !config.console_output {
        return Err(anyhow!("No logging output configured"));
    }

    let offset = parse_utc_offset(&config.utc_offset)?;
    let timer = OffsetTimeFormatter::new(offset);
    let env_filter = build_env_filter(&config.level)?;
    let registry = Registry::default().with(env_filter);

    // A macro rather than a single value: each branch below stacks the
    // console layer on a different subscriber type.
    macro_rules! console_layer {
        () => {
            config.console_output.then(|| {
                fmt::Layer::new()
                    .with_writer(std::io::stdout)
                    .with_timer(timer)
                    .with_target(false)
            })
        };
    }

    let log_dir = config.log_dir.clone().unwrap_or_else(get_log_directory);
    if config.file_output {
        std::fs::create_dir_all(&log_dir)
            .map_err(|e| anyhow!("Failed to create log directory {:?}: {}", log_dir, e))?;
        rotate_existing_log_file(&log_dir, offset)?;
        cleanup_old_logs(&log_dir, config.max_files as usize)?;

        let file_appender = rolling::never(&log_dir, LOG_FILE_NAME);
        let (file_writer, file_guard) = non_blocking(file_appender);
        LOG_GUARDS
            .lock()
            .map_err(|_| anyhow!("Log guard registry poisoned"))?
            .push(file_guard);

        if config.json_format {
            let file_layer = fmt::Layer::new()
                .json()
                .with_writer(file_writer)
                .with_timer(timer)
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .with_ansi(false);
            registry.with(file_layer).with(console_layer!()).try_init()?;
        } else {
            let file_layer = fmt::Layer::new()
                .with_writer(file_writer)
                .with_timer(timer)
                .with_target(false)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .with_ansi(false);
            registry.with(file_layer).with(console_layer!()).try_init()?;
        }
    } else {
        registry.with(console_layer!()).try_init()?;
    }

    info!("📝 Logging system initialized");
    if config.file_output {
        info!("Log directory: {:?}", log_dir);
    }
    info!("Log level: {}, JSON file format: {}", config.level, config.json_format);
    Ok(())
}

/// Log system information for diagnostics
pub fn log_system_info() {
    info!("=== SpiderMail System Information ===");
    info!("Application version: {}", env!("CARGO_PKG_VERSION"));
    info!("Operating system: {}", std::env::consts::OS);
    info!("Architecture: {}", std::env::consts::ARCH);
    if let Ok(current_dir) = std::env::current_dir() {
        info!("Working directory: {:?}", current_dir);
    }
    info!("=====================================");
}
