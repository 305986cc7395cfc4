//! Configuration infrastructure
//!
//! Contains configuration loading and validation for the crawler.
//!
//! Configuration is organized into sections:
//! 1. `spider`   - request pacing, retries, identity rotation
//! 2. `platform` - what to crawl and how deep
//! 3. `schedule` - daily trigger time, retry-on-failure, maintenance
//! 4. `database` - persistence endpoint
//! 5. `logging`  - log level and outputs

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::info;

use crate::domain::{ConfigError, Platform};

/// Complete application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub spider: SpiderConfig,
    pub platform: PlatformConfig,
    pub schedule: ScheduleConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
}

/// Request execution settings shared by every spider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpiderConfig {
    /// Base delay in seconds: per-host request spacing and retry backoff base
    pub request_delay_secs: f64,

    /// Additional attempts after the first failure
    pub max_retries: u32,

    /// Hard timeout for a single request
    pub request_timeout_secs: u64,

    /// Maximum in-flight requests, also the worker pool size
    pub concurrent_requests: usize,

    /// Pick a random User-Agent per request
    pub user_agent_rotation: bool,

    /// User-Agent pool; empty keeps the built-in browser list
    pub user_agents: Vec<String>,

    /// Route requests through `proxies`
    pub proxy_enabled: bool,

    /// Proxy endpoints, e.g. "http://10.0.0.2:3128"
    pub proxies: Vec<String>,
}

/// What a crawl covers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    pub platforms: Vec<Platform>,
    pub default_category: String,
    /// Search result pages per platform
    pub max_pages: u32,
    /// Review pages per product, 0 disables review crawling
    pub max_review_pages: u32,
}

/// Daily schedule and maintenance settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub enabled: bool,

    /// "HH:MM", optionally followed by an offset ("02:00+08:00")
    pub crawl_time: String,

    /// Offset used when `crawl_time` carries none
    pub utc_offset: String,

    pub retry_on_failure: bool,
    pub max_retry_attempts: u32,
    pub retry_delay_secs: u64,

    pub maintenance_interval_secs: u64,
    pub task_retention_days: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

/// Logging configuration settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "error", "warn", "info", "debug", "trace"
    pub level: String,

    /// Enable JSON formatted file logs
    pub json_format: bool,

    pub console_output: bool,
    pub file_output: bool,

    /// Defaults to `logs/` next to the executable
    pub log_dir: Option<PathBuf>,

    /// Rotated log files kept on startup
    pub max_files: u32,

    /// Offset used to render timestamps
    pub utc_offset: String,
}

impl Default for SpiderConfig {
    fn default() -> Self {
        Self {
            request_delay_secs: defaults::REQUEST_DELAY_SECS,
            max_retries: defaults::MAX_RETRIES,
            request_timeout_secs: defaults::REQUEST_TIMEOUT_SECS,
            concurrent_requests: defaults::CONCURRENT_REQUESTS,
            user_agent_rotation: true,
            user_agents: Vec::new(),
            proxy_enabled: false,
            proxies: Vec::new(),
        }
    }
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            platforms: Platform::ALL.to_vec(),
            default_category: defaults::CATEGORY.to_string(),
            max_pages: defaults::MAX_PAGES,
            max_review_pages: defaults::MAX_REVIEW_PAGES,
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            crawl_time: defaults::CRAWL_TIME.to_string(),
            utc_offset: defaults::UTC_OFFSET.to_string(),
            retry_on_failure: true,
            max_retry_attempts: defaults::SCHEDULE_RETRY_ATTEMPTS,
            retry_delay_secs: defaults::SCHEDULE_RETRY_DELAY_SECS,
            maintenance_interval_secs: defaults::MAINTENANCE_INTERVAL_SECS,
            task_retention_days: defaults::TASK_RETENTION_DAYS,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: defaults::DATABASE_URL.to_string(),
            max_connections: 10,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: defaults::LOG_LEVEL.to_string(),
            json_format: false,
            console_output: true,
            file_output: true,
            log_dir: None,
            max_files: 7,
            utc_offset: defaults::UTC_OFFSET.to_string(),
        }
    }
}

impl SpiderConfig {
    pub fn request_delay(&self) -> Duration {
        Duration::from_secs_f64(self.request_delay_secs.max(0.0).min(defaults::MAX_REQUEST_DELAY_SECS))
    }

    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Proxies in effect, empty when proxying is disabled
    pub fn active_proxies(&self) -> &[String] {
        if self.proxy_enabled { &self.proxies } else { &[] }
    }
}

impl ScheduleConfig {
    pub fn daily_time(&self) -> Result<DailyTime, ConfigError> {
        DailyTime::parse(&self.crawl_time, &self.utc_offset)
    }
}

impl AppConfig {
    /// Reject values the crawler cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let spider = &self.spider;
        if !(0.0..=defaults::MAX_REQUEST_DELAY_SECS).contains(&spider.request_delay_secs) {
            return Err(ConfigError::invalid(
                "request_delay",
                format!("must be within 0..={}", defaults::MAX_REQUEST_DELAY_SECS),
            ));
        }
        if spider.concurrent_requests < 1 {
            return Err(ConfigError::invalid("concurrent_requests", "must be >= 1"));
        }
        if spider.request_timeout_secs == 0 || spider.request_timeout_secs > defaults::MAX_REQUEST_TIMEOUT_SECS {
            return Err(ConfigError::invalid(
                "request_timeout",
                format!("must be within 1..={}", defaults::MAX_REQUEST_TIMEOUT_SECS),
            ));
        }
        if spider.proxy_enabled && spider.proxies.is_empty() {
            return Err(ConfigError::invalid("proxies", "proxy_enabled requires at least one proxy"));
        }
        if self.platform.platforms.is_empty() {
            return Err(ConfigError::invalid("platforms", "at least one platform is required"));
        }
        if self.platform.default_category.trim().is_empty() {
            return Err(ConfigError::invalid("default_category", "must not be empty"));
        }
        if self.platform.max_pages == 0 {
            return Err(ConfigError::invalid("max_pages", "must be >= 1"));
        }
        self.schedule.daily_time()?;
        parse_utc_offset(&self.logging.utc_offset)?;
        if self.database.url.trim().is_empty() {
            return Err(ConfigError::invalid("database.url", "must not be empty"));
        }
        Ok(())
    }
}

/// Wall-clock time of day in a fixed UTC offset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DailyTime {
    pub time: NaiveTime,
    pub offset: FixedOffset,
}

impl DailyTime {
    /// Parse "HH:MM" or "HH:MM+HH:MM"; `default_offset` applies to the first form
    pub fn parse(crawl_time: &str, default_offset: &str) -> Result<Self, ConfigError> {
        let crawl_time = crawl_time.trim();
        let (clock, offset) = match crawl_time.find(['+', '-']) {
            Some(split) => (&crawl_time[..split], &crawl_time[split..]),
            None => (crawl_time, default_offset),
        };
        let time = NaiveTime::parse_from_str(clock.trim(), "%H:%M")
            .map_err(|e| ConfigError::invalid("crawl_time", format!("'{crawl_time}' is not HH:MM ({e})")))?;
        Ok(Self {
            time,
            offset: parse_utc_offset(offset)?,
        })
    }

    /// First occurrence of this time of day strictly after `now`
    pub fn next_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let local_today = now.with_timezone(&self.offset).date_naive();
        let mut candidate = self.at(local_today);
        if candidate <= now {
            candidate = self.at(local_today + chrono::Days::new(1));
        }
        candidate
    }

    fn at(&self, date: chrono::NaiveDate) -> DateTime<Utc> {
        let local = date.and_time(self.time);
        let utc = local - chrono::Duration::seconds(i64::from(self.offset.local_minus_utc()));
        Utc.from_utc_datetime(&utc)
    }
}

/// Parse "+08:00", "-05:30" or "Z"
pub fn parse_utc_offset(value: &str) -> Result<FixedOffset, ConfigError> {
    let value = value.trim();
    if value.eq_ignore_ascii_case("z") || value.eq_ignore_ascii_case("utc") {
        return FixedOffset::east_opt(0).ok_or_else(|| ConfigError::invalid("utc_offset", value));
    }

    let invalid = || ConfigError::invalid("utc_offset", format!("'{value}' is not +HH:MM"));
    let (sign, rest) = match value.chars().next() {
        Some('+') => (1, &value[1..]),
        Some('-') => (-1, &value[1..]),
        _ => return Err(invalid()),
    };
    if !rest.bytes().all(|b| b.is_ascii_digit() || b == b':') {
        return Err(invalid());
    }
    let (hours, minutes) = rest.split_once(':').ok_or_else(invalid)?;
    let hours: i32 = hours.parse().map_err(|_| invalid())?;
    let minutes: i32 = minutes.parse().map_err(|_| invalid())?;
    if hours > 14 || minutes > 59 {
        return Err(invalid());
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60)).ok_or_else(invalid)
}

/// Configuration manager for loading and saving settings
pub struct ConfigManager {
    pub config_path: PathBuf,
}

impl ConfigManager {
    /// Get the application configuration directory
    pub fn get_config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to get user config directory")?
            .join("spidermail");

        Ok(config_dir)
    }

    /// Configuration manager using the per-user config directory
    pub fn new() -> Result<Self> {
        let config_dir = Self::get_config_dir()?;
        Ok(Self::with_path(config_dir.join("spidermail_config.json")))
    }

    pub fn with_path(config_path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: config_path.into(),
        }
    }

    /// Load configuration from file, creating default if it doesn't exist
    pub async fn load_config(&self) -> Result<AppConfig> {
        if !self.config_path.exists() {
            info!("Configuration file not found, creating default: {:?}", self.config_path);
            let default_config = AppConfig::default();
            self.save_config(&default_config).await?;
            return Ok(default_config);
        }

        let content = fs::read_to_string(&self.config_path)
            .await
            .with_context(|| format!("Failed to read configuration file {:?}", self.config_path))?;

        let config: AppConfig = serde_json::from_str(&content)
            .with_context(|| format!("Configuration file {:?} is not valid", self.config_path))?;

        config.validate().context("Configuration rejected")?;
        info!("Loaded configuration from: {:?}", self.config_path);
        Ok(config)
    }

    /// Save configuration to file
    pub async fn save_config(&self, config: &AppConfig) -> Result<()> {
        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent)
                .await
                .context("Failed to create config directory")?;
        }

        let content = serde_json::to_string_pretty(config).context("Failed to serialize configuration")?;

        fs::write(&self.config_path, content)
            .await
            .context("Failed to write configuration file")?;

        info!("Saved configuration to: {:?}", self.config_path);
        Ok(())
    }

    pub fn config_path(&self) -> &PathBuf {
        &self.config_path
    }
}

/// Default crawling configuration values
pub mod defaults {
    pub const REQUEST_DELAY_SECS: f64 = 1.0;
    pub const MAX_RETRIES: u32 = 3;
    pub const REQUEST_TIMEOUT_SECS: u64 = 30;
    pub const MAX_REQUEST_TIMEOUT_SECS: u64 = 300;
    pub const MAX_REQUEST_DELAY_SECS: f64 = 3600.0;
    pub const CONCURRENT_REQUESTS: usize = 5;

    pub const CATEGORY: &str = "手机";
    pub const MAX_PAGES: u32 = 5;
    pub const MAX_REVIEW_PAGES: u32 = 3;

    /// Daily crawl time, Asia/Shanghai
    pub const CRAWL_TIME: &str = "02:00";
    pub const UTC_OFFSET: &str = "+08:00";
    pub const SCHEDULE_RETRY_ATTEMPTS: u32 = 3;
    pub const SCHEDULE_RETRY_DELAY_SECS: u64 = 60;
    pub const MAINTENANCE_INTERVAL_SECS: u64 = 3600;
    pub const TASK_RETENTION_DAYS: u32 = 30;

    pub const DATABASE_URL: &str = "sqlite:data/spidermail.db";
    pub const LOG_LEVEL: &str = "info";
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;
    use rstest::rstest;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.spider.request_delay(), Duration::from_secs(1));
        assert_eq!(config.spider.concurrent_requests, 5);
        assert_eq!(config.spider.max_retries, 3);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = AppConfig::default();
        config.spider.concurrent_requests = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "concurrent_requests", .. })
        ));

        let mut config = AppConfig::default();
        config.spider.request_delay_secs = -0.5;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.schedule.crawl_time = "25:99".into();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { field: "crawl_time", .. })));

        let mut config = AppConfig::default();
        config.spider.proxy_enabled = true;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_daily_time_with_embedded_offset() {
        let daily = DailyTime::parse("02:30-05:00", "+08:00").unwrap();
        assert_eq!(daily.offset.local_minus_utc(), -5 * 3600);
        assert_eq!(daily.time.hour(), 2);
        assert_eq!(daily.time.minute(), 30);
    }

    #[test]
    fn test_next_after_rolls_over_to_tomorrow() {
        let daily = DailyTime::parse("02:00", "+08:00").unwrap();

        // 2026-10-16 17:00 UTC is 2026-10-17 01:00 in UTC+8: fires the same local night
        let now = Utc.with_ymd_and_hms(2026, 10, 16, 17, 0, 0).unwrap();
        assert_eq!(daily.next_after(now), Utc.with_ymd_and_hms(2026, 10, 16, 18, 0, 0).unwrap());

        // Exactly at fire time: the next one is a day later
        let now = Utc.with_ymd_and_hms(2026, 10, 16, 18, 0, 0).unwrap();
        assert_eq!(daily.next_after(now), Utc.with_ymd_and_hms(2026, 10, 17, 18, 0, 0).unwrap());
    }

    #[test]
    fn test_offset_parsing() {
        assert_eq!(parse_utc_offset("+08:00").unwrap().local_minus_utc(), 8 * 3600);
        assert_eq!(parse_utc_offset("-05:30").unwrap().local_minus_utc(), -(5 * 3600 + 30 * 60));
        assert_eq!(parse_utc_offset("Z").unwrap().local_minus_utc(), 0);
        assert!(parse_utc_offset("Asia/Shanghai").is_err());
        assert!(parse_utc_offset("+8").is_err());
        assert!(parse_utc_offset("+-1:00").is_err());
        assert!(parse_utc_offset("-05:-30").is_err());
        assert!(DailyTime::parse("02:30+-1:00", "+08:00").is_err());
    }

    #[rstest]
    #[case(1e20)]
    #[case(f64::INFINITY)]
    #[case(f64::NAN)]
    #[case(3600.5)]
    fn test_request_delay_out_of_range_is_rejected_not_panicking(#[case] delay: f64) {
        let mut config = AppConfig::default();
        config.spider.request_delay_secs = delay;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { field: "request_delay", .. })));
        assert!(config.spider.request_delay() <= Duration::from_secs(3600));
    }

    #[tokio::test]
    async fn test_config_file_created_on_first_load() -> Result<()> {
        let dir = tempdir()?;
        let manager = ConfigManager::with_path(dir.path().join("nested").join("config.json"));

        let first = manager.load_config().await?;
        assert!(manager.config_path().exists());

        let second = manager.load_config().await?;
        assert_eq!(first, second);
        Ok(())
    }

    #[tokio::test]
    async fn test_partial_config_file_uses_defaults() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("config.json");
        tokio::fs::write(&path, r#"{"spider": {"max_retries": 5}}"#).await?;

        let config = ConfigManager::with_path(&path).load_config().await?;
        assert_eq!(config.spider.max_retries, 5);
        assert_eq!(config.spider.concurrent_requests, 5);
        assert_eq!(config.schedule.crawl_time, "02:00");
        Ok(())
    }
}
