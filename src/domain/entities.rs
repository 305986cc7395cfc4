//! Domain entities
//!
//! Contains the crawl records (raw and cleaned), price snapshots and the
//! crawl task lifecycle record.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::{ConfigError, TaskStateError};

/// Supported e-commerce platforms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Taobao,
    Jd,
}

impl Platform {
    pub const ALL: [Self; 2] = [Self::Taobao, Self::Jd];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Taobao => "taobao",
            Self::Jd => "jd",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "taobao" => Ok(Self::Taobao),
            "jd" => Ok(Self::Jd),
            other => Err(ConfigError::UnknownPlatform(other.to_string())),
        }
    }
}

/// Minimal search hit used to drive detail and review fetches. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductSummary {
    pub platform: Platform,
    pub product_id: String,
    pub title: String,
    pub price: Option<f64>,
    pub url: String,
}

/// Product record as extracted from a detail page, before cleaning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawProduct {
    pub platform: Platform,
    pub product_id: Option<String>,
    pub title: Option<String>,
    pub brand: Option<String>,
    pub price: Option<f64>,
    pub original_price: Option<f64>,
    pub discount_rate: Option<f64>,
    pub sales_count: Option<i64>,
    pub review_count: Option<i64>,
    pub rating: Option<f64>,
    pub category: Option<String>,
    pub specifications: BTreeMap<String, String>,
    pub shop_name: Option<String>,
    pub status: Option<String>,
    pub source_url: Option<String>,
    pub fetched_at: DateTime<Utc>,
}

impl RawProduct {
    pub fn new(platform: Platform, product_id: impl Into<String>, fetched_at: DateTime<Utc>) -> Self {
        Self {
            platform,
            product_id: Some(product_id.into()),
            title: None,
            brand: None,
            price: None,
            original_price: None,
            discount_rate: None,
            sales_count: None,
            review_count: None,
            rating: None,
            category: None,
            specifications: BTreeMap::new(),
            shop_name: None,
            status: None,
            source_url: None,
            fetched_at,
        }
    }
}

/// Review record as extracted from a review page, before cleaning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawReview {
    pub platform: Platform,
    pub product_id: String,
    pub review_id: Option<String>,
    pub user_name: Option<String>,
    pub rating: Option<i64>,
    pub content: Option<String>,
    pub pros: Option<String>,
    pub cons: Option<String>,
    pub helpful_count: Option<i64>,
    pub review_time: Option<String>,
    pub verified_purchase: bool,
}

impl RawReview {
    pub fn new(platform: Platform, product_id: impl Into<String>) -> Self {
        Self {
            platform,
            product_id: product_id.into(),
            review_id: None,
            user_name: None,
            rating: None,
            content: None,
            pros: None,
            cons: None,
            helpful_count: None,
            review_time: None,
            verified_purchase: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProductStatus {
    #[default]
    Active,
    Inactive,
    Deleted,
}

impl ProductStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Deleted => "deleted",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "active" => Some(Self::Active),
            "inactive" => Some(Self::Inactive),
            "deleted" => Some(Self::Deleted),
            _ => None,
        }
    }
}

/// Validated product, upserted by `product_id` within its platform
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub product_id: String,
    pub platform: Platform,
    pub title: String,
    pub brand: Option<String>,
    pub price: Option<f64>,
    pub original_price: Option<f64>,
    /// Percentage in [0, 100]
    pub discount_rate: Option<f64>,
    pub sales_count: u64,
    pub review_count: u64,
    /// Average score in [0.0, 5.0]
    pub rating: Option<f64>,
    pub category: Option<String>,
    pub specifications: BTreeMap<String, String>,
    pub shop_name: Option<String>,
    pub status: ProductStatus,
    pub source_url: Option<String>,
    pub crawled_at: DateTime<Utc>,
}

/// Validated review. Immutable once stored, except `helpful_count`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Review {
    pub review_id: String,
    pub product_id: String,
    pub platform: Platform,
    pub user_name: Option<String>,
    /// Star rating, always 1..=5
    pub rating: u8,
    pub content: String,
    pub pros: Option<String>,
    pub cons: Option<String>,
    pub helpful_count: u64,
    pub review_time: NaiveDateTime,
    pub verified_purchase: bool,
    /// Lexical sentiment in [-1.0, 1.0]
    pub sentiment_score: f64,
    /// Distinct keywords, most frequent first
    pub keywords: Vec<String>,
}

/// Append-only price observation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceSnapshot {
    pub product_id: String,
    pub platform: Platform,
    /// `None` when the crawl saw no price
    pub price: Option<f64>,
    pub original_price: Option<f64>,
    pub discount_rate: Option<f64>,
    pub recorded_at: DateTime<Utc>,
}

impl PriceSnapshot {
    /// Snapshot of the product's pricing as crawled, taken for every stored product
    pub fn from_product(product: &Product, recorded_at: DateTime<Utc>) -> Self {
        Self {
            product_id: product.product_id.clone(),
            platform: product.platform,
            price: product.price,
            original_price: product.original_price,
            discount_rate: product.discount_rate,
            recorded_at,
        }
    }
}

/// Opaque identifier of a persisted crawl task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskHandle(pub i64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = TaskStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(TaskStateError::UnknownStatus(other.to_string())),
        }
    }
}

/// One end-to-end crawl run.
///
/// `errors_count` always equals `error_messages.len()`. The status moves from
/// `Running` to exactly one terminal state; both terminal transitions stamp
/// `end_time` and `duration_ms`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrawlTask {
    pub handle: Option<TaskHandle>,
    pub task_name: String,
    pub platform: String,
    pub category: String,
    pub status: TaskStatus,
    pub products_found: u32,
    pub reviews_found: u32,
    pub errors_count: u32,
    pub error_messages: Vec<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

impl CrawlTask {
    pub fn start(
        task_name: impl Into<String>,
        platform: impl Into<String>,
        category: impl Into<String>,
        start_time: DateTime<Utc>,
    ) -> Self {
        Self {
            handle: None,
            task_name: task_name.into(),
            platform: platform.into(),
            category: category.into(),
            status: TaskStatus::Running,
            products_found: 0,
            reviews_found: 0,
            errors_count: 0,
            error_messages: Vec::new(),
            start_time,
            end_time: None,
            duration_ms: None,
        }
    }

    pub fn record_products(&mut self, count: u32) {
        self.products_found += count;
    }

    pub fn record_reviews(&mut self, count: u32) {
        self.reviews_found += count;
    }

    pub fn record_error(&mut self, message: impl Into<String>) {
        self.error_messages.push(message.into());
        self.errors_count += 1;
    }

    pub fn complete(&mut self, end_time: DateTime<Utc>) -> Result<(), TaskStateError> {
        self.finish(TaskStatus::Completed, end_time)
    }

    /// Terminates the task as failed, recording `reason` in the error log
    pub fn fail(&mut self, end_time: DateTime<Utc>, reason: impl Into<String>) -> Result<(), TaskStateError> {
        self.ensure_running()?;
        self.record_error(reason);
        self.finish(TaskStatus::Failed, end_time)
    }

    fn finish(&mut self, status: TaskStatus, end_time: DateTime<Utc>) -> Result<(), TaskStateError> {
        self.ensure_running()?;
        self.status = status;
        self.end_time = Some(end_time);
        self.duration_ms = Some((end_time - self.start_time).num_milliseconds().max(0));
        Ok(())
    }

    fn ensure_running(&self) -> Result<(), TaskStateError> {
        if self.status.is_terminal() {
            return Err(TaskStateError::AlreadyTerminal(self.status));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_platform_round_trip() {
        for platform in Platform::ALL {
            assert_eq!(platform.as_str().parse::<Platform>().unwrap(), platform);
        }
        assert!("amazon".parse::<Platform>().is_err());
        assert_eq!(" JD ".parse::<Platform>().unwrap(), Platform::Jd);
    }

    #[test]
    fn test_task_completes_once() {
        let start = Utc::now();
        let mut task = CrawlTask::start("manual_crawl", "jd", "手机", start);
        task.record_products(2);
        task.record_error("boom");

        task.complete(start + Duration::seconds(3)).unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.duration_ms, Some(3000));
        assert_eq!(task.errors_count, 1);

        let err = task.fail(start + Duration::seconds(4), "late").unwrap_err();
        assert!(matches!(err, TaskStateError::AlreadyTerminal(TaskStatus::Completed)));
        assert_eq!(task.error_messages.len(), 1);
    }

    #[test]
    fn test_failed_task_records_reason() {
        let start = Utc::now();
        let mut task = CrawlTask::start("daily_crawl", "all", "手机", start);
        task.fail(start, "cancelled").unwrap();

        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error_messages, vec!["cancelled".to_string()]);
        assert_eq!(task.errors_count, 1);
        assert!(task.end_time.is_some());
    }

    #[test]
    fn test_snapshot_carries_optional_price() {
        let product = Product {
            product_id: "100".into(),
            platform: Platform::Jd,
            title: "phone".into(),
            brand: None,
            price: None,
            original_price: None,
            discount_rate: None,
            sales_count: 0,
            review_count: 0,
            rating: None,
            category: None,
            specifications: BTreeMap::new(),
            shop_name: None,
            status: ProductStatus::Active,
            source_url: None,
            crawled_at: Utc::now(),
        };
        assert_eq!(PriceSnapshot::from_product(&product, Utc::now()).price, None);

        let priced = Product { price: Some(1999.0), ..product };
        let snapshot = PriceSnapshot::from_product(&priced, Utc::now());
        assert_eq!(snapshot.price, Some(1999.0));
    }
}
