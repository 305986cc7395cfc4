//! Persistence contract for crawl output
//!
//! Written only by the cleaning pipeline (products, reviews, snapshots) and
//! the crawl coordinator (task records). Implementations must accept
//! concurrent calls for different product ids.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::entities::{CrawlTask, Platform, PriceSnapshot, Product, Review, TaskHandle};
use crate::domain::errors::PersistenceError;

/// Result of inserting a review
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewInsert {
    Inserted,
    /// The review id was already stored; only `helpful_count` was refreshed
    AlreadyPresent,
}

#[async_trait]
pub trait CrawlRepository: Send + Sync {
    /// Cheap reachability check, used before a task starts
    async fn ping(&self) -> Result<(), PersistenceError>;

    /// Insert or update, keyed by (platform, product_id)
    async fn upsert_product(&self, product: &Product) -> Result<(), PersistenceError>;

    /// Insert a review; a duplicate `review_id` is not an error
    async fn insert_review(&self, review: &Review) -> Result<ReviewInsert, PersistenceError>;

    async fn append_price_snapshot(&self, snapshot: &PriceSnapshot) -> Result<(), PersistenceError>;

    async fn create_crawl_task(
        &self,
        task_name: &str,
        platform: &str,
        category: &str,
        start_time: DateTime<Utc>,
    ) -> Result<TaskHandle, PersistenceError>;

    /// Overwrite status, counters, error log and end time of a task
    async fn update_crawl_task(&self, handle: TaskHandle, task: &CrawlTask) -> Result<(), PersistenceError>;

    /// Most recent tasks first
    async fn latest_crawl_tasks(&self, limit: u32) -> Result<Vec<CrawlTask>, PersistenceError>;

    /// Delete task records started before `before`; returns the number removed
    async fn prune_crawl_tasks(&self, before: DateTime<Utc>) -> Result<u64, PersistenceError>;

    /// Price snapshots of one product, oldest first
    async fn price_history(
        &self,
        platform: Platform,
        product_id: &str,
    ) -> Result<Vec<PriceSnapshot>, PersistenceError>;
}
