//! SQLite persistence for crawl output and task records
//!
//! Timestamps are stored as fixed-width RFC 3339 UTC strings so that
//! lexical order matches chronological order.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{Row, SqlitePool};

use crate::domain::{
    CrawlRepository, CrawlTask, PersistenceError, Platform, PriceSnapshot, Product, Review, ReviewInsert, TaskHandle,
    TaskStatus,
};

const REVIEW_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

fn timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(entity: &'static str, value: &str) -> Result<DateTime<Utc>, PersistenceError> {
    DateTime::parse_from_rfc3339(value)
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|e| PersistenceError::decode(entity, format!("bad timestamp '{value}': {e}")))
}

fn is_connection_error(error: &sqlx::Error) -> bool {
    matches!(error, sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_))
}

/// Connection-level failures are `Unavailable`, everything else a write failure
fn write_error(entity: &'static str) -> impl Fn(sqlx::Error) -> PersistenceError {
    move |error| {
        if is_connection_error(&error) {
            PersistenceError::Unavailable(error.to_string())
        } else {
            PersistenceError::write(entity, error.to_string())
        }
    }
}

/// Query failures on read paths; connection-level ones stay `Unavailable`
fn read_error(entity: &'static str) -> impl Fn(sqlx::Error) -> PersistenceError {
    move |error| {
        if is_connection_error(&error) {
            PersistenceError::Unavailable(error.to_string())
        } else {
            PersistenceError::decode(entity, error.to_string())
        }
    }
}

fn decode_error(entity: &'static str) -> impl Fn(sqlx::Error) -> PersistenceError {
    move |error| PersistenceError::decode(entity, error.to_string())
}

/// SQLite implementation of `CrawlRepository`
pub struct SqliteCrawlRepository {
    pool: SqlitePool,
}

impl SqliteCrawlRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_task(row: &sqlx::sqlite::SqliteRow) -> Result<CrawlTask, PersistenceError> {
        let decode = decode_error("crawl task");

        let status: String = row.try_get("status").map_err(&decode)?;
        let status: TaskStatus = status
            .parse()
            .map_err(|e: crate::domain::TaskStateError| PersistenceError::decode("crawl task", e.to_string()))?;

        let error_messages: String = row.try_get("error_messages").map_err(&decode)?;
        let error_messages: Vec<String> = serde_json::from_str(&error_messages)
            .map_err(|e| PersistenceError::decode("crawl task", e.to_string()))?;

        let start_time: String = row.try_get("start_time").map_err(&decode)?;
        let end_time: Option<String> = row.try_get("end_time").map_err(&decode)?;

        Ok(CrawlTask {
            handle: Some(TaskHandle(row.try_get("id").map_err(&decode)?)),
            task_name: row.try_get("task_name").map_err(&decode)?,
            platform: row.try_get("platform").map_err(&decode)?,
            category: row.try_get("category").map_err(&decode)?,
            status,
            products_found: row.try_get::<i64, _>("products_found").map_err(&decode)? as u32,
            reviews_found: row.try_get::<i64, _>("reviews_found").map_err(&decode)? as u32,
            errors_count: row.try_get::<i64, _>("errors_count").map_err(&decode)? as u32,
            error_messages,
            start_time: parse_timestamp("crawl task", &start_time)?,
            end_time: end_time.as_deref().map(|t| parse_timestamp("crawl task", t)).transpose()?,
            duration_ms: row.try_get("duration_ms").map_err(&decode)?,
        })
    }

    fn row_to_snapshot(row: &sqlx::sqlite::SqliteRow) -> Result<PriceSnapshot, PersistenceError> {
        let decode = decode_error("price snapshot");
        let platform: String = row.try_get("platform").map_err(&decode)?;
        let recorded_at: String = row.try_get("recorded_at").map_err(&decode)?;

        Ok(PriceSnapshot {
            product_id: row.try_get("product_id").map_err(&decode)?,
            platform: platform
                .parse::<Platform>()
                .map_err(|e| PersistenceError::decode("price snapshot", e.to_string()))?,
            price: row.try_get("price").map_err(&decode)?,
            original_price: row.try_get("original_price").map_err(&decode)?,
            discount_rate: row.try_get("discount_rate").map_err(&decode)?,
            recorded_at: parse_timestamp("price snapshot", &recorded_at)?,
        })
    }
}

#[async_trait]
impl CrawlRepository for SqliteCrawlRepository {
    async fn ping(&self) -> Result<(), PersistenceError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| PersistenceError::Unavailable(e.to_string()))?;
        Ok(())
    }

    async fn upsert_product(&self, product: &Product) -> Result<(), PersistenceError> {
        let specifications = serde_json::to_string(&product.specifications)
            .map_err(|e| PersistenceError::write("product", e.to_string()))?;

        sqlx::query(
            r"
            INSERT INTO products (
                platform, product_id, title, brand, price, original_price, discount_rate,
                sales_count, review_count, rating, category, specifications, shop_name,
                status, source_url, crawled_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (platform, product_id) DO UPDATE SET
                title = excluded.title,
                brand = excluded.brand,
                price = excluded.price,
                original_price = excluded.original_price,
                discount_rate = excluded.discount_rate,
                sales_count = excluded.sales_count,
                review_count = excluded.review_count,
                rating = excluded.rating,
                category = excluded.category,
                specifications = excluded.specifications,
                shop_name = excluded.shop_name,
                status = excluded.status,
                source_url = excluded.source_url,
                crawled_at = excluded.crawled_at,
                updated_at = excluded.updated_at
            ",
        )
        .bind(product.platform.as_str())
        .bind(&product.product_id)
        .bind(&product.title)
        .bind(&product.brand)
        .bind(product.price)
        .bind(product.original_price)
        .bind(product.discount_rate)
        .bind(product.sales_count as i64)
        .bind(product.review_count as i64)
        .bind(product.rating)
        .bind(&product.category)
        .bind(specifications)
        .bind(&product.shop_name)
        .bind(product.status.as_str())
        .bind(&product.source_url)
        .bind(timestamp(product.crawled_at))
        .bind(timestamp(Utc::now()))
        .execute(&self.pool)
        .await
        .map_err(write_error("product"))?;

        Ok(())
    }

    async fn insert_review(&self, review: &Review) -> Result<ReviewInsert, PersistenceError> {
        let keywords =
            serde_json::to_string(&review.keywords).map_err(|e| PersistenceError::write("review", e.to_string()))?;

        let inserted = sqlx::query(
            r"
            INSERT INTO reviews (
                platform, review_id, product_id, user_name, rating, content, pros, cons,
                helpful_count, review_time, verified_purchase, sentiment_score, keywords, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (platform, review_id) DO NOTHING
            ",
        )
        .bind(review.platform.as_str())
        .bind(&review.review_id)
        .bind(&review.product_id)
        .bind(&review.user_name)
        .bind(i64::from(review.rating))
        .bind(&review.content)
        .bind(&review.pros)
        .bind(&review.cons)
        .bind(review.helpful_count as i64)
        .bind(review.review_time.format(REVIEW_TIME_FORMAT).to_string())
        .bind(review.verified_purchase)
        .bind(review.sentiment_score)
        .bind(keywords)
        .bind(timestamp(Utc::now()))
        .execute(&self.pool)
        .await
        .map_err(write_error("review"))?;

        if inserted.rows_affected() == 1 {
            return Ok(ReviewInsert::Inserted);
        }

        sqlx::query("UPDATE reviews SET helpful_count = ? WHERE platform = ? AND review_id = ?")
            .bind(review.helpful_count as i64)
            .bind(review.platform.as_str())
            .bind(&review.review_id)
            .execute(&self.pool)
            .await
            .map_err(write_error("review"))?;

        Ok(ReviewInsert::AlreadyPresent)
    }

    async fn append_price_snapshot(&self, snapshot: &PriceSnapshot) -> Result<(), PersistenceError> {
        sqlx::query(
            r"
            INSERT INTO price_history (platform, product_id, price, original_price, discount_rate, recorded_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(snapshot.platform.as_str())
        .bind(&snapshot.product_id)
        .bind(snapshot.price)
        .bind(snapshot.original_price)
        .bind(snapshot.discount_rate)
        .bind(timestamp(snapshot.recorded_at))
        .execute(&self.pool)
        .await
        .map_err(write_error("price snapshot"))?;

        Ok(())
    }

    async fn create_crawl_task(
        &self,
        task_name: &str,
        platform: &str,
        category: &str,
        start_time: DateTime<Utc>,
    ) -> Result<TaskHandle, PersistenceError> {
        let result = sqlx::query(
            r"
            INSERT INTO crawl_tasks (task_name, platform, category, status, start_time)
            VALUES (?, ?, ?, 'running', ?)
            ",
        )
        .bind(task_name)
        .bind(platform)
        .bind(category)
        .bind(timestamp(start_time))
        .execute(&self.pool)
        .await
        .map_err(write_error("crawl task"))?;

        Ok(TaskHandle(result.last_insert_rowid()))
    }

    async fn update_crawl_task(&self, handle: TaskHandle, task: &CrawlTask) -> Result<(), PersistenceError> {
        let error_messages = serde_json::to_string(&task.error_messages)
            .map_err(|e| PersistenceError::write("crawl task", e.to_string()))?;

        let result = sqlx::query(
            r"
            UPDATE crawl_tasks SET
                status = ?, products_found = ?, reviews_found = ?, errors_count = ?,
                error_messages = ?, end_time = ?, duration_ms = ?
            WHERE id = ?
            ",
        )
        .bind(task.status.as_str())
        .bind(i64::from(task.products_found))
        .bind(i64::from(task.reviews_found))
        .bind(i64::from(task.errors_count))
        .bind(error_messages)
        .bind(task.end_time.map(timestamp))
        .bind(task.duration_ms)
        .bind(handle.0)
        .execute(&self.pool)
        .await
        .map_err(write_error("crawl task"))?;

        if result.rows_affected() == 0 {
            return Err(PersistenceError::UnknownTask(handle.0));
        }
        Ok(())
    }

    async fn latest_crawl_tasks(&self, limit: u32) -> Result<Vec<CrawlTask>, PersistenceError> {
        let rows = sqlx::query(
            r"
            SELECT id, task_name, platform, category, status, products_found, reviews_found,
                   errors_count, error_messages, start_time, end_time, duration_ms
            FROM crawl_tasks
            ORDER BY start_time DESC, id DESC
            LIMIT ?
            ",
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(read_error("crawl task"))?;

        rows.iter().map(Self::row_to_task).collect()
    }

    async fn prune_crawl_tasks(&self, before: DateTime<Utc>) -> Result<u64, PersistenceError> {
        let result = sqlx::query("DELETE FROM crawl_tasks WHERE start_time < ? AND status != 'running'")
            .bind(timestamp(before))
            .execute(&self.pool)
            .await
            .map_err(write_error("crawl task"))?;

        Ok(result.rows_affected())
    }

    async fn price_history(
        &self,
        platform: Platform,
        product_id: &str,
    ) -> Result<Vec<PriceSnapshot>, PersistenceError> {
        let rows = sqlx::query(
            r"
            SELECT platform, product_id, price, original_price, discount_rate, recorded_at
            FROM price_history
            WHERE platform = ? AND product_id = ?
            ORDER BY recorded_at ASC, id ASC
            ",
        )
        .bind(platform.as_str())
        .bind(product_id)
        .fetch_all(&self.pool)
        .await
        .map_err(read_error("price snapshot"))?;

        rows.iter().map(Self::row_to_snapshot).collect()
    }
}
