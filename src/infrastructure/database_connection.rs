// Database connection and pool management
// This module handles SQLite database connections using sqlx

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use tracing::info;

use crate::infrastructure::config::DatabaseConfig;

pub struct DatabaseConnection {
    pool: SqlitePool,
}

impl DatabaseConnection {
    pub async fn new(database_url: &str) -> Result<Self> {
        Self::connect(database_url, 10).await
    }

    pub async fn from_config(config: &DatabaseConfig) -> Result<Self> {
        Self::connect(&config.url, config.max_connections).await
    }

    async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let db_path = database_url
            .strip_prefix("sqlite://")
            .or_else(|| database_url.strip_prefix("sqlite:"))
            .unwrap_or(database_url);

        if !db_path.starts_with(":memory:") {
            if let Some(parent) = Path::new(db_path).parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("Failed to create database directory {}", parent.display()))?;
            }
        }

        let options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("Invalid database URL: {database_url}"))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await
            .with_context(|| format!("Failed to open database {database_url}"))?;

        info!("🗄️ Database connected: {}", database_url);
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<()> {
        let create_products_sql = r"
            CREATE TABLE IF NOT EXISTS products (
                platform TEXT NOT NULL,
                product_id TEXT NOT NULL,
                title TEXT NOT NULL,
                brand TEXT,
                price REAL,
                original_price REAL,
                discount_rate REAL,
                sales_count INTEGER NOT NULL DEFAULT 0,
                review_count INTEGER NOT NULL DEFAULT 0,
                rating REAL,
                category TEXT,
                specifications TEXT NOT NULL DEFAULT '{}',
                shop_name TEXT,
                status TEXT NOT NULL DEFAULT 'active',
                source_url TEXT,
                crawled_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (platform, product_id)
            )
        ";

        let create_reviews_sql = r"
            CREATE TABLE IF NOT EXISTS reviews (
                platform TEXT NOT NULL,
                review_id TEXT NOT NULL,
                product_id TEXT NOT NULL,
                user_name TEXT,
                rating INTEGER NOT NULL CHECK (rating BETWEEN 1 AND 5),
                content TEXT NOT NULL,
                pros TEXT,
                cons TEXT,
                helpful_count INTEGER NOT NULL DEFAULT 0,
                review_time TEXT NOT NULL,
                verified_purchase INTEGER NOT NULL DEFAULT 0,
                sentiment_score REAL NOT NULL DEFAULT 0,
                keywords TEXT NOT NULL DEFAULT '[]',
                created_at TEXT NOT NULL,
                PRIMARY KEY (platform, review_id)
            )
        ";

        let create_price_history_sql = r"
            CREATE TABLE IF NOT EXISTS price_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                platform TEXT NOT NULL,
                product_id TEXT NOT NULL,
                price REAL,
                original_price REAL,
                discount_rate REAL,
                recorded_at TEXT NOT NULL
            )
        ";

        let create_crawl_tasks_sql = r"
            CREATE TABLE IF NOT EXISTS crawl_tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_name TEXT NOT NULL,
                platform TEXT NOT NULL,
                category TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'running',
                products_found INTEGER NOT NULL DEFAULT 0,
                reviews_found INTEGER NOT NULL DEFAULT 0,
                errors_count INTEGER NOT NULL DEFAULT 0,
                error_messages TEXT NOT NULL DEFAULT '[]',
                start_time TEXT NOT NULL,
                end_time TEXT,
                duration_ms INTEGER
            )
        ";

        let create_indexes_sql = r"
            CREATE INDEX IF NOT EXISTS idx_reviews_product ON reviews (platform, product_id);
            CREATE INDEX IF NOT EXISTS idx_price_history_product ON price_history (platform, product_id, recorded_at);
            CREATE INDEX IF NOT EXISTS idx_crawl_tasks_start_time ON crawl_tasks (start_time);
        ";

        sqlx::query(create_products_sql).execute(&self.pool).await?;
        sqlx::query(create_reviews_sql).execute(&self.pool).await?;
        sqlx::query(create_price_history_sql).execute(&self.pool).await?;
        sqlx::query(create_crawl_tasks_sql).execute(&self.pool).await?;
        sqlx::query(create_indexes_sql).execute(&self.pool).await?;

        Ok(())
    }
}
