//! Infrastructure layer for fetching, parsing, persistence and process plumbing
//!
//! This module provides the HTTP fetch stack (client, identity rotation, rate
//! limiting, retries), the platform spiders and their page parsers, the SQLite
//! and in-memory repositories, configuration and logging.

pub mod config; // Configuration file and defaults
pub mod logging; // Logging infrastructure

pub mod http_client;
pub mod identity;
pub mod rate_limiter;
pub mod request_executor;
pub mod retry_manager;

pub mod parsing;
pub mod spiders;

pub mod crawl_repository;
pub mod database_connection;
pub mod memory_repository;

// Re-export commonly used items
pub use config::{AppConfig, ConfigManager, DailyTime};
pub use crawl_repository::SqliteCrawlRepository;
pub use database_connection::DatabaseConnection;
pub use http_client::{FetchClient, FetchRequest, RawResponse, ReqwestFetchClient};
pub use identity::IdentityRotator;
pub use logging::{get_log_directory, init_logging, init_logging_with_config};
pub use memory_repository::InMemoryCrawlRepository;
pub use rate_limiter::RateLimiter;
pub use request_executor::RequestExecutor;
pub use retry_manager::{RetryController, RetryPolicy};
pub use spiders::{JdSpider, TaobaoSpider, build_spider};
