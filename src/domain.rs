//! Domain module - Core business entities and seams
//!
//! This module contains the crawl entities, the error taxonomy and the
//! traits the application layer depends on (spiders, page parsers and the
//! persistence contract).
//!
//! Modern Rust module organization:
//! - Each module is its own file in the domain/ directory
//! - Public exports are defined here for convenience

pub mod entities;
pub mod errors;
pub mod repositories;
pub mod spider;

// Re-export commonly used items for convenience
pub use entities::{
    CrawlTask, PriceSnapshot, Platform, Product, ProductStatus, ProductSummary, RawProduct,
    RawReview, Review, TaskHandle, TaskStatus,
};
pub use errors::{
    ConfigError, FailureKind, FetchError, ParseError, PersistenceError, SpiderError,
    TaskStateError, TerminalError, ValidationError,
};
pub use repositories::{CrawlRepository, ReviewInsert};
pub use spider::{PageParser, Spider};
