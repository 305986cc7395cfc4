//! Platform seams: spiders and page parsers
//!
//! The coordinator only ever sees `dyn Spider`. Each platform variant turns
//! its operations into fetches and hands the bodies to a `PageParser`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::entities::{Platform, ProductSummary, RawProduct, RawReview};
use crate::domain::errors::{ParseError, SpiderError};

#[async_trait]
pub trait Spider: Send + Sync {
    fn platform(&self) -> Platform;

    /// One page of search results. An empty page is a valid outcome.
    async fn search_products(&self, keyword: &str, page: u32) -> Result<Vec<ProductSummary>, SpiderError>;

    async fn get_product_details(&self, product_id: &str) -> Result<RawProduct, SpiderError>;

    /// One page of reviews. Calling again with the same page refetches that page.
    async fn get_product_reviews(&self, product_id: &str, page: u32) -> Result<Vec<RawReview>, SpiderError>;
}

/// Platform-specific page layout knowledge. Pure: no I/O.
pub trait PageParser: Send + Sync {
    fn parse_search(&self, body: &str) -> Result<Vec<ProductSummary>, ParseError>;

    /// `Ok(None)` when the page says the product does not exist
    fn parse_product(
        &self,
        product_id: &str,
        body: &str,
        fetched_at: DateTime<Utc>,
    ) -> Result<Option<RawProduct>, ParseError>;

    fn parse_reviews(&self, product_id: &str, body: &str) -> Result<Vec<RawReview>, ParseError>;
}
