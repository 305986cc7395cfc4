//! JD.com spider

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::domain::{PageParser, ParseError, Platform, ProductSummary, RawProduct, RawReview, Spider, SpiderError};
use crate::infrastructure::parsing::JdPageParser;
use crate::infrastructure::parsing::jd_parser::{CommentSummary, JdPrice, parse_comment_summary, parse_price_feed};
use crate::infrastructure::request_executor::RequestExecutor;

pub const SEARCH_URL: &str = "https://search.jd.com/Search";
pub const ITEM_URL: &str = "https://item.jd.com";
pub const PRICE_URL: &str = "https://p.3.cn/prices/mgets";
pub const SUMMARY_URL: &str = "https://club.jd.com/comment/productCommentSummaries.action";
pub const REVIEW_URL: &str = "https://club.jd.com/comment/productPageComments.action";

pub const SEARCH_PAGE_SIZE: u32 = 30;
pub const REVIEW_PAGE_SIZE: u32 = 10;

/// Login and risk-control interstitials
const BLOCK_MARKERS: &[&str] = &["passport.jd.com", "验证码"];
/// Item pages can mention captchas in their own scripts, so only redirects count
const ITEM_BLOCK_MARKERS: &[&str] = &["passport.jd.com"];

pub struct JdSpider {
    executor: Arc<RequestExecutor>,
    parser: Arc<dyn PageParser>,
}

impl JdSpider {
    pub fn new(executor: Arc<RequestExecutor>) -> Result<Self, ParseError> {
        Ok(Self::with_parser(executor, Arc::new(JdPageParser::new()?)))
    }

    pub fn with_parser(executor: Arc<RequestExecutor>, parser: Arc<dyn PageParser>) -> Self {
        Self { executor, parser }
    }

    /// Real-time price; the item page only carries a placeholder
    async fn price(&self, product_id: &str) -> Option<JdPrice> {
        let request = self
            .executor
            .request(PRICE_URL)
            .query("skuIds", format!("J_{product_id}"))
            .query("type", 1);

        let result = match self.executor.execute(request).await {
            Ok(response) => parse_price_feed(&response.body).map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        result
            .inspect_err(|e| warn!("⚠️ JD price lookup failed for {}: {}", product_id, e))
            .ok()
    }

    async fn comment_summary(&self, product_id: &str) -> Option<CommentSummary> {
        let request = self
            .executor
            .request(SUMMARY_URL)
            .query("referenceIds", product_id)
            .block_markers(BLOCK_MARKERS);

        let result = match self.executor.execute(request).await {
            Ok(response) => parse_comment_summary(&response.body).map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        result
            .inspect_err(|e| warn!("⚠️ JD comment summary failed for {}: {}", product_id, e))
            .ok()
            .flatten()
    }
}

#[async_trait]
impl Spider for JdSpider {
    fn platform(&self) -> Platform {
        Platform::Jd
    }

    async fn search_products(&self, keyword: &str, page: u32) -> Result<Vec<ProductSummary>, SpiderError> {
        let page = page.max(1);
        info!("🔍 Searching JD for '{}' (page {})", keyword, page);

        let request = self
            .executor
            .request(SEARCH_URL)
            .query("keyword", keyword)
            .query("enc", "utf-8")
            .query("page", page)
            .query("psort", 3)
            .query("s", (page - 1) * SEARCH_PAGE_SIZE + 1)
            .block_markers(BLOCK_MARKERS);

        let response = self.executor.execute(request).await?;
        let summaries = self
            .parser
            .parse_search(&response.body)
            .map_err(|e| SpiderError::parse(Platform::Jd, e))?;

        if summaries.is_empty() {
            warn!("⚠️ JD search for '{}' page {} returned nothing (no matches or silently blocked)", keyword, page);
        }
        Ok(summaries)
    }

    async fn get_product_details(&self, product_id: &str) -> Result<RawProduct, SpiderError> {
        let request = self
            .executor
            .request(format!("{ITEM_URL}/{product_id}.html"))
            .block_markers(ITEM_BLOCK_MARKERS);
        let response = self.executor.execute(request).await?;

        // Delisted SKUs redirect to the storefront
        if !response.url.starts_with(ITEM_URL) {
            debug!("JD item {} redirected to {}", product_id, response.url);
            return Err(SpiderError::not_found(Platform::Jd, product_id));
        }

        let mut raw = self
            .parser
            .parse_product(product_id, &response.body, response.fetched_at)
            .map_err(|e| SpiderError::parse(Platform::Jd, e))?
            .ok_or_else(|| SpiderError::not_found(Platform::Jd, product_id))?;

        if let Some(price) = self.price(product_id).await {
            raw.price = price.price.or(raw.price);
            raw.original_price = price.original_price.or(raw.original_price);
        }
        if let Some(summary) = self.comment_summary(product_id).await {
            raw.review_count = Some(summary.comment_count);
            raw.rating = summary.average_score.or(raw.rating);
        }

        if self.executor.cancellation().is_cancelled() {
            return Err(SpiderError::Cancelled);
        }
        Ok(raw)
    }

    async fn get_product_reviews(&self, product_id: &str, page: u32) -> Result<Vec<RawReview>, SpiderError> {
        // The comment API counts pages from zero
        let api_page = page.max(1) - 1;
        let request = self
            .executor
            .request(REVIEW_URL)
            .query("productId", product_id)
            .query("score", 0)
            .query("sortType", 5)
            .query("page", api_page)
            .query("pageSize", REVIEW_PAGE_SIZE)
            .query("callback", "fetchJSON_comment98")
            .header("Referer", format!("{ITEM_URL}/{product_id}.html"))
            .block_markers(BLOCK_MARKERS);

        let response = self.executor.execute(request).await?;
        let reviews = self
            .parser
            .parse_reviews(product_id, &response.body)
            .map_err(|e| SpiderError::parse(Platform::Jd, e))?;

        debug!("JD product {} review page {}: {} reviews", product_id, page, reviews.len());
        Ok(reviews)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::errors::FailureKind;
    use crate::infrastructure::spiders::test_support::{RoutedFetcher, executor};

    const ITEM_PAGE: &str = r#"<div class="sku-name">Apple iPhone 15 (A3092) 128GB 黑色</div>
        <ul id="parameter-brand"><li>品牌： <a>Apple</a></li></ul>"#;

    fn spider(fetcher: RoutedFetcher) -> (JdSpider, Arc<RoutedFetcher>) {
        let fetcher = Arc::new(fetcher);
        (JdSpider::new(executor(fetcher.clone())).unwrap(), fetcher)
    }

    #[tokio::test]
    async fn test_search_requests_page_offsets() {
        let (spider, fetcher) = spider(RoutedFetcher::new().page(
            "search.jd.com",
            r#"<ul><li class="gl-item" data-sku="100012043978"><div class="p-name"><em>iPhone</em></div></li></ul>"#,
        ));

        let results = spider.search_products("手机", 2).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].product_id, "100012043978");

        let request = &fetcher.requests_to("search.jd.com")[0];
        assert!(request.query.contains(&("s".into(), "31".into())));
        assert!(request.query.contains(&("page".into(), "2".into())));
    }

    #[tokio::test]
    async fn test_details_merge_price_and_summary() {
        let (spider, _) = spider(
            RoutedFetcher::new()
                .page("item.jd.com", ITEM_PAGE)
                .page("p.3.cn", r#"[{"id":"J_100012043978","p":"5999.00","op":"6999.00"}]"#)
                .page(
                    "productCommentSummaries",
                    r#"{"CommentsCount":[{"CommentCount":120000,"AverageScore":4.8,"GoodRate":0.97}]}"#,
                ),
        );

        let raw = spider.get_product_details("100012043978").await.unwrap();
        assert_eq!(raw.title.as_deref(), Some("Apple iPhone 15 (A3092) 128GB 黑色"));
        assert_eq!(raw.price, Some(5999.0));
        assert_eq!(raw.original_price, Some(6999.0));
        assert_eq!(raw.review_count, Some(120000));
        assert_eq!(raw.rating, Some(4.8));
    }

    #[tokio::test]
    async fn test_side_lookups_are_optional() {
        let (spider, _) = spider(
            RoutedFetcher::new()
                .page("item.jd.com", ITEM_PAGE)
                .fail("p.3.cn", FailureKind::ClientError)
                .page("productCommentSummaries", "not json"),
        );

        let raw = spider.get_product_details("100012043978").await.unwrap();
        assert_eq!(raw.brand.as_deref(), Some("Apple"));
        assert_eq!(raw.price, None);
        assert_eq!(raw.review_count, None);
    }

    #[tokio::test]
    async fn test_redirect_off_item_page_is_not_found() {
        let (spider, fetcher) = spider(RoutedFetcher::new().redirect("item.jd.com", "https://www.jd.com/?d", "<html></html>"));

        let err = spider.get_product_details("1").await.unwrap_err();
        assert!(err.is_not_found());
        assert!(fetcher.requests_to("p.3.cn").is_empty());
    }

    #[tokio::test]
    async fn test_missing_item_fetch_is_not_retried() {
        let (spider, fetcher) = spider(RoutedFetcher::new().fail("item.jd.com", FailureKind::NotFound));

        let err = spider.get_product_details("1").await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(fetcher.requests_to("item.jd.com").len(), 1);
    }

    #[tokio::test]
    async fn test_review_pages_are_zero_based_on_the_wire() {
        let (spider, fetcher) = spider(RoutedFetcher::new().page(
            "productPageComments",
            r#"fetchJSON_comment98({"comments":[{"id":15478520001,"nickname":"j***1","score":5,"content":"很流畅","creationTime":"2026-09-01 10:00:00"}]});"#,
        ));

        let reviews = spider.get_product_reviews("100012043978", 1).await.unwrap();
        assert_eq!(reviews.len(), 1);

        let request = &fetcher.requests_to("productPageComments")[0];
        assert!(request.query.contains(&("page".into(), "0".into())));
        assert!(request.headers.iter().any(|(k, v)| k == "Referer" && v.ends_with("100012043978.html")));
    }
}
