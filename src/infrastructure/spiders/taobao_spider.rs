//! Taobao / Tmall spider

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::domain::{PageParser, ParseError, Platform, ProductSummary, RawProduct, RawReview, Spider, SpiderError};
use crate::infrastructure::parsing::TaobaoPageParser;
use crate::infrastructure::request_executor::RequestExecutor;

pub const SEARCH_URL: &str = "https://s.taobao.com/search";
pub const ITEM_URL: &str = "https://item.taobao.com/item.htm";
pub const REVIEW_URL: &str = "https://rate.tmall.com/list_detail_rate.htm";

pub const SEARCH_PAGE_SIZE: u32 = 44;
pub const REVIEW_PAGE_SIZE: u32 = 20;

const BLOCK_MARKERS: &[&str] = &["login.taobao.com", "sec.taobao.com", "验证码"];
const ITEM_BLOCK_MARKERS: &[&str] = &["login.taobao.com", "sec.taobao.com"];

/// Where Taobao sends requests for items that no longer exist
const MISSING_ITEM_HOST: &str = "err.taobao.com";

pub struct TaobaoSpider {
    executor: Arc<RequestExecutor>,
    parser: Arc<dyn PageParser>,
}

impl TaobaoSpider {
    pub fn new(executor: Arc<RequestExecutor>) -> Result<Self, ParseError> {
        Ok(Self::with_parser(executor, Arc::new(TaobaoPageParser::new()?)))
    }

    pub fn with_parser(executor: Arc<RequestExecutor>, parser: Arc<dyn PageParser>) -> Self {
        Self { executor, parser }
    }
}

#[async_trait]
impl Spider for TaobaoSpider {
    fn platform(&self) -> Platform {
        Platform::Taobao
    }

    async fn search_products(&self, keyword: &str, page: u32) -> Result<Vec<ProductSummary>, SpiderError> {
        let page = page.max(1);
        info!("🔍 Searching Taobao for '{}' (page {})", keyword, page);

        let request = self
            .executor
            .request(SEARCH_URL)
            .query("q", keyword)
            .query("s", (page - 1) * SEARCH_PAGE_SIZE)
            .query("sort", "sale-desc")
            .block_markers(BLOCK_MARKERS);

        let response = self.executor.execute(request).await?;
        let summaries = self
            .parser
            .parse_search(&response.body)
            .map_err(|e| SpiderError::parse(Platform::Taobao, e))?;

        if summaries.is_empty() {
            warn!(
                "⚠️ Taobao search for '{}' page {} returned nothing (no matches or silently blocked)",
                keyword, page
            );
        }
        Ok(summaries)
    }

    async fn get_product_details(&self, product_id: &str) -> Result<RawProduct, SpiderError> {
        let request = self
            .executor
            .request(ITEM_URL)
            .query("id", product_id)
            .block_markers(ITEM_BLOCK_MARKERS);
        let response = self.executor.execute(request).await?;

        if response.url.contains(MISSING_ITEM_HOST) {
            debug!("Taobao item {} redirected to {}", product_id, response.url);
            return Err(SpiderError::not_found(Platform::Taobao, product_id));
        }

        self.parser
            .parse_product(product_id, &response.body, response.fetched_at)
            .map_err(|e| SpiderError::parse(Platform::Taobao, e))?
            .ok_or_else(|| SpiderError::not_found(Platform::Taobao, product_id))
    }

    async fn get_product_reviews(&self, product_id: &str, page: u32) -> Result<Vec<RawReview>, SpiderError> {
        let request = self
            .executor
            .request(REVIEW_URL)
            .query("itemId", product_id)
            .query("currentPage", page.max(1))
            .query("pageSize", REVIEW_PAGE_SIZE)
            .query("sortType", 3)
            .header("Referer", format!("{ITEM_URL}?id={product_id}"))
            .block_markers(BLOCK_MARKERS);

        let response = self.executor.execute(request).await?;
        let reviews = self
            .parser
            .parse_reviews(product_id, &response.body)
            .map_err(|e| SpiderError::parse(Platform::Taobao, e))?;

        debug!("Taobao product {} review page {}: {} reviews", product_id, page, reviews.len());
        Ok(reviews)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::errors::FailureKind;
    use crate::infrastructure::spiders::test_support::{RoutedFetcher, executor};

    fn spider(fetcher: RoutedFetcher) -> (TaobaoSpider, Arc<RoutedFetcher>) {
        let fetcher = Arc::new(fetcher);
        (TaobaoSpider::new(executor(fetcher.clone())).unwrap(), fetcher)
    }

    #[tokio::test]
    async fn test_search_offsets_by_page_size() {
        let (spider, fetcher) = spider(RoutedFetcher::new().page(
            "s.taobao.com",
            r#"<script>g_page_config = {"mods":{"itemlist":{"data":{"auctions":[{"nid":"1","raw_title":"a","view_price":"9.90"}]}}}};</script>"#,
        ));

        let results = spider.search_products("手机", 3).await.unwrap();
        assert_eq!(results.len(), 1);

        let request = &fetcher.requests_to("s.taobao.com")[0];
        assert!(request.query.contains(&("s".into(), "88".into())));
        assert!(request.query.contains(&("q".into(), "手机".into())));
    }

    #[tokio::test]
    async fn test_blocked_search_surfaces_as_fetch_error() {
        let (spider, fetcher) = spider(RoutedFetcher::new().fail("s.taobao.com", FailureKind::RateLimited));

        let err = spider.search_products("手机", 1).await.unwrap_err();
        assert!(matches!(err, SpiderError::Fetch(ref t) if t.kind() == FailureKind::RateLimited));
        // first attempt plus one retry
        assert_eq!(fetcher.requests_to("s.taobao.com").len(), 2);
    }

    #[tokio::test]
    async fn test_error_page_redirect_is_not_found() {
        let (spider, _) = spider(RoutedFetcher::new().redirect(
            "item.taobao.com",
            "https://err.taobao.com/error1.html",
            "<html></html>",
        ));

        assert!(spider.get_product_details("675842120001").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_reviews_request_the_given_page() {
        let (spider, fetcher) = spider(RoutedFetcher::new().page(
            "rate.tmall.com",
            r#"jsonp128({"rateDetail":{"rateList":[{"id":1,"rate":4,"rateContent":"还行","rateDate":"2026-09-02 08:00:00"}]}})"#,
        ));

        let reviews = spider.get_product_reviews("675842120001", 2).await.unwrap();
        assert_eq!(reviews[0].rating, Some(4));

        let request = &fetcher.requests_to("rate.tmall.com")[0];
        assert!(request.query.contains(&("currentPage".into(), "2".into())));
    }
}
