//! JD.com page layouts
//!
//! - search: `li.gl-item[data-sku]` cards
//! - detail: `div.sku-name` title, parameter list and `Ptable` specifications
//! - price feed (p.3.cn) and comment summary: JSON / JSONP side channels
//! - reviews: JSONP `fetchJSON_comment98({...})`

use chrono::{DateTime, Utc};
use scraper::{Html, Selector};
use serde_json::Value;
use tracing::debug;

use super::{
    compile, element_text, extract_price, first_text, json_f64, json_i64, json_string, parse_json,
    split_pair, unwrap_jsonp,
};
use crate::domain::{PageParser, ParseError, Platform, ProductSummary, RawProduct, RawReview};
use crate::infrastructure::spiders::jd_spider::ITEM_URL;

/// Phrases JD shows in place of a product that no longer exists
const NOT_FOUND_MARKERS: &[&str] = &["该商品已下柜", "商品已下架", "您访问的页面不存在"];

/// Price observed on the price feed
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct JdPrice {
    pub price: Option<f64>,
    pub original_price: Option<f64>,
}

/// Review statistics for one product
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CommentSummary {
    pub comment_count: i64,
    pub average_score: Option<f64>,
    pub good_rate: Option<f64>,
}

pub struct JdPageParser {
    search_item: Selector,
    search_title: Selector,
    search_price: Selector,
    sku_name: Selector,
    brand: Selector,
    shop_name: Selector,
    parameter_item: Selector,
    ptable_row: Selector,
    ptable_cell: Selector,
    ptable_list: Selector,
    term: Selector,
    definition: Selector,
}

impl JdPageParser {
    pub fn new() -> Result<Self, ParseError> {
        Ok(Self {
            search_item: compile("li.gl-item")?,
            search_title: compile("div.p-name a")?,
            search_price: compile("div.p-price i, div.p-price strong")?,
            sku_name: compile("div.sku-name")?,
            brand: compile("#parameter-brand a")?,
            shop_name: compile("div.J-hove-wrap div.name a, div.J-hove-wrap div.name, div.shopName strong a")?,
            parameter_item: compile("ul.parameter2 li, li.parameter")?,
            ptable_row: compile("table.Ptable tr")?,
            ptable_cell: compile("th, td")?,
            ptable_list: compile("div.Ptable-item dl")?,
            term: compile("dt")?,
            definition: compile("dd")?,
        })
    }

    fn specifications(&self, document: &Html) -> std::collections::BTreeMap<String, String> {
        let mut specs = std::collections::BTreeMap::new();

        for item in document.select(&self.parameter_item) {
            if let Some((key, value)) = split_pair(&element_text(item)) {
                specs.insert(key, value);
            }
        }

        for row in document.select(&self.ptable_row) {
            let cells: Vec<String> = row.select(&self.ptable_cell).map(element_text).collect();
            if let [key, value, ..] = cells.as_slice() {
                if !key.is_empty() && !value.is_empty() {
                    specs.insert(key.clone(), value.clone());
                }
            }
        }

        for list in document.select(&self.ptable_list) {
            let terms = list.select(&self.term).map(element_text);
            let definitions = list.select(&self.definition).map(element_text);
            for (key, value) in terms.zip(definitions) {
                if !key.is_empty() && !value.is_empty() {
                    specs.insert(key, value);
                }
            }
        }

        specs
    }
}

impl PageParser for JdPageParser {
    fn parse_search(&self, body: &str) -> Result<Vec<ProductSummary>, ParseError> {
        let document = Html::parse_document(body);
        let mut summaries = Vec::new();

        for item in document.select(&self.search_item) {
            let Some(sku) = item.value().attr("data-sku").map(str::trim).filter(|s| !s.is_empty()) else {
                continue;
            };

            let title = item
                .select(&self.search_title)
                .next()
                .map(|link| {
                    link.value()
                        .attr("title")
                        .map(str::trim)
                        .filter(|t| !t.is_empty())
                        .map_or_else(|| element_text(link), str::to_string)
                })
                .unwrap_or_default();
            let price = first_text(item, &self.search_price).and_then(|text| extract_price(&text));

            summaries.push(ProductSummary {
                platform: Platform::Jd,
                product_id: sku.to_string(),
                title,
                price,
                url: format!("{ITEM_URL}/{sku}.html"),
            });
        }

        debug!("Parsed {} JD search results", summaries.len());
        Ok(summaries)
    }

    fn parse_product(
        &self,
        product_id: &str,
        body: &str,
        fetched_at: DateTime<Utc>,
    ) -> Result<Option<RawProduct>, ParseError> {
        if NOT_FOUND_MARKERS.iter().any(|marker| body.contains(marker)) {
            return Ok(None);
        }

        let document = Html::parse_document(body);
        let root = document.root_element();
        let specifications = self.specifications(&document);

        let mut raw = RawProduct::new(Platform::Jd, product_id, fetched_at);
        raw.title = first_text(root, &self.sku_name);
        raw.brand = first_text(root, &self.brand).or_else(|| specifications.get("品牌").cloned());
        raw.shop_name = first_text(root, &self.shop_name);
        raw.specifications = specifications;
        raw.source_url = Some(format!("{ITEM_URL}/{product_id}.html"));
        Ok(Some(raw))
    }

    fn parse_reviews(&self, product_id: &str, body: &str) -> Result<Vec<RawReview>, ParseError> {
        if body.trim().is_empty() {
            return Ok(Vec::new());
        }

        let payload = parse_json("JD review page", unwrap_jsonp(body))?;
        let comments = payload
            .get("comments")
            .and_then(Value::as_array)
            .ok_or_else(|| ParseError::UnexpectedLayout("JD review page has no 'comments' array".into()))?;

        Ok(comments
            .iter()
            .map(|comment| RawReview {
                platform: Platform::Jd,
                product_id: product_id.to_string(),
                review_id: json_string(comment, "id"),
                user_name: json_string(comment, "nickname"),
                rating: json_i64(comment, "score"),
                content: json_string(comment, "content"),
                pros: json_string(comment, "good"),
                cons: json_string(comment, "bad"),
                helpful_count: json_i64(comment, "usefulVoteCount"),
                review_time: json_string(comment, "creationTime"),
                // JD only accepts reviews written against an order
                verified_purchase: true,
            })
            .collect())
    }
}

/// First entry of the price feed: `[{"id":"J_100","p":"5999.00","op":"6999.00"}]`
pub fn parse_price_feed(body: &str) -> Result<JdPrice, ParseError> {
    let payload = parse_json("JD price feed", unwrap_jsonp(body))?;
    let Some(entry) = payload.as_array().and_then(|entries| entries.first()) else {
        return Ok(JdPrice::default());
    };

    // A negative price means "no offer"
    let positive = |value: Option<f64>| value.filter(|p| *p >= 0.0);
    Ok(JdPrice {
        price: positive(json_f64(entry, "p")),
        original_price: positive(json_f64(entry, "op").or_else(|| json_f64(entry, "m"))),
    })
}

/// `CommentsCount[0]` of the comment summary JSONP
pub fn parse_comment_summary(body: &str) -> Result<Option<CommentSummary>, ParseError> {
    let payload = parse_json("JD comment summary", unwrap_jsonp(body))?;
    let Some(entry) = payload
        .get("CommentsCount")
        .and_then(Value::as_array)
        .and_then(|entries| entries.first())
    else {
        return Ok(None);
    };

    Ok(Some(CommentSummary {
        comment_count: json_i64(entry, "CommentCount").unwrap_or(0),
        average_score: json_f64(entry, "AverageScore"),
        good_rate: json_f64(entry, "GoodRate"),
    }))
}
