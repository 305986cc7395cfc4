//! Taobao / Tmall page layouts
//!
//! Search results are embedded as the `g_page_config` JSON object in a script
//! tag. Detail pages are HTML; reviews come from the Tmall rate API.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use regex::Regex;
use scraper::{Html, Selector};
use serde_json::Value;
use tracing::debug;

use super::{
    compile, element_text, extract_count, extract_price, first_text, json_bool, json_i64, json_string, parse_json,
    split_pair, unwrap_jsonp,
};
use crate::domain::{PageParser, ParseError, Platform, ProductSummary, RawProduct, RawReview};
use crate::infrastructure::spiders::taobao_spider::ITEM_URL;

const NOT_FOUND_MARKERS: &[&str] = &["宝贝不存在", "此宝贝已下架", "您查看的宝贝不存在"];

const PAGE_CONFIG_PATTERN: &str = r"g_page_config\s*=\s*";

pub struct TaobaoPageParser {
    page_config: Regex,
    title: Selector,
    promo_price: Selector,
    price: Selector,
    list_price: Selector,
    sell_counter: Selector,
    rate_counter: Selector,
    shop_name: Selector,
    attribute: Selector,
    property_list: Selector,
    property_type: Selector,
    property_value: Selector,
}

impl TaobaoPageParser {
    pub fn new() -> Result<Self, ParseError> {
        let page_config = Regex::new(PAGE_CONFIG_PATTERN).map_err(|e| ParseError::InvalidSelector {
            selector: PAGE_CONFIG_PATTERN.to_string(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            page_config,
            title: compile("div.tb-detail-hd h1, h3.tb-main-title")?,
            promo_price: compile("#J_PromoPriceNum")?,
            price: compile("em.tb-rmb-num")?,
            list_price: compile("#J_StrPrice em.tb-rmb-num")?,
            sell_counter: compile("#J_SellCounter")?,
            rate_counter: compile("#J_RateCounter")?,
            shop_name: compile("div.tb-shop-name a, div.tb-shop-name, a.slogo-shopname")?,
            attribute: compile("ul.attributes-list li, #J_AttrUL li")?,
            property_list: compile("ul.tb-prop-list")?,
            property_type: compile("span.tb-property-type")?,
            property_value: compile("span.tb-property-cont")?,
        })
    }

    /// The `g_page_config` object, ignoring whatever script follows it
    fn page_config(&self, body: &str) -> Result<Value, ParseError> {
        let start = self
            .page_config
            .find(body)
            .ok_or_else(|| ParseError::UnexpectedLayout("search page has no g_page_config".into()))?
            .end();

        serde_json::Deserializer::from_str(&body[start..])
            .into_iter::<Value>()
            .next()
            .ok_or_else(|| ParseError::UnexpectedLayout("g_page_config is empty".into()))?
            .map_err(|e| ParseError::invalid_json("g_page_config", &e))
    }

    fn specifications(&self, document: &Html) -> BTreeMap<String, String> {
        let mut specs = BTreeMap::new();

        for item in document.select(&self.attribute) {
            if let Some((key, value)) = split_pair(&element_text(item)) {
                specs.insert(key, value);
            }
        }

        for list in document.select(&self.property_list) {
            let key = first_text(list, &self.property_type);
            let value = first_text(list, &self.property_value);
            if let (Some(key), Some(value)) = (key, value) {
                specs.insert(key.trim_end_matches([':', '：']).to_string(), value);
            }
        }

        specs
    }
}

impl PageParser for TaobaoPageParser {
    fn parse_search(&self, body: &str) -> Result<Vec<ProductSummary>, ParseError> {
        let config = self.page_config(body)?;
        let auctions = config
            .pointer("/mods/itemlist/data/auctions")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();

        let summaries: Vec<ProductSummary> = auctions
            .iter()
            .filter_map(|auction| {
                let nid = json_string(auction, "nid")?;
                Some(ProductSummary {
                    platform: Platform::Taobao,
                    title: json_string(auction, "raw_title")
                        .or_else(|| json_string(auction, "title"))
                        .unwrap_or_default(),
                    price: json_string(auction, "view_price").and_then(|p| extract_price(&p)),
                    url: format!("{ITEM_URL}?id={nid}"),
                    product_id: nid,
                })
            })
            .collect();

        debug!("Parsed {} Taobao search results", summaries.len());
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

        let promo = first_text(root, &self.promo_price).and_then(|t| extract_price(&t));
        let listed = first_text(root, &self.price).and_then(|t| extract_price(&t));

        let mut raw = RawProduct::new(Platform::Taobao, product_id, fetched_at);
        raw.title = first_text(root, &self.title);
        raw.price = promo.or(listed);
        if promo.is_some() {
            raw.original_price = first_text(root, &self.list_price).and_then(|t| extract_price(&t));
        }
        raw.sales_count = first_text(root, &self.sell_counter).and_then(|t| extract_count(&t));
        raw.review_count = first_text(root, &self.rate_counter).and_then(|t| extract_count(&t));
        raw.shop_name = first_text(root, &self.shop_name);
        raw.brand = specifications.get("品牌").cloned();
        raw.specifications = specifications;
        raw.source_url = Some(format!("{ITEM_URL}?id={product_id}"));
        Ok(Some(raw))
    }

    fn parse_reviews(&self, product_id: &str, body: &str) -> Result<Vec<RawReview>, ParseError> {
        let trimmed = body.trim();
        if trimmed.is_empty() {
            return Ok(Vec::new());
        }

        // The rate API sometimes answers with a bare `"rateDetail":{...}` member
        let payload = if trimmed.starts_with('"') {
            parse_json("Taobao review page", &format!("{{{trimmed}}}"))?
        } else {
            parse_json("Taobao review page", unwrap_jsonp(trimmed))?
        };

        let rate_list = payload
            .pointer("/rateDetail/rateList")
            .and_then(Value::as_array)
            .ok_or_else(|| ParseError::UnexpectedLayout("Taobao review page has no rateDetail.rateList".into()))?;

        Ok(rate_list
            .iter()
            .map(|rate| RawReview {
                platform: Platform::Taobao,
                product_id: product_id.to_string(),
                review_id: json_string(rate, "id"),
                user_name: json_string(rate, "displayUserNick"),
                rating: json_i64(rate, "rate"),
                content: json_string(rate, "rateContent"),
                pros: rate.get("appendComment").and_then(|append| json_string(append, "content")),
                cons: None,
                helpful_count: json_i64(rate, "useful"),
                review_time: json_string(rate, "rateDate"),
                verified_purchase: json_bool(rate, "goldUser"),
            })
            .collect())
    }
}
