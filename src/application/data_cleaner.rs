//! Cleaning and deduplication pipeline
//!
//! Turns raw spider output into validated `Product` and `Review` records:
//! text cleanup, validation, in-batch dedup by natural key (last seen wins),
//! then derived fields. Every step is a pure function of the raw batch, so
//! cleaning the same batch twice yields the same records.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

use chrono::{NaiveDate, NaiveDateTime};
use lazy_static::lazy_static;
use regex::Regex;
use scraper::Html;
use tracing::debug;

use super::text_analysis::{MAX_KEYWORDS, extract_keywords, sentiment_score};
use crate::domain::{Platform, Product, ProductStatus, RawProduct, RawReview, Review, ValidationError};

/// Review bodies longer than this are cut, not rejected
pub const MAX_CONTENT_CHARS: usize = 2000;
/// Natural keys longer than this cannot be stored
pub const MAX_ID_CHARS: usize = 100;

const DATETIME_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M", "%Y/%m/%d %H:%M:%S", "%Y/%m/%d %H:%M"];
const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%Y年%m月%d日"];

lazy_static! {
    /// Tags and comments; a `<` not followed by a letter, `/` or `!` is text
    static ref MARKUP: Regex = Regex::new(r"<[A-Za-z/!][^>]*>").expect("markup pattern compiles");
}

/// A record dropped from a batch, with the reason
#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    pub platform: Platform,
    /// Natural key when the raw record carried one
    pub key: Option<String>,
    pub error: ValidationError,
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {} rejected: {}", self.platform, self.key.as_deref().unwrap_or("<no id>"), self.error)
    }
}

/// Output of one cleaning pass
#[derive(Debug, Clone, PartialEq)]
pub struct CleanBatch<T> {
    pub valid: Vec<T>,
    pub rejections: Vec<Rejection>,
}

impl<T> CleanBatch<T> {
    pub fn rejected(&self) -> usize {
        self.rejections.len()
    }
}

#[derive(Debug, Clone)]
pub struct CleaningPipeline {
    content_limit: usize,
    keyword_limit: usize,
}

impl Default for CleaningPipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl CleaningPipeline {
    pub const fn new() -> Self {
        Self {
            content_limit: MAX_CONTENT_CHARS,
            keyword_limit: MAX_KEYWORDS,
        }
    }

    pub fn clean_products(&self, raw: Vec<RawProduct>) -> CleanBatch<Product> {
        let mut valid = Vec::with_capacity(raw.len());
        let mut rejections = Vec::new();

        for record in raw {
            let (platform, key) = (record.platform, record.product_id.clone());
            match self.clean_product(record) {
                Ok(product) => valid.push(product),
                Err(error) => rejections.push(Rejection { platform, key, error }),
            }
        }

        let valid = dedup_last_wins(valid, |p: &Product| (p.platform, p.product_id.clone()));
        debug!("🧹 Cleaned products: {} valid, {} rejected", valid.len(), rejections.len());
        CleanBatch { valid, rejections }
    }

    pub fn clean_reviews(&self, raw: Vec<RawReview>) -> CleanBatch<Review> {
        let mut valid = Vec::with_capacity(raw.len());
        let mut rejections = Vec::new();

        for record in raw {
            let (platform, key) = (record.platform, record.review_id.clone());
            match self.clean_review(record) {
                Ok(review) => valid.push(review),
                Err(error) => rejections.push(Rejection { platform, key, error }),
            }
        }

        let valid = dedup_last_wins(valid, |r: &Review| (r.platform, r.review_id.clone()));
        debug!("🧹 Cleaned reviews: {} valid, {} rejected", valid.len(), rejections.len());
        CleanBatch { valid, rejections }
    }

    pub fn clean_product(&self, raw: RawProduct) -> Result<Product, ValidationError> {
        let title = clean_optional(raw.title.as_deref()).ok_or(ValidationError::MissingField("title"))?;
        let price = non_negative("price", raw.price)?;
        let original_price = non_negative("original_price", raw.original_price)?;

        let product_id = match clean_optional(raw.product_id.as_deref()) {
            Some(id) => bounded_id("product_id", id)?,
            None => {
                let price_text = price.map(|p| p.to_string()).unwrap_or_default();
                generate_id(&[raw.platform.as_str(), &title, &price_text])
            }
        };

        let discount_rate = match raw.discount_rate {
            Some(rate) if !(0.0..=100.0).contains(&rate) => {
                return Err(ValidationError::out_of_range("discount_rate", rate, "0..=100"));
            }
            Some(rate) => Some(rate),
            None => derive_discount(price, original_price),
        };

        if let Some(rating) = raw.rating {
            if !(0.0..=5.0).contains(&rating) {
                return Err(ValidationError::out_of_range("rating", rating, "0.0..=5.0"));
            }
        }

        let status = match clean_optional(raw.status.as_deref()) {
            None => ProductStatus::Active,
            Some(status) => ProductStatus::parse(&status).ok_or(ValidationError::InvalidStatus(status))?,
        };

        let specifications: BTreeMap<String, String> = raw
            .specifications
            .iter()
            .filter_map(|(key, value)| Some((clean_optional(Some(key.as_str()))?, clean_optional(Some(value.as_str()))?)))
            .collect();

        Ok(Product {
            product_id,
            platform: raw.platform,
            title,
            brand: clean_optional(raw.brand.as_deref()),
            price,
            original_price,
            discount_rate,
            sales_count: count("sales_count", raw.sales_count)?,
            review_count: count("review_count", raw.review_count)?,
            rating: raw.rating,
            category: clean_optional(raw.category.as_deref()),
            specifications,
            shop_name: clean_optional(raw.shop_name.as_deref()),
            status,
            source_url: raw.source_url.map(|url| url.trim().to_string()).filter(|url| !url.is_empty()),
            crawled_at: raw.fetched_at,
        })
    }

    pub fn clean_review(&self, raw: RawReview) -> Result<Review, ValidationError> {
        let product_id = clean_optional(Some(raw.product_id.as_str())).ok_or(ValidationError::MissingField("product_id"))?;
        let product_id = bounded_id("product_id", product_id)?;

        let rating = raw.rating.ok_or(ValidationError::MissingField("rating"))?;
        let rating = u8::try_from(rating)
            .ok()
            .filter(|r| (1..=5).contains(r))
            .ok_or_else(|| ValidationError::out_of_range("rating", rating, "1..=5"))?;

        let raw_time = clean_optional(raw.review_time.as_deref()).ok_or(ValidationError::MissingField("review_time"))?;
        let review_time = parse_review_time(&raw_time)?;

        let raw_user = clean_optional(raw.user_name.as_deref());
        let review_id = match clean_optional(raw.review_id.as_deref()) {
            Some(id) => bounded_id("review_id", id)?,
            None => generate_id(&[&product_id, raw_user.as_deref().unwrap_or_default(), &raw_time]),
        };

        let content: String = clean_optional(raw.content.as_deref())
            .unwrap_or_default()
            .chars()
            .take(self.content_limit)
            .collect();
        let pros = clean_optional(raw.pros.as_deref());
        let cons = clean_optional(raw.cons.as_deref());

        let texts: Vec<&str> = [Some(content.as_str()), pros.as_deref(), cons.as_deref()]
            .into_iter()
            .flatten()
            .collect();

        Ok(Review {
            review_id,
            product_id,
            platform: raw.platform,
            user_name: raw_user.as_deref().map(anonymize),
            rating,
            helpful_count: count("helpful_count", raw.helpful_count)?,
            review_time,
            verified_purchase: raw.verified_purchase,
            sentiment_score: sentiment_score(&texts.join("\n")),
            keywords: extract_keywords(&texts, self.keyword_limit),
            content,
            pros,
            cons,
        })
    }
}

/// Keep one record per key: first position, last value
fn dedup_last_wins<T, K, F>(records: Vec<T>, key: F) -> Vec<T>
where
    K: Eq + Hash,
    F: Fn(&T) -> K,
{
    let mut positions: HashMap<K, usize> = HashMap::new();
    let mut unique: Vec<T> = Vec::with_capacity(records.len());

    for record in records {
        match positions.get(&key(&record)) {
            Some(&index) => unique[index] = record,
            None => {
                positions.insert(key(&record), unique.len());
                unique.push(record);
            }
        }
    }
    unique
}

/// Strip markup and control characters, decode HTML entities, collapse whitespace
pub fn clean_text(raw: &str) -> String {
    let stripped = MARKUP.replace_all(raw, " ");
    let decoded = decode_entities(&scrub(&stripped));
    scrub(&decoded).split_whitespace().collect::<Vec<_>>().join(" ")
}

fn clean_optional(raw: Option<&str>) -> Option<String> {
    raw.map(clean_text).filter(|text| !text.is_empty())
}

fn scrub(text: &str) -> String {
    text.chars()
        .filter(|c| !matches!(c, '\u{200b}'..='\u{200f}' | '\u{feff}'))
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect()
}

/// Named and numeric references, with every `<` left as literal text
fn decode_entities(text: &str) -> String {
    if !text.contains('&') {
        return text.to_string();
    }
    Html::parse_fragment(&text.replace('<', "&lt;"))
        .root_element()
        .text()
        .collect()
}

fn non_negative(field: &'static str, value: Option<f64>) -> Result<Option<f64>, ValidationError> {
    match value {
        Some(v) if !v.is_finite() || v < 0.0 => Err(ValidationError::out_of_range(field, v, ">= 0")),
        other => Ok(other),
    }
}

fn count(field: &'static str, value: Option<i64>) -> Result<u64, ValidationError> {
    let value = value.unwrap_or(0);
    u64::try_from(value).map_err(|_| ValidationError::out_of_range(field, value, ">= 0"))
}

fn bounded_id(field: &'static str, id: String) -> Result<String, ValidationError> {
    if id.chars().count() > MAX_ID_CHARS {
        return Err(ValidationError::TooLong { field, max: MAX_ID_CHARS });
    }
    Ok(id)
}

/// Percentage off the original price, two decimals
pub fn derive_discount(price: Option<f64>, original_price: Option<f64>) -> Option<f64> {
    match (price, original_price) {
        (Some(price), Some(original)) if original > 0.0 && original > price => {
            Some(((1.0 - price / original) * 10_000.0).round() / 100.0)
        }
        _ => None,
    }
}

/// Stable 16-hex-char id from the given parts
pub fn generate_id(parts: &[&str]) -> String {
    let hash = blake3::hash(parts.join("_").as_bytes());
    hash.to_hex()[..16].to_string()
}

/// Keep the first one or two characters of a user name
pub fn anonymize(name: &str) -> String {
    if name.contains('*') {
        return name.to_string();
    }
    let keep = if name.chars().count() <= 2 { 1 } else { 2 };
    let prefix: String = name.chars().take(keep).collect();
    format!("{prefix}**")
}

pub fn parse_review_time(text: &str) -> Result<NaiveDateTime, ValidationError> {
    let text = text.trim();
    DATETIME_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(text, format).ok())
        .or_else(|| {
            DATE_FORMATS
                .iter()
                .find_map(|format| NaiveDate::parse_from_str(text, format).ok())
                .and_then(|date| date.and_hms_opt(0, 0, 0))
        })
        .ok_or_else(|| ValidationError::InvalidTime(text.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rstest::rstest;

    fn raw_review(id: &str, rating: i64) -> RawReview {
        let mut raw = RawReview::new(Platform::Jd, "100012043978");
        raw.review_id = Some(id.to_string());
        raw.user_name = Some("zhangsan".into());
        raw.rating = Some(rating);
        raw.content = Some("<p>屏幕&nbsp;清晰，\n\n电池  耐用</p>".into());
        raw.review_time = Some("2026-09-01 10:00:00".into());
        raw.helpful_count = Some(3);
        raw
    }

    fn raw_product(id: &str) -> RawProduct {
        let mut raw = RawProduct::new(Platform::Taobao, id, Utc::now());
        raw.title = Some("  Apple iPhone 15\t128GB ".into());
        raw.price = Some(5399.0);
        raw.original_price = Some(5999.0);
        raw
    }

    #[rstest]
    #[case("<b>好</b>评", "好 评")]
    #[case("价格<5000 还行", "价格<5000 还行")]
    #[case("a\u{0}b\u{200b}c", "a bc")]
    #[case("Tom &amp; Jerry&nbsp;&lt;3", "Tom & Jerry <3")]
    #[case("好&hellip;&#20013;x", "好…中x")]
    #[case("&#x4E2D;&#X56FD; &eacute;&trade;", "中国 é™")]
    #[case("<!-- ad -->正品<br/>&yen;99", "正品 ¥99")]
    #[case("a <b & c", "a <b & c")]
    fn test_clean_text(#[case] raw: &str, #[case] expected: &str) {
        assert_eq!(clean_text(raw), expected);
    }

    #[rstest]
    #[case("2026-09-01 10:00:00")]
    #[case("2026-09-01 10:00")]
    #[case("2026/09/01")]
    #[case("2026年09月01日")]
    fn test_review_time_formats(#[case] text: &str) {
        let parsed = parse_review_time(text).unwrap();
        assert_eq!(parsed.date(), NaiveDate::from_ymd_opt(2026, 9, 1).unwrap());
    }

    #[test]
    fn test_unparseable_review_time_is_rejected() {
        let mut raw = raw_review("1", 5);
        raw.review_time = Some("昨天".into());
        assert_eq!(
            CleaningPipeline::new().clean_review(raw).unwrap_err(),
            ValidationError::InvalidTime("昨天".into())
        );
    }

    #[rstest]
    #[case(0)]
    #[case(6)]
    #[case(-1)]
    fn test_out_of_range_rating_is_rejected(#[case] rating: i64) {
        let batch = CleaningPipeline::new().clean_reviews(vec![raw_review("1", rating)]);
        assert!(batch.valid.is_empty());
        assert_eq!(batch.rejected(), 1);
        assert!(matches!(batch.rejections[0].error, ValidationError::OutOfRange { field: "rating", .. }));
    }

    #[test]
    fn test_review_fields_are_cleaned_and_derived() {
        let review = CleaningPipeline::new().clean_review(raw_review("1", 5)).unwrap();

        assert_eq!(review.content, "屏幕 清晰， 电池 耐用");
        assert_eq!(review.user_name.as_deref(), Some("zh**"));
        assert_eq!(review.helpful_count, 3);
        assert_eq!(review.sentiment_score, 1.0);
        assert_eq!(review.keywords, vec!["屏幕", "电池"]);
    }

    #[test]
    fn test_duplicate_reviews_keep_last_helpful_count() {
        let mut updated = raw_review("1", 5);
        updated.helpful_count = Some(9);
        let batch = CleaningPipeline::new().clean_reviews(vec![raw_review("1", 5), raw_review("2", 4), updated]);

        assert_eq!(batch.valid.len(), 2);
        assert_eq!(batch.valid[0].review_id, "1");
        assert_eq!(batch.valid[0].helpful_count, 9);
        assert_eq!(batch.valid[1].review_id, "2");
    }

    #[test]
    fn test_missing_review_id_is_generated_deterministically() {
        let mut raw = raw_review("x", 4);
        raw.review_id = None;
        let first = CleaningPipeline::new().clean_review(raw.clone()).unwrap();
        let second = CleaningPipeline::new().clean_review(raw).unwrap();

        assert_eq!(first.review_id.len(), 16);
        assert_eq!(first.review_id, second.review_id);
    }

    #[test]
    fn test_long_content_is_truncated() {
        let mut raw = raw_review("1", 3);
        raw.content = Some("好".repeat(MAX_CONTENT_CHARS + 50));
        let review = CleaningPipeline::new().clean_review(raw).unwrap();
        assert_eq!(review.content.chars().count(), MAX_CONTENT_CHARS);
    }

    #[test]
    fn test_product_discount_is_derived() {
        let product = CleaningPipeline::new().clean_product(raw_product("1")).unwrap();
        assert_eq!(product.title, "Apple iPhone 15 128GB");
        assert_eq!(product.discount_rate, Some(10.0));
        assert_eq!(product.status, ProductStatus::Active);
    }

    #[rstest]
    #[case::negative_price(|p: &mut RawProduct| p.price = Some(-1.0), "price")]
    #[case::rating(|p: &mut RawProduct| p.rating = Some(5.5), "rating")]
    #[case::discount(|p: &mut RawProduct| p.discount_rate = Some(120.0), "discount_rate")]
    #[case::sales(|p: &mut RawProduct| p.sales_count = Some(-3), "sales_count")]
    fn test_invalid_products_are_rejected(#[case] mutate: fn(&mut RawProduct), #[case] field: &str) {
        let mut raw = raw_product("1");
        mutate(&mut raw);
        let batch = CleaningPipeline::new().clean_products(vec![raw]);
        assert!(batch.valid.is_empty());
        assert!(matches!(&batch.rejections[0].error, ValidationError::OutOfRange { field: f, .. } if *f == field));
    }

    #[test]
    fn test_product_without_title_is_rejected() {
        let mut raw = raw_product("1");
        raw.title = Some("<br/>".into());
        assert_eq!(
            CleaningPipeline::new().clean_product(raw).unwrap_err(),
            ValidationError::MissingField("title")
        );
    }

    #[test]
    fn test_unknown_status_is_rejected() {
        let mut raw = raw_product("1");
        raw.status = Some("archived".into());
        assert_eq!(
            CleaningPipeline::new().clean_product(raw).unwrap_err(),
            ValidationError::InvalidStatus("archived".into())
        );
    }

    #[test]
    fn test_cleaning_twice_is_identical() {
        let pipeline = CleaningPipeline::new();
        let raw = vec![raw_review("1", 5), raw_review("1", 4), raw_review("2", 6)];
        assert_eq!(pipeline.clean_reviews(raw.clone()), pipeline.clean_reviews(raw));
    }

    #[test]
    fn test_anonymize() {
        assert_eq!(anonymize("张"), "张**");
        assert_eq!(anonymize("张三丰"), "张三**");
        assert_eq!(anonymize("j***1"), "j***1");
    }
}
