//! Page parsers for the supported platforms
//!
//! Each parser implements `PageParser` and is pure: it sees a response body
//! and returns raw records. Shared extraction helpers live here.

pub mod jd_parser;
pub mod taobao_parser;

pub use jd_parser::JdPageParser;
pub use taobao_parser::TaobaoPageParser;

use scraper::{ElementRef, Selector};
use serde_json::Value;

use crate::domain::ParseError;

/// Compile a CSS selector, reporting which one failed
pub(crate) fn compile(selector: &str) -> Result<Selector, ParseError> {
    Selector::parse(selector).map_err(|e| ParseError::InvalidSelector {
        selector: selector.to_string(),
        reason: e.to_string(),
    })
}

/// Text content of an element with whitespace collapsed
pub(crate) fn element_text(element: ElementRef<'_>) -> String {
    element.text().flat_map(str::split_whitespace).collect::<Vec<_>>().join(" ")
}

/// First non-empty text among `selector` matches
pub(crate) fn first_text(root: ElementRef<'_>, selector: &Selector) -> Option<String> {
    root.select(selector).map(element_text).find(|text| !text.is_empty())
}

/// First number in `text` ("5,999.00" style) and the text after it
fn leading_number(text: &str) -> Option<(f64, &str)> {
    let start = text.find(|c: char| c.is_ascii_digit())?;
    let rest = &text[start..];
    let mut seen_dot = false;
    let end = rest
        .char_indices()
        .find(|&(_, c)| match c {
            '0'..='9' | ',' => false,
            '.' if !seen_dot => {
                seen_dot = true;
                false
            }
            _ => true,
        })
        .map_or(rest.len(), |(i, _)| i);

    let number = rest[..end].replace(',', "");
    let number = number.trim_end_matches('.');
    Some((number.parse().ok()?, &rest[end..]))
}

/// Numeric price from text like "¥5,999.00"
pub fn extract_price(text: &str) -> Option<f64> {
    leading_number(text).map(|(price, _)| price)
}

/// Count from text like "月销1000+", "2.3万+人付款" or "12,345"
pub fn extract_count(text: &str) -> Option<i64> {
    let (number, rest) = leading_number(text)?;
    let scaled = if rest.trim_start().starts_with('万') { number * 10_000.0 } else { number };
    Some(scaled.round() as i64)
}

/// Payload of a JSONP response (`callback({...});`), or the body itself
pub fn unwrap_jsonp(body: &str) -> &str {
    let trimmed = body.trim();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        return trimmed;
    }
    match (trimmed.find('('), trimmed.rfind(')')) {
        (Some(start), Some(end)) if start < end => trimmed[start + 1..end].trim(),
        _ => trimmed,
    }
}

pub(crate) fn parse_json(context: &str, payload: &str) -> Result<Value, ParseError> {
    serde_json::from_str(payload).map_err(|e| ParseError::invalid_json(context, &e))
}

/// String field; numbers are rendered, blanks are `None`
pub(crate) fn json_string(value: &Value, key: &str) -> Option<String> {
    match value.get(key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Integer field, accepting numeric strings
pub(crate) fn json_i64(value: &Value, key: &str) -> Option<i64> {
    match value.get(key)? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.round() as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub(crate) fn json_f64(value: &Value, key: &str) -> Option<f64> {
    match value.get(key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub(crate) fn json_bool(value: &Value, key: &str) -> bool {
    match value.get(key) {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_i64().is_some_and(|n| n != 0),
        Some(Value::String(s)) => matches!(s.as_str(), "true" | "1"),
        _ => false,
    }
}

/// Split "key: value" (ASCII or full-width colon)
pub(crate) fn split_pair(text: &str) -> Option<(String, String)> {
    let (key, value) = text.split_once([':', '：'])?;
    let (key, value) = (key.trim(), value.trim());
    if key.is_empty() || value.is_empty() {
        return None;
    }
    Some((key.to_string(), value.to_string()))
}
