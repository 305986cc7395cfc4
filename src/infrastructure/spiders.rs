//! Platform spiders
//!
//! A spider turns its three operations into paced, retried fetches through the
//! shared `RequestExecutor` and hands each body to its `PageParser`.

pub mod jd_spider;
pub mod taobao_spider;

pub use jd_spider::JdSpider;
pub use taobao_spider::TaobaoSpider;

use std::sync::Arc;

use crate::domain::{ConfigError, ParseError, Platform, Spider};
use crate::infrastructure::request_executor::RequestExecutor;

/// Default spider for `platform`, sharing `executor`
pub fn build_spider(platform: Platform, executor: Arc<RequestExecutor>) -> Result<Arc<dyn Spider>, ConfigError> {
    let spider: Arc<dyn Spider> = match platform {
        Platform::Jd => Arc::new(JdSpider::new(executor).map_err(parser_setup_error)?),
        Platform::Taobao => Arc::new(TaobaoSpider::new(executor).map_err(parser_setup_error)?),
    };
    Ok(spider)
}

fn parser_setup_error(error: ParseError) -> ConfigError {
    ConfigError::invalid("platform.platforms", format!("page parser could not be built: {error}"))
}
