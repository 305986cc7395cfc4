//! Fetch client
//!
//! Issues exactly one HTTP GET per call and classifies the outcome. Pacing
//! and retries live above this layer.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use tracing::debug;

use crate::domain::{FetchError, errors::FailureKind};

/// One GET request
#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest {
    pub url: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub timeout: Duration,
    pub proxy: Option<String>,
    /// Substrings of the final URL or body that mean the platform blocked us
    pub block_markers: &'static [&'static str],
}

impl FetchRequest {
    pub fn get(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            query: Vec::new(),
            headers: Vec::new(),
            timeout,
            proxy: None,
            block_markers: &[],
        }
    }

    pub fn query(mut self, key: &str, value: impl ToString) -> Self {
        self.query.push((key.to_string(), value.to_string()));
        self
    }

    pub fn header(mut self, key: &str, value: impl Into<String>) -> Self {
        self.headers.push((key.to_string(), value.into()));
        self
    }

    pub const fn block_markers(mut self, markers: &'static [&'static str]) -> Self {
        self.block_markers = markers;
        self
    }

    /// The request URL with its query string, as logged and reported
    pub fn full_url(&self) -> String {
        if self.query.is_empty() {
            return self.url.clone();
        }
        match url::Url::parse_with_params(&self.url, &self.query) {
            Ok(full) => full.to_string(),
            Err(_) => self.url.clone(),
        }
    }
}

/// Successful response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    /// URL after redirects
    pub url: String,
    pub status: u16,
    pub body: String,
    pub fetched_at: DateTime<Utc>,
}

#[async_trait]
pub trait FetchClient: Send + Sync {
    /// Perform one request, never retrying
    async fn fetch(&self, request: &FetchRequest) -> Result<RawResponse, FetchError>;
}

/// First marker found in the final URL or the body
pub fn detect_block<'a>(final_url: &str, body: &str, markers: &[&'a str]) -> Option<&'a str> {
    markers
        .iter()
        .copied()
        .find(|marker| final_url.contains(marker) || body.contains(marker))
}

fn classify_transport_error(error: &reqwest::Error, url: &str) -> FetchError {
    if let Some(status) = error.status() {
        return FetchError::from_status(status.as_u16(), url);
    }
    let detail = if error.is_timeout() {
        "request timed out"
    } else if error.is_connect() {
        "connection failed"
    } else {
        "transport error"
    };
    FetchError::new(FailureKind::NetworkError, url, format!("{detail}: {error}"))
}

/// reqwest-backed client. One underlying client per proxy.
pub struct ReqwestFetchClient {
    clients: Mutex<HashMap<Option<String>, Client>>,
}

impl ReqwestFetchClient {
    pub fn new() -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
        }
    }

    fn client_for(&self, proxy: Option<&String>, url: &str) -> Result<Client, FetchError> {
        let mut clients = self
            .clients
            .lock()
            .map_err(|_| FetchError::new(FailureKind::ClientError, url, "client cache poisoned"))?;

        if let Some(client) = clients.get(&proxy.cloned()) {
            return Ok(client.clone());
        }

        let mut builder = Client::builder()
            .redirect(reqwest::redirect::Policy::limited(10))
            .cookie_store(true)
            .gzip(true)
            .brotli(true);
        if let Some(proxy_url) = proxy {
            let proxy = reqwest::Proxy::all(proxy_url)
                .map_err(|e| FetchError::new(FailureKind::ClientError, url, format!("invalid proxy {proxy_url}: {e}")))?;
            builder = builder.proxy(proxy);
        }
        let client = builder
            .build()
            .map_err(|e| FetchError::new(FailureKind::ClientError, url, format!("failed to build HTTP client: {e}")))?;

        clients.insert(proxy.cloned(), client.clone());
        Ok(client)
    }
}

impl Default for ReqwestFetchClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FetchClient for ReqwestFetchClient {
    async fn fetch(&self, request: &FetchRequest) -> Result<RawResponse, FetchError> {
        let url = request.full_url();
        let client = self.client_for(request.proxy.as_ref(), &url)?;

        let mut builder = client.get(&request.url).query(&request.query).timeout(request.timeout);
        for (key, value) in &request.headers {
            builder = builder.header(key.as_str(), value.as_str());
        }

        debug!("Fetching URL: {}", url);
        let response = builder.send().await.map_err(|e| classify_transport_error(&e, &url))?;

        let status = response.status();
        let final_url = response.url().to_string();
        if !status.is_success() {
            return Err(FetchError::from_status(status.as_u16(), &url));
        }

        let body = response.text().await.map_err(|e| classify_transport_error(&e, &url))?;

        if let Some(marker) = detect_block(&final_url, &body, request.block_markers) {
            return Err(FetchError {
                kind: FailureKind::RateLimited,
                status: Some(status.as_u16()),
                url,
                message: format!("blocked by platform ({marker})"),
            });
        }

        debug!("Successfully fetched: {} ({} chars)", final_url, body.len());
        Ok(RawResponse {
            url: final_url,
            status: status.as_u16(),
            body,
            fetched_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_url_encodes_query() {
        let request = FetchRequest::get("https://search.jd.com/Search", Duration::from_secs(30))
            .query("keyword", "手机")
            .query("page", 3);
        let full = request.full_url();
        assert!(full.starts_with("https://search.jd.com/Search?keyword="));
        assert!(full.ends_with("&page=3"));
        assert!(!full.contains("手机"));
    }

    #[test]
    fn test_block_detection() {
        let markers = &["login.taobao.com", "验证码"];
        assert_eq!(
            detect_block("https://login.taobao.com/member/login.jhtml", "", markers),
            Some("login.taobao.com")
        );
        assert_eq!(detect_block("https://s.taobao.com", "<p>请输入验证码</p>", markers), Some("验证码"));
        assert_eq!(detect_block("https://s.taobao.com", "<p>ok</p>", markers), None);
        assert_eq!(detect_block("https://s.taobao.com", "验证码", &[]), None);
    }

    #[test]
    fn test_client_cached_per_proxy() {
        let fetcher = ReqwestFetchClient::new();
        fetcher.client_for(None, "https://item.jd.com/1.html").unwrap();
        fetcher.client_for(None, "https://item.jd.com/2.html").unwrap();
        fetcher
            .client_for(Some(&"http://127.0.0.1:3128".to_string()), "https://item.jd.com/3.html")
            .unwrap();
        assert_eq!(fetcher.clients.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_invalid_proxy_is_client_error() {
        let fetcher = ReqwestFetchClient::new();
        let err = fetcher
            .client_for(Some(&"::not a proxy::".to_string()), "https://item.jd.com/1.html")
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::ClientError);
    }
}
