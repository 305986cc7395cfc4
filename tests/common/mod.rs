//! Shared test doubles for the integration suites
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use spidermail_lib::domain::{FailureKind, FetchError};
use spidermail_lib::infrastructure::http_client::{FetchClient, FetchRequest, RawResponse};
use spidermail_lib::infrastructure::{IdentityRotator, RateLimiter, RequestExecutor, RetryController, RetryPolicy};

enum Reply {
    Body(String),
    Fail(FailureKind),
}

/// Fake web: the first route whose pattern occurs in the full request URL answers
pub struct SiteFetcher {
    routes: Vec<(String, Reply)>,
    latency: Duration,
    seen: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl SiteFetcher {
    pub fn new() -> Self {
        Self {
            routes: Vec::new(),
            latency: Duration::ZERO,
            seen: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn page(mut self, pattern: &str, body: &str) -> Self {
        self.routes.push((pattern.to_string(), Reply::Body(body.to_string())));
        self
    }

    pub fn fail(mut self, pattern: &str, kind: FailureKind) -> Self {
        self.routes.push((pattern.to_string(), Reply::Fail(kind)));
        self
    }

    /// Every fetch takes `latency` (tokio time)
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Full URLs fetched that contain `pattern`
    pub fn hits(&self, pattern: &str) -> usize {
        self.seen.lock().unwrap().iter().filter(|url| url.contains(pattern)).count()
    }

    pub fn total(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    /// Highest number of fetches observed running at once
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FetchClient for SiteFetcher {
    async fn fetch(&self, request: &FetchRequest) -> Result<RawResponse, FetchError> {
        let url = request.full_url();
        self.seen.lock().unwrap().push(url.clone());

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match self.routes.iter().find(|(pattern, _)| url.contains(pattern.as_str())) {
            Some((_, Reply::Body(body))) => Ok(RawResponse {
                url: request.url.clone(),
                status: 200,
                body: body.clone(),
                fetched_at: Utc::now(),
            }),
            Some((_, Reply::Fail(kind))) => Err(FetchError::new(*kind, &request.url, "scripted failure")),
            None => Err(FetchError::from_status(404, &request.url)),
        }
    }
}

/// Executor without host spacing, so tests only wait on backoff and latency
pub fn executor(fetcher: Arc<SiteFetcher>, concurrent: usize, max_retries: u32) -> RequestExecutor {
    RequestExecutor::new(
        fetcher,
        Arc::new(RateLimiter::new(concurrent, Duration::ZERO)),
        RetryController::new(RetryPolicy::new(max_retries, Duration::from_millis(100)).without_jitter()),
        IdentityRotator::default(),
        Duration::from_secs(30),
    )
}

pub fn quick_retry() -> RetryController {
    RetryController::new(RetryPolicy::new(2, Duration::from_millis(1)).without_jitter())
}
