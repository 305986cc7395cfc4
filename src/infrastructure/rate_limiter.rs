//! Request pacing shared by all spiders of a crawl
//!
//! Two gates, taken in order for every fetch attempt:
//! 1. a fair semaphore bounding in-flight requests
//! 2. a keyed GCRA limiter spacing requests to the same host by `request_delay`
//!
//! The permit is held for the duration of the request and released on drop.

use std::sync::Arc;
use std::time::Duration;

use governor::{
    Jitter, Quota, RateLimiter as GovernorLimiter, clock::DefaultClock, state::keyed::DefaultKeyedStateStore,
};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::trace;

type HostLimiter = GovernorLimiter<String, DefaultKeyedStateStore<String>, DefaultClock>;

/// Held while a request is in flight
#[derive(Debug)]
pub struct RequestPermit {
    _permit: OwnedSemaphorePermit,
}

pub struct RateLimiter {
    permits: Arc<Semaphore>,
    capacity: usize,
    spacing: Option<HostLimiter>,
    jitter: Duration,
}

impl RateLimiter {
    /// `concurrent_requests` must be at least 1; a zero `request_delay` disables spacing
    pub fn new(concurrent_requests: usize, request_delay: Duration) -> Self {
        let capacity = concurrent_requests.max(1);
        let spacing = Quota::with_period(request_delay).map(GovernorLimiter::keyed);
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
            spacing,
            jitter: request_delay / 4,
        }
    }

    /// Wait for an in-flight slot, then for the host's spacing
    pub async fn acquire(&self, host: &str) -> Option<RequestPermit> {
        let permit = self.permits.clone().acquire_owned().await.ok()?;
        self.wait_for_host(host).await;
        Some(RequestPermit { _permit: permit })
    }

    /// Like `acquire`, but gives up as soon as `cancel` fires
    pub async fn acquire_until(&self, host: &str, cancel: &CancellationToken) -> Option<RequestPermit> {
        if cancel.is_cancelled() {
            return None;
        }
        tokio::select! {
            permit = self.acquire(host) => permit,
            () = cancel.cancelled() => None,
        }
    }

    async fn wait_for_host(&self, host: &str) {
        if let Some(spacing) = &self.spacing {
            let key = host.to_string();
            spacing.until_key_ready_with_jitter(&key, Jitter::up_to(self.jitter)).await;
            trace!("⏱️ Host slot granted: {}", host);
        }
    }

    /// Requests currently holding a permit
    pub fn in_flight(&self) -> usize {
        self.capacity - self.permits.available_permits()
    }
}

/// Host part of a URL, used as the spacing key
pub fn host_key(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|parsed| parsed.host_str().map(str::to_string))
        .unwrap_or_else(|| url.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn test_in_flight_never_exceeds_capacity() {
        let limiter = Arc::new(RateLimiter::new(2, Duration::ZERO));
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let started = tokio::time::Instant::now();
        let mut handles = Vec::new();
        for _ in 0..10 {
            let limiter = limiter.clone();
            let current = current.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                let _permit = limiter.acquire("item.jd.com").await.unwrap();
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                current.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 2);
        assert!(started.elapsed() >= Duration::from_millis(250));
        assert_eq!(limiter.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_same_host_requests_are_spaced() {
        let limiter = RateLimiter::new(5, Duration::from_millis(100));
        let started = Instant::now();
        for _ in 0..3 {
            let _permit = limiter.acquire("s.taobao.com").await.unwrap();
        }
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_different_hosts_do_not_wait_on_each_other() {
        let limiter = RateLimiter::new(5, Duration::from_secs(5));
        let started = Instant::now();
        let _a = limiter.acquire("search.jd.com").await.unwrap();
        let _b = limiter.acquire("item.jd.com").await.unwrap();
        let _c = limiter.acquire("club.jd.com").await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(limiter.in_flight(), 3);
    }

    #[tokio::test]
    async fn test_cancelled_acquire_returns_none() {
        let limiter = RateLimiter::new(1, Duration::ZERO);
        let _held = limiter.acquire("item.jd.com").await.unwrap();

        let token = CancellationToken::new();
        token.cancel();
        assert!(limiter.acquire_until("item.jd.com", &token).await.is_none());
    }

    #[test]
    fn test_host_key() {
        assert_eq!(host_key("https://item.jd.com/100.html"), "item.jd.com");
        assert_eq!(host_key("not a url"), "not a url");
    }
}
