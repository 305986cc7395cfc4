//! Paced, retried fetches
//!
//! Every spider request goes through here: stop check, rate limiter permit,
//! a fresh client identity, one fetch, then the retry decision.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::domain::{FetchError, TerminalError};
use crate::infrastructure::config::SpiderConfig;
use crate::infrastructure::http_client::{FetchClient, FetchRequest, RawResponse};
use crate::infrastructure::identity::IdentityRotator;
use crate::infrastructure::rate_limiter::{RateLimiter, host_key};
use crate::infrastructure::retry_manager::{RetryController, RetryPolicy};

pub struct RequestExecutor {
    fetcher: Arc<dyn FetchClient>,
    limiter: Arc<RateLimiter>,
    retry: RetryController,
    identities: IdentityRotator,
    timeout: Duration,
    cancel: CancellationToken,
}

impl RequestExecutor {
    pub fn new(
        fetcher: Arc<dyn FetchClient>,
        limiter: Arc<RateLimiter>,
        retry: RetryController,
        identities: IdentityRotator,
        timeout: Duration,
    ) -> Self {
        Self {
            fetcher,
            limiter,
            retry,
            identities,
            timeout,
            cancel: CancellationToken::new(),
        }
    }

    /// Executor wired from spider settings, with its own limiter
    pub fn from_config(fetcher: Arc<dyn FetchClient>, config: &SpiderConfig) -> Self {
        let limiter = Arc::new(RateLimiter::new(config.concurrent_requests, config.request_delay()));
        let retry = RetryController::new(RetryPolicy::new(config.max_retries, config.request_delay()));
        let identities = IdentityRotator::new(config.user_agent_rotation, config.active_proxies().to_vec())
            .with_user_agents(config.user_agents.clone());
        Self::new(fetcher, limiter, retry, identities, config.request_timeout())
    }

    /// Requests observe `token`: none starts after it fires
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub const fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// A GET request carrying the configured timeout
    pub fn request(&self, url: impl Into<String>) -> FetchRequest {
        FetchRequest::get(url, self.timeout)
    }

    pub async fn execute(&self, request: FetchRequest) -> Result<RawResponse, TerminalError> {
        let label = request.full_url();
        let request = &request;
        self.retry
            .execute_until(&label, &self.cancel, move |attempt| async move {
                self.attempt(request, attempt).await
            })
            .await
    }

    async fn attempt(&self, request: &FetchRequest, attempt: u32) -> Result<RawResponse, FetchError> {
        if self.cancel.is_cancelled() {
            return Err(FetchError::cancelled(&request.url));
        }

        let host = host_key(&request.url);
        let Some(permit) = self.limiter.acquire_until(&host, &self.cancel).await else {
            return Err(FetchError::cancelled(&request.url));
        };

        let identity = self.identities.next_identity();
        let mut outgoing = request.clone();
        let mut headers = identity.headers();
        headers.retain(|(key, _)| !request.headers.iter().any(|(own, _)| own.eq_ignore_ascii_case(key)));
        headers.append(&mut outgoing.headers);
        outgoing.headers = headers;
        if outgoing.proxy.is_none() {
            outgoing.proxy = identity.proxy;
        }

        debug!("🌐 [{}] attempt {} via {}", host, attempt, outgoing.proxy.as_deref().unwrap_or("direct"));
        let result = self.fetcher.fetch(&outgoing).await;
        drop(permit);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::errors::FailureKind;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::Mutex;

    /// Replays scripted outcomes and records what it was asked to fetch
    struct ScriptedFetcher {
        outcomes: Mutex<Vec<Result<u16, FailureKind>>>,
        seen: Mutex<Vec<FetchRequest>>,
    }

    impl ScriptedFetcher {
        fn new(outcomes: Vec<Result<u16, FailureKind>>) -> Self {
            Self {
                outcomes: Mutex::new(outcomes),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl FetchClient for ScriptedFetcher {
        async fn fetch(&self, request: &FetchRequest) -> Result<RawResponse, FetchError> {
            self.seen.lock().unwrap().push(request.clone());
            let next = self.outcomes.lock().unwrap().remove(0);
            match next {
                Ok(status) => Ok(RawResponse {
                    url: request.url.clone(),
                    status,
                    body: "ok".into(),
                    fetched_at: Utc::now(),
                }),
                Err(kind) => Err(FetchError::new(kind, &request.url, "scripted")),
            }
        }
    }

    fn executor(fetcher: Arc<ScriptedFetcher>) -> RequestExecutor {
        RequestExecutor::new(
            fetcher,
            Arc::new(RateLimiter::new(2, Duration::ZERO)),
            RetryController::new(RetryPolicy::new(3, Duration::from_millis(10)).without_jitter()),
            IdentityRotator::new(false, vec!["http://10.0.0.2:3128".into()]),
            Duration::from_secs(30),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success_with_identity_headers() {
        let fetcher = Arc::new(ScriptedFetcher::new(vec![
            Err(FailureKind::ServerError),
            Err(FailureKind::RateLimited),
            Ok(200),
        ]));
        let executor = executor(fetcher.clone());

        let request = executor.request("https://item.jd.com/1.html").header("Referer", "https://www.jd.com/");
        let response = executor.execute(request).await.unwrap();
        assert_eq!(response.status, 200);

        let seen = fetcher.seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert!(seen[0].headers.iter().any(|(k, _)| k == "User-Agent"));
        assert!(seen[0].headers.iter().any(|(k, v)| k == "Referer" && v == "https://www.jd.com/"));
        assert_eq!(seen[0].proxy.as_deref(), Some("http://10.0.0.2:3128"));
        assert_eq!(executor.limiter().in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_configured_user_agent_pool_is_used() {
        let fetcher = Arc::new(ScriptedFetcher::new(vec![Ok(200)]));
        let config = SpiderConfig {
            request_delay_secs: 0.0,
            user_agent_rotation: false,
            user_agents: vec!["spidermail-test/1.0".into()],
            ..SpiderConfig::default()
        };
        let executor = RequestExecutor::from_config(fetcher.clone(), &config);

        executor.execute(executor.request("https://item.jd.com/1.html")).await.unwrap();

        let seen = fetcher.seen.lock().unwrap();
        assert!(seen[0].headers.iter().any(|(k, v)| k == "User-Agent" && v == "spidermail-test/1.0"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_nothing_is_fetched_after_stop() {
        let fetcher = Arc::new(ScriptedFetcher::new(vec![Ok(200)]));
        let token = CancellationToken::new();
        let executor = executor(fetcher.clone()).with_cancellation(token.clone());
        token.cancel();

        let terminal = executor
            .execute(executor.request("https://item.jd.com/1.html"))
            .await
            .unwrap_err();
        assert_eq!(terminal.kind(), FailureKind::Cancelled);
        assert!(fetcher.seen.lock().unwrap().is_empty());
    }
}
