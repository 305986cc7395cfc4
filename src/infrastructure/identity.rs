//! Client identity rotation
//!
//! Each request presents a browser-like identity picked from a pool.

use std::sync::atomic::{AtomicUsize, Ordering};

pub const DEFAULT_USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:125.0) Gecko/20100101 Firefox/125.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 14_4) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36 Edg/124.0.0.0",
];

/// Headers and proxy presented by one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    pub user_agent: String,
    pub proxy: Option<String>,
}

impl ClientIdentity {
    /// Browser headers sent alongside the User-Agent
    pub fn headers(&self) -> Vec<(String, String)> {
        vec![
            ("User-Agent".into(), self.user_agent.clone()),
            (
                "Accept".into(),
                "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8".into(),
            ),
            ("Accept-Language".into(), "zh-CN,zh;q=0.9,en;q=0.8".into()),
            ("Connection".into(), "keep-alive".into()),
        ]
    }
}

/// Picks a User-Agent at random and cycles through proxies
#[derive(Debug)]
pub struct IdentityRotator {
    user_agents: Vec<String>,
    proxies: Vec<String>,
    rotate: bool,
    next_proxy: AtomicUsize,
}

impl IdentityRotator {
    pub fn new(rotate: bool, proxies: Vec<String>) -> Self {
        Self {
            user_agents: DEFAULT_USER_AGENTS.iter().map(|ua| (*ua).to_string()).collect(),
            proxies,
            rotate,
            next_proxy: AtomicUsize::new(0),
        }
    }

    /// Replace the built-in pool; an empty list keeps it
    pub fn with_user_agents(mut self, user_agents: Vec<String>) -> Self {
        if !user_agents.is_empty() {
            self.user_agents = user_agents;
        }
        self
    }

    pub fn next_identity(&self) -> ClientIdentity {
        let user_agent = if self.rotate {
            self.user_agents[fastrand::usize(..self.user_agents.len())].clone()
        } else {
            self.user_agents[0].clone()
        };

        let proxy = if self.proxies.is_empty() {
            None
        } else {
            let index = self.next_proxy.fetch_add(1, Ordering::Relaxed) % self.proxies.len();
            Some(self.proxies[index].clone())
        };

        ClientIdentity { user_agent, proxy }
    }
}

impl Default for IdentityRotator {
    fn default() -> Self {
        Self::new(true, Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_comes_from_pool() {
        let rotator = IdentityRotator::default();
        for _ in 0..20 {
            let identity = rotator.next_identity();
            assert!(DEFAULT_USER_AGENTS.contains(&identity.user_agent.as_str()));
            assert!(identity.proxy.is_none());
        }
    }

    #[test]
    fn test_fixed_identity_without_rotation() {
        let rotator = IdentityRotator::new(false, Vec::new());
        let first = rotator.next_identity();
        assert_eq!(first, rotator.next_identity());
        assert_eq!(first.user_agent, DEFAULT_USER_AGENTS[0]);
    }

    #[test]
    fn test_custom_pool_replaces_defaults_unless_empty() {
        let custom = IdentityRotator::new(true, Vec::new()).with_user_agents(vec!["ua-a".into(), "ua-b".into()]);
        for _ in 0..10 {
            assert!(["ua-a", "ua-b"].contains(&custom.next_identity().user_agent.as_str()));
        }

        let kept = IdentityRotator::new(false, Vec::new()).with_user_agents(Vec::new());
        assert_eq!(kept.next_identity().user_agent, DEFAULT_USER_AGENTS[0]);
    }

    #[test]
    fn test_proxies_cycle() {
        let rotator = IdentityRotator::new(true, vec!["http://a:1".into(), "http://b:2".into()]);
        let proxies: Vec<_> = (0..4).filter_map(|_| rotator.next_identity().proxy).collect();
        assert_eq!(proxies, vec!["http://a:1", "http://b:2", "http://a:1", "http://b:2"]);
    }

    #[test]
    fn test_headers_include_user_agent() {
        let identity = IdentityRotator::new(false, Vec::new()).next_identity();
        let headers = identity.headers();
        assert!(headers.iter().any(|(k, v)| k == "User-Agent" && *v == identity.user_agent));
        assert!(headers.iter().any(|(k, _)| k == "Accept-Language"));
    }
}
