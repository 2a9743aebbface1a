use std::collections::VecDeque;
use std::net::IpAddr;

use dashmap::DashMap;
use tracing::warn;
use ulid::Ulid;

use crate::config::RateLimitConfig;
use crate::engine::now_ms;
use crate::model::Ms;

/// Who a request is counted against: the authenticated user, else the peer address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Identity {
    User(Ulid),
    Address(IpAddr),
}

impl Identity {
    pub fn is_authenticated(&self) -> bool {
        matches!(self, Identity::User(_))
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Identity::User(id) => write!(f, "user:{id}"),
            Identity::Address(ip) => write!(f, "ip:{ip}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointClass {
    /// Ordinary booking traffic.
    Standard,
    /// Unauthenticated catalog browsing.
    Public,
    /// Credential and account endpoints.
    Sensitive,
}

impl EndpointClass {
    pub fn as_str(self) -> &'static str {
        match self {
            EndpointClass::Standard => "standard",
            EndpointClass::Public => "public",
            EndpointClass::Sensitive => "sensitive",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed { remaining: u32, reset_at: Ms },
    Denied { retry_after_ms: Ms },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed { .. })
    }
}

/// Retry-After is reported in whole seconds, so never suggest less than one.
const MIN_RETRY_AFTER_MS: Ms = 1_000;

/// Sliding-window log limiter.
///
/// Each (identity, class) key keeps the timestamps of the requests it let
/// through inside the window. Pruning, counting and recording happen under
/// the key's map shard lock, so concurrent checks on one key never lose a count.
pub struct RateLimiter {
    config: RateLimitConfig,
    windows: DashMap<(Identity, EndpointClass), VecDeque<Ms>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: DashMap::new(),
        }
    }

    pub fn limit_for(&self, identity: &Identity, class: EndpointClass) -> u32 {
        match class {
            EndpointClass::Sensitive => self.config.sensitive,
            EndpointClass::Public => self.config.public,
            EndpointClass::Standard if identity.is_authenticated() => self.config.authenticated,
            EndpointClass::Standard => self.config.anonymous,
        }
    }

    pub fn check(&self, identity: Identity, class: EndpointClass) -> Admission {
        self.check_at(identity, class, now_ms())
    }

    pub fn check_at(&self, identity: Identity, class: EndpointClass, now: Ms) -> Admission {
        let window = self.config.window_ms;
        if !self.config.enabled {
            return Admission::Allowed {
                remaining: u32::MAX,
                reset_at: now + window,
            };
        }

        let limit = self.limit_for(&identity, class);
        let mut log = self.windows.entry((identity, class)).or_default();
        prune(&mut log, now - window);

        let used = log.len() as u32;
        if used >= limit {
            let oldest = log.front().copied().unwrap_or(now);
            let retry_after_ms = (oldest + window - now).max(MIN_RETRY_AFTER_MS);
            drop(log);
            metrics::counter!(crate::observability::RATE_LIMITED_TOTAL, "class" => class.as_str()).increment(1);
            warn!(%identity, class = class.as_str(), used, limit, "rate limit exceeded");
            return Admission::Denied { retry_after_ms };
        }

        log.push_back(now);
        let reset_at = log.front().map_or(now, |t| *t) + window;
        Admission::Allowed {
            remaining: limit - used - 1,
            reset_at,
        }
    }

    /// Forget every window for `identity`.
    pub fn reset(&self, identity: &Identity) {
        self.windows.retain(|(id, _), _| id != identity);
    }

    pub fn current_count(&self, identity: &Identity, class: EndpointClass) -> u32 {
        self.current_count_at(identity, class, now_ms())
    }

    pub fn current_count_at(&self, identity: &Identity, class: EndpointClass, now: Ms) -> u32 {
        let cutoff = now - self.config.window_ms;
        self.windows
            .get(&(*identity, class))
            .map_or(0, |log| log.iter().filter(|t| **t > cutoff).count() as u32)
    }

    /// Drop keys with nothing left in their window. Returns how many went.
    pub fn evict_idle(&self, now: Ms) -> usize {
        let cutoff = now - self.config.window_ms;
        let before = self.windows.len();
        self.windows.retain(|_, log| {
            prune(log, cutoff);
            !log.is_empty()
        });
        before - self.windows.len()
    }

    pub fn tracked_keys(&self) -> usize {
        self.windows.len()
    }
}

fn prune(log: &mut VecDeque<Ms>, cutoff: Ms) {
    while log.front().is_some_and(|t| *t <= cutoff) {
        log.pop_front();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::sync::Arc;

    fn limiter(anonymous: u32) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            anonymous,
            ..RateLimitConfig::default()
        })
    }

    fn ip(last: u8) -> Identity {
        Identity::Address(IpAddr::V4(Ipv4Addr::new(10, 0, 0, last)))
    }

    #[test]
    fn allows_up_to_limit_then_denies() {
        let rl = limiter(3);
        let id = ip(1);
        let t0 = 1_000_000;

        for expected in [2, 1, 0] {
            match rl.check_at(id, EndpointClass::Standard, t0) {
                Admission::Allowed { remaining, reset_at } => {
                    assert_eq!(remaining, expected);
                    assert_eq!(reset_at, t0 + 60_000);
                }
                other => panic!("expected allowed, got {other:?}"),
            }
        }
        assert_eq!(
            rl.check_at(id, EndpointClass::Standard, t0 + 15_000),
            Admission::Denied { retry_after_ms: 45_000 }
        );
        // Denials are not counted.
        assert_eq!(rl.current_count_at(&id, EndpointClass::Standard, t0 + 15_000), 3);
    }

    #[test]
    fn window_slides() {
        let rl = limiter(2);
        let id = ip(2);
        assert!(rl.check_at(id, EndpointClass::Standard, 0).is_allowed());
        assert!(rl.check_at(id, EndpointClass::Standard, 30_000).is_allowed());
        assert!(!rl.check_at(id, EndpointClass::Standard, 59_999).is_allowed());
        // The first request leaves the window at exactly 60s.
        assert!(rl.check_at(id, EndpointClass::Standard, 60_000).is_allowed());
        assert!(!rl.check_at(id, EndpointClass::Standard, 60_001).is_allowed());
    }

    #[test]
    fn retry_after_has_a_floor() {
        let rl = limiter(1);
        let id = ip(3);
        rl.check_at(id, EndpointClass::Standard, 0);
        assert_eq!(
            rl.check_at(id, EndpointClass::Standard, 59_900),
            Admission::Denied { retry_after_ms: 1_000 }
        );
    }

    #[test]
    fn thresholds_by_identity_and_class() {
        let rl = RateLimiter::new(RateLimitConfig::default());
        let user = Identity::User(Ulid::new());
        assert_eq!(rl.limit_for(&ip(1), EndpointClass::Standard), 60);
        assert_eq!(rl.limit_for(&user, EndpointClass::Standard), 120);
        assert_eq!(rl.limit_for(&user, EndpointClass::Public), 30);
        assert_eq!(rl.limit_for(&user, EndpointClass::Sensitive), 10);
    }

    #[test]
    fn classes_and_identities_are_independent() {
        let rl = limiter(1);
        let a = ip(1);
        assert!(rl.check_at(a, EndpointClass::Standard, 0).is_allowed());
        assert!(!rl.check_at(a, EndpointClass::Standard, 1).is_allowed());
        assert!(rl.check_at(a, EndpointClass::Sensitive, 1).is_allowed());
        assert!(rl.check_at(ip(2), EndpointClass::Standard, 1).is_allowed());
    }

    #[test]
    fn reset_and_eviction() {
        let rl = limiter(1);
        let a = ip(1);
        let b = ip(2);
        rl.check_at(a, EndpointClass::Standard, 0);
        rl.check_at(a, EndpointClass::Sensitive, 0);
        rl.check_at(b, EndpointClass::Standard, 50_000);
        assert_eq!(rl.tracked_keys(), 3);

        rl.reset(&a);
        assert_eq!(rl.tracked_keys(), 1);
        assert!(rl.check_at(a, EndpointClass::Standard, 1).is_allowed());

        assert_eq!(rl.evict_idle(100_000), 1);
        assert_eq!(rl.tracked_keys(), 1);
    }

    #[test]
    fn disabled_limiter_allows_everything() {
        let rl = RateLimiter::new(RateLimitConfig {
            enabled: false,
            anonymous: 0,
            ..RateLimitConfig::default()
        });
        assert!(rl.check_at(ip(9), EndpointClass::Standard, 0).is_allowed());
        assert_eq!(rl.tracked_keys(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_checks_never_overadmit() {
        let rl = Arc::new(limiter(50));
        let id = ip(7);
        let now = 1_000_000;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let rl = rl.clone();
            handles.push(tokio::spawn(async move {
                (0..25)
                    .filter(|_| rl.check_at(id, EndpointClass::Standard, now).is_allowed())
                    .count()
            }));
        }
        let mut admitted = 0;
        for h in handles {
            admitted += h.await.unwrap();
        }
        assert_eq!(admitted, 50);
        assert_eq!(rl.current_count_at(&id, EndpointClass::Standard, now), 50);
    }
}
