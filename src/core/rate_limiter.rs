//! Rate limiting implementation for the abuse protection service.
//!
//! This module provides sliding-window rate limiting over the shared
//! counter store, tier resolution by role and endpoint, and the shared
//! suspicious-IP registry consulted by the CAPTCHA manager.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, warn};
use serde::Serialize;
use uuid::Uuid;

use crate::core::store::CounterStore;
use crate::models::{RateLimitConfig, RateLimitTiers, UserContext};
use crate::utils::{format_key, now_millis, seconds_until};

const WINDOW_PREFIX: &str = "rate_limit";
const SUSPICIOUS_PREFIX: &str = "suspicious_ips";

/// Outcome of a sliding-window admission check. Computed fresh per call and
/// never cached across calls.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitResult {
    pub allowed: bool,
    pub remaining: u32,
    /// Epoch milliseconds at which a full window will have elapsed
    pub reset_time: u64,
    /// Seconds to wait before retrying; set only when denied
    pub retry_after: Option<u64>,
    /// Requests observed in the current window, including this one
    pub total_requests: u64,
}

/// Identifier resolution is a policy decision owned by the caller;
/// authenticated requests key on the user, anonymous ones on the IP.
pub fn default_identifier(context: &UserContext) -> String {
    match &context.user_id {
        Some(id) if context.is_authenticated => format_key("user", id),
        _ => format_key("ip", &context.ip_address),
    }
}

/// Shrink the effective limit by a bypass penalty multiplier. A multiplier
/// of 1.0 leaves the config untouched; the floor of one request keeps even
/// heavily penalized identifiers measurable.
pub fn apply_penalty(config: &RateLimitConfig, multiplier: f64) -> RateLimitConfig {
    if multiplier <= 1.0 {
        return config.clone();
    }
    let shrunk = (config.max_requests as f64 / multiplier).floor() as u32;
    RateLimitConfig {
        window_ms: config.window_ms,
        max_requests: shrunk.max(1),
    }
}

/// Sliding-window rate limiter backed by the shared counter store
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    tiers: RateLimitTiers,
    resolver: Box<dyn Fn(&UserContext) -> String + Send + Sync>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CounterStore>, tiers: RateLimitTiers) -> Self {
        Self {
            store,
            tiers,
            resolver: Box::new(default_identifier),
        }
    }

    /// Substitute the identifier policy, e.g. for composite keys.
    pub fn with_identifier_resolver(
        mut self,
        resolver: impl Fn(&UserContext) -> String + Send + Sync + 'static,
    ) -> Self {
        self.resolver = Box::new(resolver);
        self
    }

    pub fn identifier(&self, context: &UserContext) -> String {
        (self.resolver)(context)
    }

    /// Resolve the applicable tier for a request.
    ///
    /// Precedence: endpoint override (longest matching prefix) >
    /// sensitive-endpoint tier > role default. Sensitive endpoints keep
    /// their tight tier regardless of role since credential-stuffing risk
    /// dominates trust level there.
    pub fn resolve_limit(&self, context: &UserContext, endpoint: Option<&str>) -> RateLimitConfig {
        if let Some(path) = endpoint {
            if let Some(config) = self
                .tiers
                .endpoint_overrides
                .iter()
                .filter(|(prefix, _)| path.starts_with(prefix.as_str()))
                .max_by_key(|(prefix, _)| prefix.len())
                .map(|(_, config)| config)
            {
                return config.clone();
            }
            if self
                .tiers
                .sensitive_endpoints
                .iter()
                .any(|prefix| path.starts_with(prefix.as_str()))
            {
                return self.tiers.sensitive.clone();
            }
        }
        self.tiers.role_default(context.user_role).clone()
    }

    /// Sliding-window admission check.
    ///
    /// Purge, insert, count and expire run as one atomic batch against the
    /// store, so concurrent requests for the same identifier serialize
    /// there. Denied requests give their slot back. On store failure the
    /// limiter fails open: availability is prioritized over strict
    /// enforcement for a public surface.
    pub async fn check_limit(&self, identifier: &str, config: &RateLimitConfig) -> RateLimitResult {
        self.check_limit_at(identifier, config, now_millis()).await
    }

    async fn check_limit_at(
        &self,
        identifier: &str,
        config: &RateLimitConfig,
        now_ms: u64,
    ) -> RateLimitResult {
        let key = format_key(WINDOW_PREFIX, identifier);
        let member = format!("{}-{}", now_ms, Uuid::new_v4().simple());
        let reset_time = now_ms + config.window_ms;

        let count = match self
            .store
            .record_in_window(&key, now_ms, config.window_ms, &member)
            .await
        {
            Ok(count) => count,
            Err(e) => {
                error!("Counter store unavailable, failing open for {}: {}", identifier, e);
                metrics::increment_counter!("rate_limiter_fail_open_total");
                return RateLimitResult {
                    allowed: true,
                    remaining: (config.max_requests / 2).max(1),
                    reset_time,
                    retry_after: None,
                    total_requests: 0,
                };
            }
        };

        if count <= config.max_requests as u64 {
            metrics::increment_counter!("rate_limiter_allowed_total");
            RateLimitResult {
                allowed: true,
                remaining: config.max_requests.saturating_sub(count as u32),
                reset_time,
                retry_after: None,
                total_requests: count,
            }
        } else {
            if let Err(e) = self.store.discard_member(&key, &member).await {
                debug!("failed to release denied slot for {}: {}", identifier, e);
            }
            warn!(
                "Rate limit exceeded for {}: {} requests in {}ms window (limit {})",
                identifier, count, config.window_ms, config.max_requests
            );
            metrics::increment_counter!("rate_limiter_denied_total");
            RateLimitResult {
                allowed: false,
                remaining: 0,
                reset_time,
                retry_after: Some(seconds_until(reset_time, now_ms)),
                total_requests: count,
            }
        }
    }

    /// Requests observed for the identifier within the global window,
    /// without consuming a slot. Used for CAPTCHA velocity decisions.
    pub async fn current_rate(&self, identifier: &str) -> u32 {
        let key = format_key(WINDOW_PREFIX, identifier);
        match self
            .store
            .count_in_window(&key, now_millis(), self.tiers.global.window_ms)
            .await
        {
            Ok(count) => count as u32,
            Err(e) => {
                debug!("rate lookup failed for {}: {}", identifier, e);
                0
            }
        }
    }
}

/// Shared membership set of suspicious IPs, global and per-country.
/// Entries expire via TTL only; there is no manual removal path.
#[derive(Clone)]
pub struct SuspiciousIpRegistry {
    store: Arc<dyn CounterStore>,
}

impl SuspiciousIpRegistry {
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self { store }
    }

    pub async fn add(&self, ip: &str, country: Option<&str>, ttl: Duration) {
        let global_key = format_key(SUSPICIOUS_PREFIX, "global");
        if let Err(e) = self.store.set_add(&global_key, ip, ttl).await {
            error!("failed to register suspicious IP {}: {}", ip, e);
            return;
        }
        if let Some(cc) = country {
            let country_key = format_key(SUSPICIOUS_PREFIX, cc);
            if let Err(e) = self.store.set_add(&country_key, ip, ttl).await {
                error!("failed to register suspicious IP {} for {}: {}", ip, cc, e);
            }
        }
    }

    /// Membership check; store failures degrade to "not suspicious".
    pub async fn is_suspicious(&self, ip: &str, country: Option<&str>) -> bool {
        let global_key = format_key(SUSPICIOUS_PREFIX, "global");
        match self.store.set_contains(&global_key, ip).await {
            Ok(true) => return true,
            Ok(false) => {}
            Err(e) => {
                debug!("suspicious IP lookup failed for {}: {}", ip, e);
                return false;
            }
        }
        if let Some(cc) = country {
            let country_key = format_key(SUSPICIOUS_PREFIX, cc);
            match self.store.set_contains(&country_key, ip).await {
                Ok(found) => return found,
                Err(e) => debug!("suspicious IP lookup failed for {}: {}", ip, e),
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::memory::MemoryCounterStore;
    use crate::core::store::{MockCounterStore, StoreError};
    use crate::models::UserRole;

    fn limiter(store: Arc<dyn CounterStore>) -> RateLimiter {
        RateLimiter::new(store, RateLimitTiers::default())
    }

    fn context(role: UserRole) -> UserContext {
        UserContext {
            is_authenticated: role != UserRole::Anonymous,
            user_id: (role != UserRole::Anonymous).then(|| "u1".to_string()),
            user_role: role,
            ip_address: "198.51.100.4".to_string(),
            user_agent: None,
            country: None,
            city: None,
        }
    }

    #[tokio::test]
    async fn test_exactly_max_requests_admitted_per_window() {
        let limiter = limiter(Arc::new(MemoryCounterStore::new()));
        let config = RateLimitConfig::new(60_000, 5);
        let start = 1_000_000;

        for i in 0..5 {
            let result = limiter
                .check_limit_at("ip:1.2.3.4", &config, start + i)
                .await;
            assert!(result.allowed, "request {} should pass", i + 1);
        }
        let denied = limiter.check_limit_at("ip:1.2.3.4", &config, start + 5).await;
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        assert!(denied.retry_after.unwrap() > 0);
    }

    #[tokio::test]
    async fn test_window_elapse_resets_allowance() {
        let limiter = limiter(Arc::new(MemoryCounterStore::new()));
        let config = RateLimitConfig::new(1_000, 3);
        let start = 1_000_000;

        for i in 0..3 {
            assert!(limiter.check_limit_at("ip:9.9.9.9", &config, start + i).await.allowed);
        }
        assert!(!limiter.check_limit_at("ip:9.9.9.9", &config, start + 10).await.allowed);

        let fresh = limiter
            .check_limit_at("ip:9.9.9.9", &config, start + 2_000)
            .await;
        assert!(fresh.allowed);
        assert_eq!(fresh.remaining, config.max_requests - 1);
        assert_eq!(fresh.total_requests, 1);
    }

    #[tokio::test]
    async fn test_denied_requests_do_not_consume_slots() {
        let limiter = limiter(Arc::new(MemoryCounterStore::new()));
        let config = RateLimitConfig::new(60_000, 2);
        let start = 1_000_000;

        assert!(limiter.check_limit_at("k", &config, start).await.allowed);
        assert!(limiter.check_limit_at("k", &config, start + 1).await.allowed);
        for i in 0..5 {
            assert!(!limiter.check_limit_at("k", &config, start + 2 + i).await.allowed);
        }
        // Still exactly two stored entries: once they age out, two fresh
        // requests are admitted again.
        let later = start + 60_005;
        assert!(limiter.check_limit_at("k", &config, later).await.allowed);
        assert!(limiter.check_limit_at("k", &config, later + 1).await.allowed);
    }

    #[tokio::test]
    async fn test_fails_open_when_store_is_down() {
        let mut mock = MockCounterStore::new();
        mock.expect_record_in_window()
            .returning(|_, _, _, _| Err(StoreError::Unavailable("down".to_string())));
        let limiter = limiter(Arc::new(mock));

        let result = limiter
            .check_limit("ip:1.2.3.4", &RateLimitConfig::new(60_000, 10))
            .await;
        assert!(result.allowed);
        assert!(result.remaining >= 1);
        assert!(result.retry_after.is_none());
    }

    #[tokio::test]
    async fn test_role_defaults_are_monotonic() {
        let limiter = limiter(Arc::new(MemoryCounterStore::new()));
        let anon = limiter.resolve_limit(&context(UserRole::Anonymous), Some("/api/campaigns"));
        let buyer = limiter.resolve_limit(&context(UserRole::Buyer), Some("/api/campaigns"));
        let supplier = limiter.resolve_limit(&context(UserRole::Supplier), Some("/api/campaigns"));
        let admin = limiter.resolve_limit(&context(UserRole::Admin), Some("/api/campaigns"));
        assert!(anon.max_requests <= buyer.max_requests);
        assert!(buyer.max_requests <= supplier.max_requests);
        assert!(supplier.max_requests <= admin.max_requests);
    }

    #[tokio::test]
    async fn test_sensitive_endpoints_use_tight_tier_for_all_roles() {
        let limiter = limiter(Arc::new(MemoryCounterStore::new()));
        let admin = limiter.resolve_limit(&context(UserRole::Admin), Some("/api/auth/login"));
        let tiers = RateLimitTiers::default();
        assert_eq!(admin.max_requests, tiers.sensitive.max_requests);
        assert_eq!(admin.window_ms, tiers.sensitive.window_ms);
    }

    #[tokio::test]
    async fn test_endpoint_override_beats_role_default() {
        let mut tiers = RateLimitTiers::default();
        tiers
            .endpoint_overrides
            .insert("/api/export".to_string(), RateLimitConfig::new(60_000, 2));
        let limiter = RateLimiter::new(Arc::new(MemoryCounterStore::new()), tiers);

        let resolved = limiter.resolve_limit(&context(UserRole::Admin), Some("/api/export/csv"));
        assert_eq!(resolved.max_requests, 2);
    }

    #[test]
    fn test_apply_penalty_shrinks_limit() {
        let config = RateLimitConfig::new(60_000, 30);
        assert_eq!(apply_penalty(&config, 3.0).max_requests, 10);
        assert_eq!(apply_penalty(&config, 1.0).max_requests, 30);
        // Floor of one request even under extreme penalties
        assert_eq!(apply_penalty(&config, 1_000.0).max_requests, 1);
    }

    #[test]
    fn test_default_identifier_prefers_user_key() {
        let authenticated = context(UserRole::Buyer);
        assert_eq!(default_identifier(&authenticated), "user:u1");
        let anonymous = context(UserRole::Anonymous);
        assert_eq!(default_identifier(&anonymous), "ip:198.51.100.4");
    }

    #[tokio::test]
    async fn test_suspicious_registry_membership() {
        let store = Arc::new(MemoryCounterStore::new());
        let registry = SuspiciousIpRegistry::new(store);

        assert!(!registry.is_suspicious("203.0.113.9", Some("US")).await);
        registry
            .add("203.0.113.9", Some("US"), Duration::from_secs(600))
            .await;
        assert!(registry.is_suspicious("203.0.113.9", Some("US")).await);
        assert!(registry.is_suspicious("203.0.113.9", None).await);
    }

    #[tokio::test]
    async fn test_suspicious_registry_fails_closed_to_not_suspicious() {
        let store = Arc::new(MemoryCounterStore::new());
        store.set_unavailable(true);
        let registry = SuspiciousIpRegistry::new(store);
        assert!(!registry.is_suspicious("203.0.113.9", None).await);
    }
}
