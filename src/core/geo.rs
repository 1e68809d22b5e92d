//! Geo/IP reputation analysis for the abuse protection service.
//!
//! This module resolves location/reputation records for IPs through an
//! opaque provider, caches them in the shared store, and evaluates a
//! priority-ordered rule set to decide hard geographic blocks.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::core::store::{CounterStore, StoreError};
use crate::models::GeoConfig;
use crate::utils::format_key;

const CACHE_PREFIX: &str = "geo";
const RULES_KEY: &str = "geo:rules";
/// Rules are config-like data; the store entry is refreshed on every save.
const RULES_TTL: Duration = Duration::from_secs(30 * 24 * 3600);

/// Errors that can occur during geo analysis
#[derive(Error, Debug)]
pub enum GeoError {
    #[error("Provider request failed: {0}")]
    ProviderError(#[from] reqwest::Error),
    #[error("Store error: {0}")]
    StoreError(#[from] StoreError),
    #[error("Invalid rule set: {0}")]
    InvalidRules(String),
}

/// Threat level of a resolved location. The ordering is total, so rule
/// conditions compare levels directly instead of coercing strings to
/// numbers at call sites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreatLevel {
    Low,
    Medium,
    High,
    Critical,
}

/// Location/reputation record for an IP
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeoLocation {
    pub ip_address: String,
    pub country: String,
    pub country_code: String,
    pub city: String,
    pub threat_level: ThreatLevel,
    /// 100 = clean, 0 = known hostile
    pub reputation: u8,
    pub is_tor: bool,
    pub is_vpn: bool,
    pub is_proxy: bool,
}

impl GeoLocation {
    /// Sentinel for private/loopback addresses; never hits the provider.
    pub fn local(ip: &str) -> Self {
        Self {
            ip_address: ip.to_string(),
            country: "Local".to_string(),
            country_code: "LOCAL".to_string(),
            city: "Local".to_string(),
            threat_level: ThreatLevel::Low,
            reputation: 100,
            is_tor: false,
            is_vpn: false,
            is_proxy: false,
        }
    }

    /// Fail-open record used when the provider is unreachable.
    pub fn unknown(ip: &str) -> Self {
        Self {
            ip_address: ip.to_string(),
            country: "Unknown".to_string(),
            country_code: "XX".to_string(),
            city: "Unknown".to_string(),
            threat_level: ThreatLevel::Low,
            reputation: 50,
            is_tor: false,
            is_vpn: false,
            is_proxy: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GeoRuleAction {
    Block,
    Allow,
}

/// Geographic blocking rule, evaluated in descending priority order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeoBlockRule {
    pub id: String,
    pub action: GeoRuleAction,
    pub countries: HashSet<String>,
    /// Rule matches locations at or above this threat level
    pub max_threat_level: ThreatLevel,
    pub priority: i32,
    pub enabled: bool,
}

/// Outcome of a geographic block check
#[derive(Debug, Clone, Serialize)]
pub struct GeoBlockDecision {
    pub blocked: bool,
    pub reason: Option<String>,
    pub rule_id: Option<String>,
}

impl GeoBlockDecision {
    fn allow() -> Self {
        Self {
            blocked: false,
            reason: None,
            rule_id: None,
        }
    }
}

/// Opaque location/reputation lookup.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GeoProvider: Send + Sync {
    async fn lookup(&self, ip: &str) -> Result<GeoLocation, GeoError>;
}

/// HTTP geo/reputation provider client
pub struct HttpGeoProvider {
    client: reqwest::Client,
    url: String,
}

impl HttpGeoProvider {
    pub fn new(url: String, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self { client, url }
    }
}

#[async_trait]
impl GeoProvider for HttpGeoProvider {
    async fn lookup(&self, ip: &str) -> Result<GeoLocation, GeoError> {
        let location = self
            .client
            .get(&self.url)
            .query(&[("ip", ip)])
            .send()
            .await?
            .error_for_status()?
            .json::<GeoLocation>()
            .await?;
        Ok(location)
    }
}

/// True for addresses that must never reach the external provider.
pub fn is_private_ip(ip: &str) -> bool {
    match ip.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => {
            v4.is_loopback() || v4.is_private() || v4.is_link_local() || v4.is_unspecified()
        }
        Ok(IpAddr::V6(v6)) => {
            v6.is_loopback()
                || v6.is_unspecified()
                // fc00::/7 unique local
                || (v6.segments()[0] & 0xfe00) == 0xfc00
                // fe80::/10 link local
                || (v6.segments()[0] & 0xffc0) == 0xfe80
        }
        Err(_) => false,
    }
}

/// Evaluate rules against a resolved location.
///
/// Side-effect-free and deterministic: rules sorted by descending priority,
/// a rule matches when the location's country is listed and its threat
/// level is at or above the rule's threshold. The first matching Block rule
/// blocks; a matching Allow rule stops evaluation; no match allows.
pub fn evaluate_rules(rules: &[GeoBlockRule], location: &GeoLocation) -> GeoBlockDecision {
    let mut ordered: Vec<&GeoBlockRule> = rules.iter().filter(|r| r.enabled).collect();
    ordered.sort_by(|a, b| b.priority.cmp(&a.priority));

    for rule in ordered {
        let matches = rule.countries.contains(&location.country_code)
            && location.threat_level >= rule.max_threat_level;
        if !matches {
            continue;
        }
        match rule.action {
            GeoRuleAction::Block => {
                return GeoBlockDecision {
                    blocked: true,
                    reason: Some(format!(
                        "Traffic from {} at threat level {:?} is blocked",
                        location.country_code, location.threat_level
                    )),
                    rule_id: Some(rule.id.clone()),
                };
            }
            GeoRuleAction::Allow => return GeoBlockDecision::allow(),
        }
    }
    GeoBlockDecision::allow()
}

/// Geo/IP analyzer with a store-backed location cache and an in-process
/// rule cache persisted through the shared store.
pub struct GeoAnalyzer {
    provider: Arc<dyn GeoProvider>,
    store: Arc<dyn CounterStore>,
    rules: RwLock<Vec<GeoBlockRule>>,
    config: GeoConfig,
}

impl GeoAnalyzer {
    pub fn new(
        provider: Arc<dyn GeoProvider>,
        store: Arc<dyn CounterStore>,
        config: GeoConfig,
    ) -> Self {
        Self {
            provider,
            store,
            rules: RwLock::new(Vec::new()),
            config,
        }
    }

    /// Resolve the location/reputation record for an IP.
    ///
    /// Cache-first; private/loopback addresses resolve to the Local
    /// sentinel instantly. Provider outages degrade to a low-threat record
    /// so geo analysis never takes down request handling.
    pub async fn analyze_ip(&self, ip: &str) -> GeoLocation {
        if is_private_ip(ip) {
            return GeoLocation::local(ip);
        }

        let cache_key = format_key(CACHE_PREFIX, ip);
        match self.store.get(&cache_key).await {
            Ok(Some(raw)) => match serde_json::from_str::<GeoLocation>(&raw) {
                Ok(location) => return location,
                Err(e) => debug!("dropping unreadable cached location for {}: {}", ip, e),
            },
            Ok(None) => {}
            Err(e) => debug!("geo cache read failed for {}: {}", ip, e),
        }

        let location = match self.provider.lookup(ip).await {
            Ok(location) => location,
            Err(e) => {
                warn!("geo provider lookup failed for {}: {}", ip, e);
                metrics::increment_counter!("geo_provider_failures_total");
                return GeoLocation::unknown(ip);
            }
        };

        // High-threat records get a shorter TTL so they are re-evaluated
        // sooner.
        let ttl = if location.threat_level >= ThreatLevel::High {
            Duration::from_secs(self.config.high_threat_cache_ttl_seconds)
        } else {
            Duration::from_secs(self.config.cache_ttl_seconds)
        };
        if let Ok(raw) = serde_json::to_string(&location) {
            if let Err(e) = self.store.put(&cache_key, &raw, ttl).await {
                debug!("geo cache write failed for {}: {}", ip, e);
            }
        }
        location
    }

    /// Check an IP against the active rule set.
    pub async fn should_block(&self, ip: &str) -> GeoBlockDecision {
        let location = self.analyze_ip(ip).await;
        let rules = self.rules.read().await;
        let decision = evaluate_rules(&rules, &location);
        if decision.blocked {
            warn!(
                "geo block for {} ({}): rule {}",
                ip,
                location.country_code,
                decision.rule_id.as_deref().unwrap_or("-")
            );
            metrics::increment_counter!("geo_blocked_total");
        }
        decision
    }

    /// Load the persisted rule set from the store.
    pub async fn load_rules(&self) -> Result<(), GeoError> {
        let raw = self.store.get(RULES_KEY).await?;
        if let Some(json) = raw {
            let rules: Vec<GeoBlockRule> = serde_json::from_str(&json)
                .map_err(|e| GeoError::InvalidRules(e.to_string()))?;
            let mut lock = self.rules.write().await;
            *lock = rules;
        }
        Ok(())
    }

    /// Replace the active rule set and persist it.
    pub async fn set_rules(&self, rules: Vec<GeoBlockRule>) -> Result<(), GeoError> {
        let json = serde_json::to_string(&rules)
            .map_err(|e| GeoError::InvalidRules(e.to_string()))?;
        if let Err(e) = self.store.put(RULES_KEY, &json, RULES_TTL).await {
            error!("failed to persist geo rules: {}", e);
            return Err(GeoError::StoreError(e));
        }
        let mut lock = self.rules.write().await;
        *lock = rules;
        Ok(())
    }

    pub async fn rules(&self) -> Vec<GeoBlockRule> {
        self.rules.read().await.clone()
    }
}
