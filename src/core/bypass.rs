//! Bypass attempt detection for the abuse protection service.
//!
//! Inspects header sets and identifier cardinality over time to flag
//! active evasion: header spoofing, IP rotation and user-agent rotation.
//! The detector never gates requests itself; it returns a penalty
//! multiplier the caller folds into the effective rate limit, and keeps an
//! append-only audit trail for reporting.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::headers::RequestHeaders;
use crate::core::store::CounterStore;
use crate::core::Severity;
use crate::models::{BypassConfig, UserContext};
use crate::utils::{format_key, now_millis};

const AUDIT_KEY: &str = "bypass:attempts";
const IP_TRACK_PREFIX: &str = "bypass:ips";
const UA_TRACK_PREFIX: &str = "bypass:uas";

/// Decoy headers no legitimate client ever sends; their presence means the
/// sender is probing for a way around enforcement.
const HONEYPOT_HEADERS: &[&str] = &["x-ratelimit-bypass", "x-internal-request", "x-admin-override"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BypassType {
    HeaderManipulation,
    IpRotation,
    UserAgentRotation,
}

impl BypassType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BypassType::HeaderManipulation => "header_manipulation",
            BypassType::IpRotation => "ip_rotation",
            BypassType::UserAgentRotation => "user_agent_rotation",
        }
    }
}

/// Append-only audit record of a detected attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BypassAttempt {
    pub id: String,
    pub attempt_type: BypassType,
    pub severity: Severity,
    pub confidence: u8,
    pub evidence: HashMap<String, String>,
    pub blocked: bool,
    /// Epoch milliseconds
    pub last_detected: u64,
}

/// Outcome of per-request bypass analysis
#[derive(Debug, Clone, Serialize)]
pub struct BypassAnalysis {
    pub bypass_attempted: bool,
    pub bypass_type: Option<BypassType>,
    pub penalty_multiplier: f64,
    pub severity: Severity,
    pub confidence: u8,
    pub evidence: HashMap<String, String>,
}

impl BypassAnalysis {
    fn clean() -> Self {
        Self {
            bypass_attempted: false,
            bypass_type: None,
            penalty_multiplier: 1.0,
            severity: Severity::Low,
            confidence: 0,
            evidence: HashMap::new(),
        }
    }
}

/// Aggregated reporting view over the audit trail
#[derive(Debug, Clone, Serialize)]
pub struct BypassStats {
    pub total_attempts: u64,
    pub attempts_by_type: HashMap<String, u64>,
    /// Fraction of recorded attempts where the penalized check denied
    pub mitigation_effectiveness: f64,
}

/// Header manipulation check. Pure over the typed header map: a honeypot
/// header, or client-IP headers that disagree with each other.
fn check_headers(headers: &RequestHeaders) -> Option<HashMap<String, String>> {
    for name in HONEYPOT_HEADERS {
        if headers.contains(name) {
            let mut evidence = HashMap::new();
            evidence.insert("honeypot_header".to_string(), name.to_string());
            return Some(evidence);
        }
    }

    let mut claims: Vec<(&str, &str)> = Vec::new();
    if let Some(ip) = headers.forwarded_for() {
        claims.push(("x-forwarded-for", ip));
    }
    if let Some(ip) = headers.real_ip() {
        claims.push(("x-real-ip", ip));
    }
    if let Some(ip) = headers.client_ip() {
        claims.push(("x-client-ip", ip));
    }
    if claims.len() >= 2 && claims.iter().any(|(_, ip)| *ip != claims[0].1) {
        let mut evidence = HashMap::new();
        for (name, ip) in claims {
            evidence.insert(name.to_string(), ip.to_string());
        }
        return Some(evidence);
    }
    None
}

/// Bypass attempt detector backed by the shared counter store
pub struct BypassDetector {
    store: Arc<dyn CounterStore>,
    config: BypassConfig,
}

impl BypassDetector {
    pub fn new(store: Arc<dyn CounterStore>, config: BypassConfig) -> Self {
        Self { store, config }
    }

    fn tracking_ttl(&self) -> Duration {
        Duration::from_secs(self.config.tracking_window_seconds)
    }

    /// Run the ordered evasion checks; the first positive match wins. The
    /// order reflects escalating confidence of deliberate evasion. Store
    /// failures skip the affected check rather than flagging anyone.
    pub async fn analyze_request(
        &self,
        context: &UserContext,
        headers: &RequestHeaders,
    ) -> BypassAnalysis {
        if let Some(evidence) = check_headers(headers) {
            metrics::increment_counter!("bypass_detected_total");
            return BypassAnalysis {
                bypass_attempted: true,
                bypass_type: Some(BypassType::HeaderManipulation),
                penalty_multiplier: self.config.header_penalty,
                severity: Severity::High,
                confidence: 90,
                evidence,
            };
        }

        // Rotation checks only make sense for identifiers that persist
        // across addresses, i.e. authenticated users.
        if let Some(user_id) = context.user_id.as_deref() {
            let key = format_key(IP_TRACK_PREFIX, user_id);
            match self.track_cardinality(&key, &context.ip_address).await {
                Some(distinct) if distinct > self.config.max_distinct_ips => {
                    metrics::increment_counter!("bypass_detected_total");
                    let mut evidence = HashMap::new();
                    evidence.insert("distinct_ips".to_string(), distinct.to_string());
                    evidence.insert("window_seconds".to_string(),
                        self.config.tracking_window_seconds.to_string());
                    return BypassAnalysis {
                        bypass_attempted: true,
                        bypass_type: Some(BypassType::IpRotation),
                        penalty_multiplier: self.config.rotation_penalty,
                        severity: Severity::Medium,
                        confidence: 75,
                        evidence,
                    };
                }
                _ => {}
            }
        }

        if let Some(user_agent) = context.user_agent.as_deref() {
            let identifier = context
                .user_id
                .as_deref()
                .map(|id| format_key("user", id))
                .unwrap_or_else(|| format_key("ip", &context.ip_address));
            let key = format_key(UA_TRACK_PREFIX, &identifier);
            match self.track_cardinality(&key, user_agent).await {
                Some(distinct) if distinct > self.config.max_distinct_user_agents => {
                    metrics::increment_counter!("bypass_detected_total");
                    let mut evidence = HashMap::new();
                    evidence.insert("distinct_user_agents".to_string(), distinct.to_string());
                    evidence.insert("window_seconds".to_string(),
                        self.config.tracking_window_seconds.to_string());
                    return BypassAnalysis {
                        bypass_attempted: true,
                        bypass_type: Some(BypassType::UserAgentRotation),
                        penalty_multiplier: self.config.rotation_penalty,
                        severity: Severity::Medium,
                        confidence: 70,
                        evidence,
                    };
                }
                _ => {}
            }
        }

        BypassAnalysis::clean()
    }

    async fn track_cardinality(&self, key: &str, member: &str) -> Option<u64> {
        if let Err(e) = self.store.set_add(key, member, self.tracking_ttl()).await {
            debug!("cardinality tracking failed for {}: {}", key, e);
            return None;
        }
        match self.store.set_len(key).await {
            Ok(len) => Some(len),
            Err(e) => {
                debug!("cardinality lookup failed for {}: {}", key, e);
                None
            }
        }
    }

    /// Append the audit record for a detected attempt. Called by the
    /// orchestrator after the rate-limit decision, so `blocked` reflects
    /// whether the penalized check actually denied the request.
    pub async fn record_attempt(
        &self,
        analysis: &BypassAnalysis,
        context: &UserContext,
        blocked: bool,
    ) {
        let attempt_type = match analysis.bypass_type {
            Some(attempt_type) => attempt_type,
            None => return,
        };
        let now = now_millis();
        let mut evidence = analysis.evidence.clone();
        evidence.insert("ip_address".to_string(), context.ip_address.clone());
        let attempt = BypassAttempt {
            id: Uuid::new_v4().to_string(),
            attempt_type,
            severity: analysis.severity,
            confidence: analysis.confidence,
            evidence,
            blocked,
            last_detected: now,
        };
        warn!(
            "bypass attempt from {}: {} (confidence {}, blocked {})",
            context.ip_address,
            attempt_type.as_str(),
            attempt.confidence,
            blocked
        );
        let payload = match serde_json::to_string(&attempt) {
            Ok(payload) => payload,
            Err(e) => {
                debug!("failed to encode bypass attempt: {}", e);
                return;
            }
        };
        let retention = Duration::from_secs(self.config.audit_retention_hours * 3600);
        if let Err(e) = self.store.append_event(AUDIT_KEY, now, &payload, retention).await {
            debug!("failed to record bypass attempt: {}", e);
        }
    }

    /// Audit trail view, optionally filtered by attempt type.
    pub async fn attempts(&self, filter: Option<BypassType>) -> Vec<BypassAttempt> {
        let window_ms = self.config.audit_retention_hours * 3600 * 1_000;
        let raw = match self
            .store
            .window_events(AUDIT_KEY, now_millis(), window_ms, 1_000)
            .await
        {
            Ok(raw) => raw,
            Err(e) => {
                debug!("bypass audit load failed: {}", e);
                return Vec::new();
            }
        };
        raw.iter()
            .filter_map(|payload| serde_json::from_str::<BypassAttempt>(payload).ok())
            .filter(|attempt| filter.map_or(true, |t| attempt.attempt_type == t))
            .collect()
    }

    /// Aggregate statistics over the given reporting period.
    pub async fn stats(&self, period: Duration) -> BypassStats {
        let raw = match self
            .store
            .window_events(AUDIT_KEY, now_millis(), period.as_millis() as u64, 1_000)
            .await
        {
            Ok(raw) => raw,
            Err(e) => {
                debug!("bypass audit load failed: {}", e);
                Vec::new()
            }
        };
        let attempts: Vec<BypassAttempt> = raw
            .iter()
            .filter_map(|payload| serde_json::from_str(payload).ok())
            .collect();

        let total = attempts.len() as u64;
        let mut by_type: HashMap<String, u64> = HashMap::new();
        for attempt in &attempts {
            *by_type.entry(attempt.attempt_type.as_str().to_string()).or_insert(0) += 1;
        }
        let blocked = attempts.iter().filter(|a| a.blocked).count() as u64;
        BypassStats {
            total_attempts: total,
            attempts_by_type: by_type,
            mitigation_effectiveness: if total == 0 {
                0.0
            } else {
                blocked as f64 / total as f64
            },
        }
    }
}
