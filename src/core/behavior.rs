//! Behavioral pattern analysis for the abuse protection service.
//!
//! Each request leaves a timing/outcome event in the shared store, keyed by
//! identifier. Independent detectors over the recent event window surface
//! scripted traffic, probing and credential stuffing, and feed a composite
//! behavior score consumed by the CAPTCHA manager.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error};
use serde::{Deserialize, Serialize};

use crate::core::store::CounterStore;
use crate::core::Severity;
use crate::models::BehaviorConfig;
use crate::utils::{format_key, now_millis};

const EVENTS_PREFIX: &str = "behavior";
const SCORE_PREFIX: &str = "behavior_score";

/// Path fragments that mark authentication endpoints for the credential
/// stuffing detector.
const AUTH_MARKERS: &[&str] = &["/login", "/auth", "password"];

/// One recorded request event. Append-only; entries older than the
/// retention window are pruned lazily on read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BehaviorPattern {
    pub ip_address: String,
    /// Epoch milliseconds
    pub timestamp: u64,
    pub endpoint: String,
    pub method: String,
    pub response_status: u16,
    pub response_time_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    BurstRequests,
    RegularIntervals,
    ErrorFarming,
    EndpointScanning,
    CredentialStuffing,
}

/// A single detector finding. Findings are independent and non-exclusive.
#[derive(Debug, Clone, Serialize)]
pub struct SuspiciousActivity {
    pub kind: ActivityKind,
    pub severity: Severity,
    pub description: String,
}

/// Independent [0,100] risk sub-scores.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RiskFactors {
    pub burst_activity: u8,
    pub regular_intervals: u8,
    pub error_rate: u8,
    pub endpoint_scanning: u8,
    pub credential_stuffing: u8,
    pub session_anomalies: u8,
}

/// Composite trust estimate derived from the current event window.
/// 100 = clean; never stored as a source of truth.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BehaviorScore {
    pub overall_score: u8,
    pub risk_factors: RiskFactors,
    pub recommendations: Vec<String>,
}

impl BehaviorScore {
    /// A new identifier is innocent until its pattern accumulates.
    pub fn clean() -> Self {
        Self {
            overall_score: 100,
            risk_factors: RiskFactors::default(),
            recommendations: Vec::new(),
        }
    }
}

fn severity_weight(severity: Severity) -> u8 {
    match severity {
        Severity::Low => 30,
        Severity::Medium => 60,
        Severity::High => 85,
    }
}

/// Burst detection: a dense cluster of requests inside a short sub-window.
fn detect_burst(events: &[BehaviorPattern], config: &BehaviorConfig) -> Option<SuspiciousActivity> {
    let window_ms = config.burst_window_seconds * 1_000;
    let mut start = 0;
    let mut densest = 0;
    for end in 0..events.len() {
        while events[end].timestamp.saturating_sub(events[start].timestamp) > window_ms {
            start += 1;
        }
        densest = densest.max(end - start + 1);
    }
    if densest >= config.burst_threshold {
        Some(SuspiciousActivity {
            kind: ActivityKind::BurstRequests,
            severity: Severity::Medium,
            description: format!(
                "{} requests within {}s",
                densest, config.burst_window_seconds
            ),
        })
    } else {
        None
    }
}

/// Regular-interval detection: human traffic is irregular, scripted
/// traffic is not. Flags windows whose inter-arrival deviation is a small
/// fraction of the mean interval.
fn detect_regular_intervals(
    events: &[BehaviorPattern],
    config: &BehaviorConfig,
) -> Option<SuspiciousActivity> {
    if events.len() < config.min_interval_samples {
        return None;
    }
    let intervals: Vec<f64> = events
        .windows(2)
        .map(|pair| (pair[1].timestamp - pair[0].timestamp) as f64)
        .collect();
    let mean = intervals.iter().sum::<f64>() / intervals.len() as f64;
    if mean <= 0.0 {
        return None;
    }
    let variance = intervals
        .iter()
        .map(|interval| (interval - mean).powi(2))
        .sum::<f64>()
        / intervals.len() as f64;
    let stddev = variance.sqrt();
    if stddev < mean * config.interval_cv_threshold {
        Some(SuspiciousActivity {
            kind: ActivityKind::RegularIntervals,
            severity: Severity::High,
            description: format!(
                "inter-arrival deviation {:.0}ms against a {:.0}ms mean",
                stddev, mean
            ),
        })
    } else {
        None
    }
}

/// Error farming: a window dominated by error statuses indicates
/// enumeration or probing.
fn detect_error_farming(
    events: &[BehaviorPattern],
    config: &BehaviorConfig,
) -> Option<SuspiciousActivity> {
    if events.len() < config.min_error_samples {
        return None;
    }
    let errors = events.iter().filter(|e| e.response_status >= 400).count();
    let fraction = errors as f64 / events.len() as f64;
    if fraction > config.error_rate_threshold {
        Some(SuspiciousActivity {
            kind: ActivityKind::ErrorFarming,
            severity: Severity::Medium,
            description: format!("{} of {} requests errored", errors, events.len()),
        })
    } else {
        None
    }
}

fn detect_endpoint_scanning(
    events: &[BehaviorPattern],
    config: &BehaviorConfig,
) -> Option<SuspiciousActivity> {
    let distinct: HashSet<&str> = events.iter().map(|e| e.endpoint.as_str()).collect();
    if distinct.len() >= config.scan_distinct_endpoints {
        Some(SuspiciousActivity {
            kind: ActivityKind::EndpointScanning,
            severity: Severity::Medium,
            description: format!("{} distinct endpoints in the window", distinct.len()),
        })
    } else {
        None
    }
}

fn detect_credential_stuffing(
    events: &[BehaviorPattern],
    config: &BehaviorConfig,
) -> Option<SuspiciousActivity> {
    let failures = events
        .iter()
        .filter(|e| {
            (e.response_status == 401 || e.response_status == 403)
                && AUTH_MARKERS.iter().any(|m| e.endpoint.contains(m))
        })
        .count();
    if failures >= config.stuffing_failure_threshold {
        Some(SuspiciousActivity {
            kind: ActivityKind::CredentialStuffing,
            severity: Severity::High,
            description: format!("{} failed authentication attempts", failures),
        })
    } else {
        None
    }
}

/// Session anomaly: one identifier active from several addresses at once.
/// Feeds the score only; it has no standalone finding kind.
fn detect_session_anomalies(events: &[BehaviorPattern]) -> Option<Severity> {
    let distinct: HashSet<&str> = events.iter().map(|e| e.ip_address.as_str()).collect();
    (distinct.len() > 3).then_some(Severity::Medium)
}

/// Behavioral analyzer over the shared counter store
pub struct BehaviorAnalyzer {
    store: Arc<dyn CounterStore>,
    config: BehaviorConfig,
}

impl BehaviorAnalyzer {
    pub fn new(store: Arc<dyn CounterStore>, config: BehaviorConfig) -> Self {
        Self { store, config }
    }

    fn retention(&self) -> Duration {
        Duration::from_secs(self.config.retention_seconds)
    }

    /// Append an event to the identifier's window and refresh its
    /// retention. Amortized O(1); recording failures are logged, never
    /// propagated, so recording can stay off the request's critical path.
    pub async fn record_pattern(&self, identifier: &str, event: &BehaviorPattern) {
        let key = format_key(EVENTS_PREFIX, identifier);
        let payload = match serde_json::to_string(event) {
            Ok(payload) => payload,
            Err(e) => {
                error!("failed to encode behavior event for {}: {}", identifier, e);
                return;
            }
        };
        if let Err(e) = self
            .store
            .append_event(&key, event.timestamp, &payload, self.retention())
            .await
        {
            error!("failed to record behavior event for {}: {}", identifier, e);
        }
    }

    async fn load_window(&self, identifier: &str) -> Vec<BehaviorPattern> {
        let key = format_key(EVENTS_PREFIX, identifier);
        let window_ms = self.config.retention_seconds * 1_000;
        let raw = match self
            .store
            .window_events(&key, now_millis(), window_ms, self.config.max_window_events)
            .await
        {
            Ok(raw) => raw,
            Err(e) => {
                debug!("behavior window load failed for {}: {}", identifier, e);
                return Vec::new();
            }
        };
        let mut events: Vec<BehaviorPattern> = raw
            .iter()
            .filter_map(|payload| serde_json::from_str(payload).ok())
            .collect();
        events.sort_by_key(|e| e.timestamp);
        events
    }

    /// Run all detectors over the identifier's current window.
    pub async fn analyze_patterns(&self, identifier: &str) -> Vec<SuspiciousActivity> {
        let events = self.load_window(identifier).await;
        if events.is_empty() {
            return Vec::new();
        }
        let mut findings = Vec::new();
        findings.extend(detect_burst(&events, &self.config));
        findings.extend(detect_regular_intervals(&events, &self.config));
        findings.extend(detect_error_farming(&events, &self.config));
        findings.extend(detect_endpoint_scanning(&events, &self.config));
        findings.extend(detect_credential_stuffing(&events, &self.config));
        findings
    }

    /// Cached composite score. When the cache is stale the score is
    /// recomputed from the current window; an identifier with no history
    /// scores clean.
    pub async fn behavior_score(&self, identifier: &str) -> BehaviorScore {
        let cache_key = format_key(SCORE_PREFIX, identifier);
        match self.store.get(&cache_key).await {
            Ok(Some(raw)) => {
                if let Ok(score) = serde_json::from_str::<BehaviorScore>(&raw) {
                    return score;
                }
            }
            Ok(None) => {}
            Err(e) => debug!("behavior score cache read failed for {}: {}", identifier, e),
        }

        let events = self.load_window(identifier).await;
        let score = if events.is_empty() {
            BehaviorScore::clean()
        } else {
            self.compute_score(&events)
        };

        if let Ok(raw) = serde_json::to_string(&score) {
            let ttl = Duration::from_secs(self.config.score_ttl_seconds);
            if let Err(e) = self.store.put(&cache_key, &raw, ttl).await {
                debug!("behavior score cache write failed for {}: {}", identifier, e);
            }
        }
        score
    }

    fn compute_score(&self, events: &[BehaviorPattern]) -> BehaviorScore {
        let mut factors = RiskFactors::default();
        let mut recommendations = Vec::new();

        if let Some(finding) = detect_burst(events, &self.config) {
            factors.burst_activity = severity_weight(finding.severity);
            recommendations.push("Throttle burst traffic with a stricter tier".to_string());
        }
        if let Some(finding) = detect_regular_intervals(events, &self.config) {
            factors.regular_intervals = severity_weight(finding.severity);
            recommendations.push("Challenge the client: timing suggests automation".to_string());
        }
        if let Some(finding) = detect_error_farming(events, &self.config) {
            factors.error_rate = severity_weight(finding.severity);
            recommendations.push("Review request targets for enumeration".to_string());
        }
        if let Some(finding) = detect_endpoint_scanning(events, &self.config) {
            factors.endpoint_scanning = severity_weight(finding.severity);
            recommendations.push("Audit endpoint access breadth".to_string());
        }
        if let Some(finding) = detect_credential_stuffing(events, &self.config) {
            factors.credential_stuffing = severity_weight(finding.severity);
            recommendations.push("Lock down authentication endpoints".to_string());
        }
        if let Some(severity) = detect_session_anomalies(events) {
            factors.session_anomalies = severity_weight(severity);
        }

        // Weighted deduction from a clean baseline, floored at zero.
        let deduction = factors.burst_activity as f64 * 0.25
            + factors.regular_intervals as f64 * 0.20
            + factors.error_rate as f64 * 0.20
            + factors.endpoint_scanning as f64 * 0.15
            + factors.credential_stuffing as f64 * 0.30
            + factors.session_anomalies as f64 * 0.10;
        let overall = (100.0 - deduction).max(0.0) as u8;

        BehaviorScore {
            overall_score: overall,
            risk_factors: factors,
            recommendations,
        }
    }
}
