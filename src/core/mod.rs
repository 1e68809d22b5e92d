//! Core engines of the abuse protection service.
//!
//! This module contains the cooperating engines: sliding-window rate
//! limiting, geo/IP analysis, behavioral pattern analysis, CAPTCHA
//! challenge management and bypass detection, all sharing one counter
//! store.

pub mod behavior;
pub mod blocking;
pub mod bypass;
pub mod captcha;
pub mod geo;
pub mod headers;
pub mod rate_limiter;
pub mod store;

use serde::{Deserialize, Serialize};

/// Finding severity with a total order, so callers compare severities
/// directly instead of mapping strings to numbers inline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

pub use behavior::{BehaviorAnalyzer, BehaviorPattern, BehaviorScore};
pub use blocking::{BlockingRule, BlockingRuleType, BlockingRules};
pub use bypass::{BypassAnalysis, BypassAttempt, BypassDetector, BypassType};
pub use captcha::{CaptchaChallenge, CaptchaDifficulty, CaptchaManager, CaptchaVerifier};
pub use geo::{GeoAnalyzer, GeoBlockRule, GeoLocation, GeoProvider, ThreatLevel};
pub use headers::RequestHeaders;
pub use rate_limiter::{RateLimiter, RateLimitResult, SuspiciousIpRegistry};
pub use store::{CounterStore, RedisCounterStore, StoreError};
