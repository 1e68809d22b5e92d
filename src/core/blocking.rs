//! Shared blocking rule registry.
//!
//! Rules are created on detection (temporary or permanent), consulted by
//! the orchestration layer before any rate-limit check, and removed by TTL
//! expiry or manual action.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::core::store::CounterStore;
use crate::utils::now_millis;

/// Permanent rules still carry a store expiry; a year keeps them alive for
/// any practical purpose while bounding stale keys.
const PERMANENT_TTL: Duration = Duration::from_secs(365 * 24 * 3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockingRuleType {
    Phone,
    Ip,
    Email,
    Pattern,
}

impl BlockingRuleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockingRuleType::Phone => "phone",
            BlockingRuleType::Ip => "ip",
            BlockingRuleType::Email => "email",
            BlockingRuleType::Pattern => "pattern",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockingRule {
    pub rule_type: BlockingRuleType,
    pub value: String,
    pub reason: String,
    /// Epoch milliseconds; `None` for permanent rules
    pub expires_at: Option<u64>,
    pub auto_blocked: bool,
}

/// Store-backed registry of blocking rules
pub struct BlockingRules {
    store: Arc<dyn CounterStore>,
}

impl BlockingRules {
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self { store }
    }

    fn key(rule_type: BlockingRuleType, value: &str) -> String {
        format!("blocking:{}:{}", rule_type.as_str(), value)
    }

    pub async fn add_rule(&self, rule: BlockingRule) {
        let ttl = match rule.expires_at {
            Some(expires_at) => {
                Duration::from_millis(expires_at.saturating_sub(now_millis()).max(1))
            }
            None => PERMANENT_TTL,
        };
        let key = Self::key(rule.rule_type, &rule.value);
        let payload = match serde_json::to_string(&rule) {
            Ok(payload) => payload,
            Err(e) => {
                debug!("failed to encode blocking rule: {}", e);
                return;
            }
        };
        if let Err(e) = self.store.put(&key, &payload, ttl).await {
            warn!("failed to persist blocking rule {}: {}", key, e);
        }
    }

    /// Look up the active rule for a value, if any. Store failures and
    /// expired entries degrade to "not blocked".
    pub async fn is_blocked(
        &self,
        rule_type: BlockingRuleType,
        value: &str,
    ) -> Option<BlockingRule> {
        let key = Self::key(rule_type, value);
        let raw = match self.store.get(&key).await {
            Ok(raw) => raw?,
            Err(e) => {
                debug!("blocking rule lookup failed for {}: {}", key, e);
                return None;
            }
        };
        let rule: BlockingRule = serde_json::from_str(&raw).ok()?;
        if let Some(expires_at) = rule.expires_at {
            if expires_at <= now_millis() {
                if let Err(e) = self.store.delete(&key).await {
                    debug!("failed to sweep expired blocking rule {}: {}", key, e);
                }
                return None;
            }
        }
        Some(rule)
    }

    pub async fn remove_rule(&self, rule_type: BlockingRuleType, value: &str) {
        let key = Self::key(rule_type, value);
        if let Err(e) = self.store.delete(&key).await {
            warn!("failed to remove blocking rule {}: {}", key, e);
        }
    }
}
