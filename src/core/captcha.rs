//! CAPTCHA challenge management for the abuse protection service.
//!
//! Challenges move through a small state machine: issued, then verified
//! (success), expired (TTL elapsed) or exhausted (attempts spent). Expired
//! and exhausted challenges never reach the vendor again, so the
//! verification endpoint cannot be used as an answer oracle.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, error, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::core::rate_limiter::SuspiciousIpRegistry;
use crate::core::store::{CounterStore, StoreError};
use crate::models::{CaptchaConfig, UserContext};
use crate::utils::format_key;

const CHALLENGE_PREFIX: &str = "captcha";

/// Errors that can occur during challenge management
#[derive(Error, Debug)]
pub enum CaptchaError {
    #[error("Store error: {0}")]
    StoreError(#[from] StoreError),
    #[error("Vendor request failed: {0}")]
    VendorError(#[from] reqwest::Error),
    #[error("Challenge encoding error: {0}")]
    EncodingError(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptchaDifficulty {
    Easy,
    Medium,
    Hard,
}

/// One challenge instance, persisted in the store keyed by id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptchaChallenge {
    pub id: String,
    pub difficulty: CaptchaDifficulty,
    pub ip_address: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub verified: bool,
}

impl CaptchaChallenge {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

/// Whether a request must solve a challenge, and why.
#[derive(Debug, Clone, Serialize)]
pub struct CaptchaDecision {
    pub required: bool,
    pub reason: Option<String>,
}

impl CaptchaDecision {
    fn not_required() -> Self {
        Self {
            required: false,
            reason: None,
        }
    }

    fn required(reason: &str) -> Self {
        Self {
            required: true,
            reason: Some(reason.to_string()),
        }
    }
}

/// Result of a verification attempt surfaced to the caller. Challenge-state
/// failures carry a specific reason so clients can re-issue a challenge
/// instead of retrying blindly.
#[derive(Debug, Clone, Serialize)]
pub struct VerifyOutcome {
    pub success: bool,
    pub error: Option<String>,
}

impl VerifyOutcome {
    fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    fn failed(reason: &str) -> Self {
        Self {
            success: false,
            error: Some(reason.to_string()),
        }
    }
}

/// Verdict returned by the vendor for a single verification attempt
#[derive(Debug, Clone, Deserialize)]
pub struct VendorVerdict {
    pub success: bool,
    #[serde(rename = "error-codes", default)]
    pub error_codes: Vec<String>,
}

/// Opaque vendor verification call.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CaptchaVerifier: Send + Sync {
    async fn verify(&self, response: &str) -> Result<VendorVerdict, CaptchaError>;
}

/// HTTP CAPTCHA vendor client
pub struct HttpCaptchaVerifier {
    client: reqwest::Client,
    url: String,
    secret: String,
}

impl HttpCaptchaVerifier {
    pub fn new(url: String, secret: String, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            client,
            url,
            secret,
        }
    }
}

#[async_trait]
impl CaptchaVerifier for HttpCaptchaVerifier {
    async fn verify(&self, response: &str) -> Result<VendorVerdict, CaptchaError> {
        let verdict = self
            .client
            .post(&self.url)
            .form(&[("secret", self.secret.as_str()), ("response", response)])
            .send()
            .await?
            .error_for_status()?
            .json::<VendorVerdict>()
            .await?;
        Ok(verdict)
    }
}

/// CAPTCHA challenge manager
pub struct CaptchaManager {
    store: Arc<dyn CounterStore>,
    verifier: Arc<dyn CaptchaVerifier>,
    registry: SuspiciousIpRegistry,
    config: CaptchaConfig,
}

impl CaptchaManager {
    pub fn new(
        store: Arc<dyn CounterStore>,
        verifier: Arc<dyn CaptchaVerifier>,
        registry: SuspiciousIpRegistry,
        config: CaptchaConfig,
    ) -> Self {
        Self {
            store,
            verifier,
            registry,
            config,
        }
    }

    /// Decide whether a challenge is required.
    ///
    /// Trusted roles short-circuit to not-required regardless of other
    /// signals; otherwise any one of a poor behavior score, excessive
    /// request velocity or suspicious-IP membership triggers a challenge.
    pub async fn should_require(
        &self,
        context: &UserContext,
        behavior_score: Option<u8>,
        request_rate: Option<u32>,
    ) -> CaptchaDecision {
        if context.user_role.is_trusted() {
            return CaptchaDecision::not_required();
        }
        if let Some(score) = behavior_score {
            if score < self.config.score_threshold {
                return CaptchaDecision::required("behavior score below threshold");
            }
        }
        if let Some(rate) = request_rate {
            if rate > self.config.rate_threshold {
                return CaptchaDecision::required("request rate above threshold");
            }
        }
        if self
            .registry
            .is_suspicious(&context.ip_address, context.country.as_deref())
            .await
        {
            return CaptchaDecision::required("address flagged as suspicious");
        }
        CaptchaDecision::not_required()
    }

    /// Pick a difficulty from the behavior score.
    pub fn difficulty_for(&self, behavior_score: u8) -> CaptchaDifficulty {
        if behavior_score < 40 {
            CaptchaDifficulty::Hard
        } else if behavior_score < self.config.score_threshold {
            CaptchaDifficulty::Medium
        } else {
            CaptchaDifficulty::Easy
        }
    }

    /// Issue a new challenge for the requesting address.
    pub async fn create_challenge(
        &self,
        context: &UserContext,
        difficulty: CaptchaDifficulty,
    ) -> Result<CaptchaChallenge, CaptchaError> {
        let now = Utc::now();
        let challenge = CaptchaChallenge {
            id: Uuid::new_v4().to_string(),
            difficulty,
            ip_address: context.ip_address.clone(),
            created_at: now,
            expires_at: now + chrono::Duration::seconds(self.config.challenge_ttl_seconds as i64),
            attempts: 0,
            max_attempts: self.config.max_attempts,
            verified: false,
        };
        self.persist(&challenge, Duration::from_secs(self.config.challenge_ttl_seconds))
            .await?;
        metrics::increment_counter!("captcha_challenges_issued_total");
        Ok(challenge)
    }

    /// Verify a response against a stored challenge.
    ///
    /// Expired and exhausted challenges fail fast without a vendor call.
    /// A vendor-reported rejection consumes an attempt; a transport failure
    /// is reported as a failure but does not consume one.
    pub async fn verify_challenge(&self, id: &str, response: &str) -> VerifyOutcome {
        let key = format_key(CHALLENGE_PREFIX, id);
        let raw = match self.store.get(&key).await {
            Ok(raw) => raw,
            Err(e) => {
                error!("challenge lookup failed for {}: {}", id, e);
                return VerifyOutcome::failed("Verification temporarily unavailable");
            }
        };
        let mut challenge: CaptchaChallenge = match raw.and_then(|r| serde_json::from_str(&r).ok())
        {
            Some(challenge) => challenge,
            None => return VerifyOutcome::failed("Challenge not found"),
        };

        let now = Utc::now();
        if challenge.is_expired(now) {
            if let Err(e) = self.store.delete(&key).await {
                debug!("failed to drop expired challenge {}: {}", id, e);
            }
            return VerifyOutcome::failed("Challenge expired");
        }
        if challenge.is_exhausted() {
            return VerifyOutcome::failed("Challenge attempts exhausted");
        }

        let verdict = match self.verifier.verify(response).await {
            Ok(verdict) => verdict,
            Err(e) => {
                // An unreachable vendor is a failed verification, never a
                // silent pass; the attempt is not consumed.
                error!("captcha vendor call failed for {}: {}", id, e);
                return VerifyOutcome::failed("Verification temporarily unavailable");
            }
        };

        if verdict.success {
            if let Err(e) = self.store.delete(&key).await {
                debug!("failed to drop verified challenge {}: {}", id, e);
            }
            metrics::increment_counter!("captcha_verified_total");
            return VerifyOutcome::ok();
        }

        challenge.attempts += 1;
        let remaining = (challenge.expires_at - now)
            .to_std()
            .unwrap_or(Duration::from_secs(1));
        if let Err(e) = self.persist(&challenge, remaining).await {
            error!("failed to persist challenge {} after attempt: {}", id, e);
        }
        if challenge.is_exhausted() {
            warn!(
                "challenge {} exhausted after {} attempts (ip {})",
                id, challenge.attempts, challenge.ip_address
            );
            metrics::increment_counter!("captcha_exhausted_total");
            return VerifyOutcome::failed("Challenge attempts exhausted");
        }
        if verdict.error_codes.is_empty() {
            VerifyOutcome::failed("Incorrect response")
        } else {
            VerifyOutcome::failed(&format!(
                "Incorrect response ({})",
                verdict.error_codes.join(", ")
            ))
        }
    }

    async fn persist(
        &self,
        challenge: &CaptchaChallenge,
        ttl: Duration,
    ) -> Result<(), CaptchaError> {
        let key = format_key(CHALLENGE_PREFIX, &challenge.id);
        let raw = serde_json::to_string(challenge)?;
        self.store.put(&key, &raw, ttl).await?;
        Ok(())
    }
}
