//! API endpoints for the abuse protection service.
//!
//! The `/check` endpoint is the orchestration glue: per request it
//! sequences geo-block veto, blocking-rule lookup, bypass analysis,
//! penalty-adjusted rate limiting and the CAPTCHA decision, then records
//! the behavioral event off the critical path. The remaining endpoints are
//! reporting and administration views.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use actix_web::{web, HttpResponse, HttpResponseBuilder, Responder};
use log::warn;
use serde::{Deserialize, Serialize};

use crate::core::behavior::BehaviorPattern;
use crate::core::blocking::BlockingRuleType;
use crate::core::bypass::BypassType;
use crate::core::captcha::CaptchaDifficulty;
use crate::core::geo::GeoBlockRule;
use crate::core::headers::RequestHeaders;
use crate::core::rate_limiter::{apply_penalty, RateLimitResult, SuspiciousIpRegistry};
use crate::core::{
    BehaviorAnalyzer, BlockingRules, BypassDetector, CaptchaManager, GeoAnalyzer, RateLimiter,
    Severity,
};
use crate::models::{RateLimitConfig, UserContext, UserRole};
use crate::utils::now_millis;

pub struct ApiState {
    pub rate_limiter: Arc<RateLimiter>,
    pub geo: Arc<GeoAnalyzer>,
    pub behavior: Arc<BehaviorAnalyzer>,
    pub captcha: Arc<CaptchaManager>,
    pub bypass: Arc<BypassDetector>,
    pub blocking: Arc<BlockingRules>,
    pub suspicious: SuspiciousIpRegistry,
}

/// API configuration function for Actix-web
pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1")
            .service(web::resource("/health").route(web::get().to(health_check)))
            .service(web::resource("/check").route(web::post().to(check_request)))
            .service(web::resource("/captcha/challenge").route(web::post().to(create_challenge)))
            .service(web::resource("/captcha/verify").route(web::post().to(verify_challenge)))
            .service(web::resource("/bypass/attempts").route(web::get().to(bypass_attempts)))
            .service(web::resource("/bypass/stats").route(web::get().to(bypass_stats)))
            .service(
                web::resource("/geo/rules")
                    .route(web::get().to(get_geo_rules))
                    .route(web::put().to(put_geo_rules)),
            ),
    );
}

/// Health check endpoint response
#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

/// Inbound request descriptor supplied by the edge
#[derive(Debug, Serialize, Deserialize)]
pub struct CheckRequest {
    pub ip_address: String,
    pub endpoint: String,
    #[serde(default = "default_method")]
    pub method: String,
    pub user_id: Option<String>,
    #[serde(default)]
    pub user_role: UserRole,
    pub user_agent: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

fn default_method() -> String {
    "GET".to_string()
}

/// Protection decision surfaced to the edge
#[derive(Debug, Serialize)]
struct CheckResponse {
    allowed: bool,
    remaining: u32,
    reset_time: u64,
    total_requests: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after: Option<u64>,
    requires_captcha: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    captcha_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    challenge_id: Option<String>,
}

#[derive(Serialize)]
struct BlockedResponse {
    blocked: bool,
    reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    rule_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateChallengeRequest {
    pub ip_address: String,
    pub difficulty: Option<CaptchaDifficulty>,
}

#[derive(Debug, Deserialize)]
pub struct VerifyChallengeRequest {
    pub challenge_id: String,
    pub response: String,
}

#[derive(Debug, Deserialize)]
pub struct AttemptsQuery {
    pub attempt_type: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StatsQuery {
    pub hours: Option<u64>,
}

/// Health check endpoint
async fn health_check() -> impl Responder {
    HttpResponse::Ok().json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

fn rate_limit_headers(
    mut builder: HttpResponseBuilder,
    config: &RateLimitConfig,
    result: &RateLimitResult,
) -> HttpResponseBuilder {
    builder.append_header(("X-RateLimit-Limit", config.max_requests.to_string()));
    builder.append_header(("X-RateLimit-Remaining", result.remaining.to_string()));
    builder.append_header(("X-RateLimit-Reset", result.reset_time.to_string()));
    if let Some(retry_after) = result.retry_after {
        builder.append_header(("Retry-After", retry_after.to_string()));
    }
    builder
}

/// Record the behavioral event after the decision, off the critical path.
fn record_event(state: &web::Data<ApiState>, identifier: &str, req: &CheckRequest, status: u16, started: Instant) {
    let behavior = state.behavior.clone();
    let identifier = identifier.to_string();
    let event = BehaviorPattern {
        ip_address: req.ip_address.clone(),
        timestamp: now_millis(),
        endpoint: req.endpoint.clone(),
        method: req.method.clone(),
        response_status: status,
        response_time_ms: started.elapsed().as_millis() as u64,
    };
    tokio::spawn(async move {
        behavior.record_pattern(&identifier, &event).await;
    });
}

/// Protection check endpoint: the per-request orchestration sequence.
pub async fn check_request(
    state: web::Data<ApiState>,
    req: web::Json<CheckRequest>,
) -> impl Responder {
    let started = Instant::now();
    let req = req.into_inner();

    let location = state.geo.analyze_ip(&req.ip_address).await;
    let context = UserContext {
        is_authenticated: req.user_id.is_some(),
        user_id: req.user_id.clone(),
        user_role: req.user_role,
        ip_address: req.ip_address.clone(),
        user_agent: req.user_agent.clone(),
        country: Some(location.country_code.clone()),
        city: Some(location.city.clone()),
    };
    let identifier = state.rate_limiter.identifier(&context);

    // Geographic block is an absolute veto, evaluated before anything else
    let geo_decision = state.geo.should_block(&req.ip_address).await;
    if geo_decision.blocked {
        record_event(&state, &identifier, &req, 403, started);
        return HttpResponse::Forbidden().json(BlockedResponse {
            blocked: true,
            reason: geo_decision
                .reason
                .unwrap_or_else(|| "Geographic restriction".to_string()),
            rule_id: geo_decision.rule_id,
        });
    }

    if let Some(rule) = state
        .blocking
        .is_blocked(BlockingRuleType::Ip, &req.ip_address)
        .await
    {
        record_event(&state, &identifier, &req, 403, started);
        return HttpResponse::Forbidden().json(BlockedResponse {
            blocked: true,
            reason: rule.reason,
            rule_id: None,
        });
    }

    // Bypass analysis folds into the effective limit as a penalty
    let headers: RequestHeaders = req
        .headers
        .iter()
        .map(|(name, value)| (name.as_str(), value.as_str()))
        .collect();
    let analysis = state.bypass.analyze_request(&context, &headers).await;
    if analysis.bypass_attempted && analysis.severity >= Severity::High {
        // High-confidence evasion marks the address for CAPTCHA challenges
        state
            .suspicious
            .add(&context.ip_address, context.country.as_deref(), Duration::from_secs(3600))
            .await;
    }
    let tier = state.rate_limiter.resolve_limit(&context, Some(&req.endpoint));
    let effective = apply_penalty(&tier, analysis.penalty_multiplier);

    let result = state.rate_limiter.check_limit(&identifier, &effective).await;
    state
        .bypass
        .record_attempt(&analysis, &context, !result.allowed)
        .await;

    if result.allowed {
        record_event(&state, &identifier, &req, 200, started);
        return rate_limit_headers(HttpResponse::Ok(), &effective, &result).json(CheckResponse {
            allowed: true,
            remaining: result.remaining,
            reset_time: result.reset_time,
            total_requests: result.total_requests,
            retry_after: None,
            requires_captcha: false,
            captcha_type: None,
            challenge_id: None,
        });
    }

    // Denied: decide between a plain 429 and a CAPTCHA challenge
    let (score, request_rate) = futures::join!(
        state.behavior.behavior_score(&identifier),
        state.rate_limiter.current_rate(&identifier)
    );
    let decision = state
        .captcha
        .should_require(&context, Some(score.overall_score), Some(request_rate))
        .await;

    let mut requires_captcha = decision.required;
    let mut captcha_type = None;
    let mut challenge_id = None;
    if decision.required {
        let difficulty = state.captcha.difficulty_for(score.overall_score);
        match state.captcha.create_challenge(&context, difficulty).await {
            Ok(challenge) => {
                captcha_type = Some(format!("{:?}", difficulty).to_lowercase());
                challenge_id = Some(challenge.id);
            }
            Err(e) => {
                warn!("challenge issuance failed for {}: {}", identifier, e);
                requires_captcha = false;
            }
        }
    }

    record_event(&state, &identifier, &req, 429, started);
    rate_limit_headers(HttpResponse::TooManyRequests(), &effective, &result).json(CheckResponse {
        allowed: false,
        remaining: 0,
        reset_time: result.reset_time,
        total_requests: result.total_requests,
        retry_after: result.retry_after,
        requires_captcha,
        captcha_type,
        challenge_id,
    })
}

/// Issue a CAPTCHA challenge explicitly
pub async fn create_challenge(
    state: web::Data<ApiState>,
    req: web::Json<CreateChallengeRequest>,
) -> impl Responder {
    let context = UserContext::anonymous(&req.ip_address);
    let difficulty = req.difficulty.unwrap_or(CaptchaDifficulty::Medium);
    match state.captcha.create_challenge(&context, difficulty).await {
        Ok(challenge) => HttpResponse::Ok().json(challenge),
        Err(e) => {
            warn!("challenge issuance failed: {}", e);
            HttpResponse::ServiceUnavailable().finish()
        }
    }
}

/// Verify a CAPTCHA response
pub async fn verify_challenge(
    state: web::Data<ApiState>,
    req: web::Json<VerifyChallengeRequest>,
) -> impl Responder {
    let outcome = state
        .captcha
        .verify_challenge(&req.challenge_id, &req.response)
        .await;
    if outcome.success {
        HttpResponse::Ok().json(outcome)
    } else {
        HttpResponse::BadRequest().json(outcome)
    }
}

fn parse_attempt_type(raw: &str) -> Option<BypassType> {
    match raw {
        "header_manipulation" => Some(BypassType::HeaderManipulation),
        "ip_rotation" => Some(BypassType::IpRotation),
        "user_agent_rotation" => Some(BypassType::UserAgentRotation),
        _ => None,
    }
}

/// Bypass attempt audit trail
pub async fn bypass_attempts(
    state: web::Data<ApiState>,
    query: web::Query<AttemptsQuery>,
) -> impl Responder {
    let filter = match query.attempt_type.as_deref() {
        Some(raw) => match parse_attempt_type(raw) {
            Some(attempt_type) => Some(attempt_type),
            None => {
                return HttpResponse::BadRequest()
                    .json(serde_json::json!({"error": "unknown attempt type"}))
            }
        },
        None => None,
    };
    HttpResponse::Ok().json(state.bypass.attempts(filter).await)
}

/// Aggregated bypass statistics
pub async fn bypass_stats(
    state: web::Data<ApiState>,
    query: web::Query<StatsQuery>,
) -> impl Responder {
    let hours = query.hours.unwrap_or(24);
    let stats = state.bypass.stats(Duration::from_secs(hours * 3600)).await;
    HttpResponse::Ok().json(stats)
}

pub async fn get_geo_rules(state: web::Data<ApiState>) -> impl Responder {
    HttpResponse::Ok().json(state.geo.rules().await)
}

pub async fn put_geo_rules(
    state: web::Data<ApiState>,
    rules: web::Json<Vec<GeoBlockRule>>,
) -> impl Responder {
    match state.geo.set_rules(rules.into_inner()).await {
        Ok(()) => HttpResponse::NoContent().finish(),
        Err(e) => {
            warn!("failed to update geo rules: {}", e);
            HttpResponse::ServiceUnavailable().finish()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{test, App};
    use async_trait::async_trait;
    use std::sync::Arc;

    use crate::core::captcha::{CaptchaError, CaptchaVerifier, VendorVerdict};
    use crate::core::geo::{GeoError, GeoLocation, GeoProvider, GeoRuleAction, ThreatLevel};
    use crate::core::rate_limiter::SuspiciousIpRegistry;
    use crate::core::store::memory::MemoryCounterStore;
    use crate::models::{
        BehaviorConfig, BypassConfig, CaptchaConfig, GeoConfig, RateLimitTiers,
    };

    struct FixedProvider(GeoLocation);

    #[async_trait]
    impl GeoProvider for FixedProvider {
        async fn lookup(&self, _ip: &str) -> Result<GeoLocation, GeoError> {
            Ok(self.0.clone())
        }
    }

    struct AlwaysPassVerifier;

    #[async_trait]
    impl CaptchaVerifier for AlwaysPassVerifier {
        async fn verify(&self, _response: &str) -> Result<VendorVerdict, CaptchaError> {
            Ok(VendorVerdict {
                success: true,
                error_codes: Vec::new(),
            })
        }
    }

    fn resolved(country_code: &str, threat_level: ThreatLevel) -> GeoLocation {
        GeoLocation {
            ip_address: "203.0.113.10".to_string(),
            country: country_code.to_string(),
            country_code: country_code.to_string(),
            city: "Test".to_string(),
            threat_level,
            reputation: 80,
            is_tor: false,
            is_vpn: false,
            is_proxy: false,
        }
    }

    fn state_with(location: GeoLocation) -> ApiState {
        let store: Arc<dyn crate::core::CounterStore> = Arc::new(MemoryCounterStore::new());
        let mut tiers = RateLimitTiers::default();
        tiers.anonymous = RateLimitConfig::new(60_000, 10);
        let registry = SuspiciousIpRegistry::new(store.clone());
        ApiState {
            suspicious: registry.clone(),
            rate_limiter: Arc::new(RateLimiter::new(store.clone(), tiers)),
            geo: Arc::new(GeoAnalyzer::new(
                Arc::new(FixedProvider(location)),
                store.clone(),
                GeoConfig::default(),
            )),
            behavior: Arc::new(BehaviorAnalyzer::new(store.clone(), BehaviorConfig::default())),
            captcha: Arc::new(CaptchaManager::new(
                store.clone(),
                Arc::new(AlwaysPassVerifier),
                registry,
                CaptchaConfig::default(),
            )),
            bypass: Arc::new(BypassDetector::new(store.clone(), BypassConfig::default())),
            blocking: Arc::new(BlockingRules::new(store)),
        }
    }

    fn check_payload(ip: &str) -> serde_json::Value {
        serde_json::json!({
            "ip_address": ip,
            "endpoint": "/api/campaigns",
            "method": "GET",
        })
    }

    #[actix_web::test]
    async fn test_health_check() {
        let state = web::Data::new(state_with(resolved("US", ThreatLevel::Low)));
        let app =
            test::init_service(App::new().app_data(state).configure(config)).await;

        let req = test::TestRequest::get().uri("/api/v1/health").to_request();
        let resp = test::call_service(&app, req).await;
        assert!(resp.status().is_success());
    }

    #[actix_web::test]
    async fn test_clean_anonymous_traffic_is_admitted_up_to_the_tier() {
        let state = web::Data::new(state_with(resolved("US", ThreatLevel::Low)));
        let app =
            test::init_service(App::new().app_data(state).configure(config)).await;

        for i in 0..10 {
            let req = test::TestRequest::post()
                .uri("/api/v1/check")
                .set_json(check_payload("203.0.113.10"))
                .to_request();
            let resp = test::call_service(&app, req).await;
            assert!(resp.status().is_success(), "request {} should pass", i + 1);
        }

        // The 11th within the same minute is denied with a positive
        // Retry-After
        let req = test::TestRequest::post()
            .uri("/api/v1/check")
            .set_json(check_payload("203.0.113.10"))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), actix_web::http::StatusCode::TOO_MANY_REQUESTS);
        let retry_after = resp
            .headers()
            .get("Retry-After")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap();
        assert!(retry_after > 0);

        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["allowed"], serde_json::json!(false));
    }

    #[actix_web::test]
    async fn test_geo_blocked_country_gets_403_with_rule_id() {
        let state = state_with(resolved("CN", ThreatLevel::High));
        state
            .geo
            .set_rules(vec![GeoBlockRule {
                id: "block-cn".to_string(),
                action: GeoRuleAction::Block,
                countries: ["CN".to_string()].into_iter().collect(),
                max_threat_level: ThreatLevel::Medium,
                priority: 10,
                enabled: true,
            }])
            .await
            .unwrap();
        let app = test::init_service(
            App::new().app_data(web::Data::new(state)).configure(config),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/api/v1/check")
            .set_json(check_payload("203.0.113.10"))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), actix_web::http::StatusCode::FORBIDDEN);
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["rule_id"], serde_json::json!("block-cn"));
        assert!(body["reason"].as_str().unwrap().contains("blocked"));
    }

    #[actix_web::test]
    async fn test_header_manipulation_shrinks_the_effective_limit() {
        let state = web::Data::new(state_with(resolved("US", ThreatLevel::Low)));
        let app = test::init_service(App::new().app_data(state.clone()).configure(config)).await;

        let payload = serde_json::json!({
            "ip_address": "203.0.113.44",
            "endpoint": "/api/campaigns",
            "headers": {
                "x-forwarded-for": "203.0.113.44",
                "x-real-ip": "198.51.100.3",
            },
        });

        // Tier allows 10, but the 3x penalty shrinks it to 3
        for i in 0..3 {
            let req = test::TestRequest::post()
                .uri("/api/v1/check")
                .set_json(payload.clone())
                .to_request();
            let resp = test::call_service(&app, req).await;
            assert!(resp.status().is_success(), "request {} should pass", i + 1);
        }
        let req = test::TestRequest::post()
            .uri("/api/v1/check")
            .set_json(payload)
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), actix_web::http::StatusCode::TOO_MANY_REQUESTS);

        // High-confidence evasion marks the address suspicious, so the
        // denial carries a challenge
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["requires_captcha"], serde_json::json!(true));
        assert!(body["challenge_id"].as_str().is_some());

        // The attempts were recorded in the audit trail
        let stats = state.bypass.stats(Duration::from_secs(3600)).await;
        assert!(stats.total_attempts >= 4);
        assert!(stats.attempts_by_type.contains_key("header_manipulation"));
    }

    #[actix_web::test]
    async fn test_captcha_verify_round_trip() {
        let state = web::Data::new(state_with(resolved("US", ThreatLevel::Low)));
        let app = test::init_service(App::new().app_data(state).configure(config)).await;

        let req = test::TestRequest::post()
            .uri("/api/v1/captcha/challenge")
            .set_json(serde_json::json!({"ip_address": "203.0.113.10"}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert!(resp.status().is_success());
        let challenge: serde_json::Value = test::read_body_json(resp).await;
        let id = challenge["id"].as_str().unwrap().to_string();

        let req = test::TestRequest::post()
            .uri("/api/v1/captcha/verify")
            .set_json(serde_json::json!({"challenge_id": id, "response": "answer"}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert!(resp.status().is_success());
    }
}
