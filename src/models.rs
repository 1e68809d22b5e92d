use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Role of the actor making a request.
///
/// Roles are ordered by trust: anonymous traffic gets the strictest limits,
/// admins the most permissive ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Anonymous,
    Buyer,
    Supplier,
    Admin,
}

impl Default for UserRole {
    fn default() -> Self {
        UserRole::Anonymous
    }
}

impl UserRole {
    /// Trusted roles skip CAPTCHA challenges entirely.
    pub fn is_trusted(&self) -> bool {
        matches!(self, UserRole::Admin)
    }
}

/// Per-request actor descriptor. Built once per request by the orchestration
/// layer and never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserContext {
    pub is_authenticated: bool,
    pub user_id: Option<String>,
    #[serde(default)]
    pub user_role: UserRole,
    pub ip_address: String,
    pub user_agent: Option<String>,
    pub country: Option<String>,
    pub city: Option<String>,
}

impl UserContext {
    /// Anonymous context for a bare IP address.
    pub fn anonymous(ip: &str) -> Self {
        Self {
            is_authenticated: false,
            user_id: None,
            user_role: UserRole::Anonymous,
            ip_address: ip.to_string(),
            user_agent: None,
            country: None,
            city: None,
        }
    }
}

/// Rate limit configuration for a single tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Window length in milliseconds
    pub window_ms: u64,
    /// Maximum requests per window
    pub max_requests: u32,
}

impl RateLimitConfig {
    pub fn new(window_ms: u64, max_requests: u32) -> Self {
        Self { window_ms, max_requests }
    }
}

/// Static tier table keyed by role and endpoint.
///
/// Resolution precedence: endpoint override (longest matching prefix) >
/// sensitive-endpoint tier > role default > global default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitTiers {
    /// Global fallback tier
    pub global: RateLimitConfig,
    /// Role default tiers
    pub anonymous: RateLimitConfig,
    pub buyer: RateLimitConfig,
    pub supplier: RateLimitConfig,
    pub admin: RateLimitConfig,
    /// Tight tier for credential-sensitive endpoints, applied regardless of role
    pub sensitive: RateLimitConfig,
    /// Path prefixes that route to the sensitive tier
    pub sensitive_endpoints: Vec<String>,
    /// Explicit per-endpoint overrides keyed by path prefix
    pub endpoint_overrides: HashMap<String, RateLimitConfig>,
}

impl RateLimitTiers {
    pub fn role_default(&self, role: UserRole) -> &RateLimitConfig {
        match role {
            UserRole::Anonymous => &self.anonymous,
            UserRole::Buyer => &self.buyer,
            UserRole::Supplier => &self.supplier,
            UserRole::Admin => &self.admin,
        }
    }
}

impl Default for RateLimitTiers {
    fn default() -> Self {
        Self {
            global: RateLimitConfig::new(60_000, 60),
            anonymous: RateLimitConfig::new(60_000, 30),
            buyer: RateLimitConfig::new(60_000, 60),
            supplier: RateLimitConfig::new(60_000, 100),
            admin: RateLimitConfig::new(60_000, 300),
            sensitive: RateLimitConfig::new(300_000, 5),
            sensitive_endpoints: vec![
                "/api/auth/login".to_string(),
                "/api/auth/password-reset".to_string(),
            ],
            endpoint_overrides: HashMap::new(),
        }
    }
}

/// Redis configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL
    pub url: String,
    /// Redis connection pool size
    pub pool_size: u32,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server host
    pub host: String,
    /// Server port
    pub port: u16,
}

/// Geo/IP analyzer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeoConfig {
    /// Lookup endpoint of the geo/reputation provider
    pub provider_url: String,
    /// Provider call timeout in milliseconds
    pub lookup_timeout_ms: u64,
    /// Cache TTL for resolved locations in seconds
    pub cache_ttl_seconds: u64,
    /// Shorter cache TTL for high/critical threat records, so they are
    /// re-evaluated sooner
    pub high_threat_cache_ttl_seconds: u64,
}

impl Default for GeoConfig {
    fn default() -> Self {
        Self {
            provider_url: "http://127.0.0.1:8081/lookup".to_string(),
            lookup_timeout_ms: 3_000,
            cache_ttl_seconds: 86_400,
            high_threat_cache_ttl_seconds: 3_600,
        }
    }
}

/// Behavioral analyzer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BehaviorConfig {
    /// Rolling retention window for recorded events in seconds
    pub retention_seconds: u64,
    /// Upper bound on events loaded per analysis pass
    pub max_window_events: usize,
    /// Cache TTL for computed behavior scores in seconds
    pub score_ttl_seconds: u64,
    /// Burst detection: events within the sub-window that trigger a finding
    pub burst_threshold: usize,
    /// Burst detection sub-window in seconds
    pub burst_window_seconds: u64,
    /// Minimum samples before interval regularity is evaluated
    pub min_interval_samples: usize,
    /// Regular-interval detection: stddev below this fraction of the mean
    /// inter-arrival interval flags scripted traffic
    pub interval_cv_threshold: f64,
    /// Error farming: error-status fraction that triggers a finding
    pub error_rate_threshold: f64,
    /// Minimum events before the error fraction is evaluated
    pub min_error_samples: usize,
    /// Endpoint scanning: distinct endpoints in the window that trigger a finding
    pub scan_distinct_endpoints: usize,
    /// Credential stuffing: failed auth-endpoint requests that trigger a finding
    pub stuffing_failure_threshold: usize,
}

impl Default for BehaviorConfig {
    fn default() -> Self {
        Self {
            retention_seconds: 3_600,
            max_window_events: 1_000,
            score_ttl_seconds: 300,
            burst_threshold: 30,
            burst_window_seconds: 30,
            min_interval_samples: 10,
            interval_cv_threshold: 0.1,
            error_rate_threshold: 0.6,
            min_error_samples: 20,
            scan_distinct_endpoints: 15,
            stuffing_failure_threshold: 10,
        }
    }
}

/// CAPTCHA challenge configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptchaConfig {
    /// Verification endpoint of the CAPTCHA vendor
    pub verify_url: String,
    /// Shared secret passed to the vendor
    pub secret: String,
    /// Vendor call timeout in milliseconds
    pub verify_timeout_ms: u64,
    /// Challenge lifetime in seconds
    pub challenge_ttl_seconds: u64,
    /// Verification attempts before a challenge is exhausted
    pub max_attempts: u32,
    /// Behavior scores below this require a challenge
    pub score_threshold: u8,
    /// Request rates above this (per window) require a challenge
    pub rate_threshold: u32,
}

impl Default for CaptchaConfig {
    fn default() -> Self {
        Self {
            verify_url: "https://challenges.example.com/siteverify".to_string(),
            secret: String::new(),
            verify_timeout_ms: 3_000,
            challenge_ttl_seconds: 600,
            max_attempts: 3,
            score_threshold: 60,
            rate_threshold: 30,
        }
    }
}

/// Bypass detector configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BypassConfig {
    /// Window over which identifier cardinality is tracked, in seconds
    pub tracking_window_seconds: u64,
    /// Distinct IPs per identifier tolerated within the window
    pub max_distinct_ips: u64,
    /// Distinct user agents per identifier tolerated within the window
    pub max_distinct_user_agents: u64,
    /// Penalty multiplier for header manipulation
    pub header_penalty: f64,
    /// Penalty multiplier for IP / user-agent rotation
    pub rotation_penalty: f64,
    /// Audit trail retention in hours
    pub audit_retention_hours: u64,
}

impl Default for BypassConfig {
    fn default() -> Self {
        Self {
            tracking_window_seconds: 600,
            max_distinct_ips: 5,
            max_distinct_user_agents: 10,
            header_penalty: 3.0,
            rotation_penalty: 2.0,
            audit_retention_hours: 24,
        }
    }
}

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Redis configuration
    pub redis: RedisConfig,
    /// Rate limit tier table
    pub tiers: RateLimitTiers,
    /// Geo/IP analyzer configuration
    pub geo: GeoConfig,
    /// Behavioral analyzer configuration
    pub behavior: BehaviorConfig,
    /// CAPTCHA configuration
    pub captcha: CaptchaConfig,
    /// Bypass detector configuration
    pub bypass: BypassConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        dotenv::dotenv().ok();

        let mut config = Self::default();
        config.redis.url = std::env::var("REDIS_URL")?;
        if let Ok(host) = std::env::var("SERVER_HOST") {
            config.server.host = host;
        }
        if let Ok(port) = std::env::var("SERVER_PORT") {
            config.server.port = port.parse()?;
        }
        if let Ok(url) = std::env::var("GEO_PROVIDER_URL") {
            config.geo.provider_url = url;
        }
        if let Ok(url) = std::env::var("CAPTCHA_VERIFY_URL") {
            config.captcha.verify_url = url;
        }
        if let Ok(secret) = std::env::var("CAPTCHA_SECRET") {
            config.captcha.secret = secret;
        }
        Ok(config)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            redis: RedisConfig {
                url: "redis://127.0.0.1:6379".to_string(),
                pool_size: 10,
            },
            tiers: RateLimitTiers::default(),
            geo: GeoConfig::default(),
            behavior: BehaviorConfig::default(),
            captcha: CaptchaConfig::default(),
            bypass: BypassConfig::default(),
        }
    }
}
