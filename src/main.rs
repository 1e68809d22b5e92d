//! Abuse Protection Service
//!
//! This is the main entry point for the abuse protection service.
//! It initializes the engines and starts the web server.

use std::sync::Arc;
use std::time::Duration;

use actix_web::{web, App, HttpServer};
use dotenv::dotenv;
use log::{info, warn};
use redis::Client;

use abuse_protection_service::api::{self, ApiState};
use abuse_protection_service::config;
use abuse_protection_service::core::captcha::HttpCaptchaVerifier;
use abuse_protection_service::core::geo::HttpGeoProvider;
use abuse_protection_service::core::rate_limiter::SuspiciousIpRegistry;
use abuse_protection_service::core::{
    BehaviorAnalyzer, BlockingRules, BypassDetector, CaptchaManager, CounterStore, GeoAnalyzer,
    RateLimiter, RedisCounterStore,
};

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    // Load environment variables
    dotenv().ok();

    // Initialize logging
    env_logger::init();

    info!("Starting Abuse Protection Service...");

    // Load configuration
    let config = config::load_config().expect("Failed to load configuration");

    if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new().install() {
        warn!("Prometheus exporter not installed: {}", e);
    }

    // Initialize the shared counter store
    let redis_client =
        Client::open(config.redis.url.as_str()).expect("Failed to create Redis client");
    let store: Arc<dyn CounterStore> = Arc::new(RedisCounterStore::new(redis_client));

    // External providers
    let geo_provider = Arc::new(HttpGeoProvider::new(
        config.geo.provider_url.clone(),
        Duration::from_millis(config.geo.lookup_timeout_ms),
    ));
    let captcha_verifier = Arc::new(HttpCaptchaVerifier::new(
        config.captcha.verify_url.clone(),
        config.captcha.secret.clone(),
        Duration::from_millis(config.captcha.verify_timeout_ms),
    ));

    // Engines
    let geo = Arc::new(GeoAnalyzer::new(
        geo_provider,
        store.clone(),
        config.geo.clone(),
    ));
    if let Err(e) = geo.load_rules().await {
        warn!("Failed to load geo rules: {}", e);
    }
    let registry = SuspiciousIpRegistry::new(store.clone());

    let state = web::Data::new(ApiState {
        rate_limiter: Arc::new(RateLimiter::new(store.clone(), config.tiers.clone())),
        geo,
        behavior: Arc::new(BehaviorAnalyzer::new(store.clone(), config.behavior.clone())),
        captcha: Arc::new(CaptchaManager::new(
            store.clone(),
            captcha_verifier,
            registry.clone(),
            config.captcha.clone(),
        )),
        bypass: Arc::new(BypassDetector::new(store.clone(), config.bypass.clone())),
        blocking: Arc::new(BlockingRules::new(store)),
        suspicious: registry,
    });

    // Start HTTP server
    let bind = (config.server.host.clone(), config.server.port);
    HttpServer::new(move || App::new().app_data(state.clone()).configure(api::config))
        .bind(bind)?
        .run()
        .await
}
