//! Configuration management for the abuse protection service.
//!
//! This module handles loading and managing application configuration
//! from environment variables and configuration files.

use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use std::env;

use crate::models::Config;

/// Load configuration from the config file and environment variables
pub fn load_config() -> Result<Config, ConfigError> {
    let config_file = env::var("CONFIG_FILE").unwrap_or_else(|_| "config/default.toml".to_string());

    let config = ConfigBuilder::builder()
        .add_source(File::with_name(&config_file).required(false))
        .add_source(Environment::default().separator("__"))
        .set_default("server.host", "127.0.0.1")?
        .set_default("server.port", 8080)?
        .set_default("redis.url", "redis://127.0.0.1:6379")?
        .set_default("redis.pool_size", 10)?
        .set_default("tiers.global.window_ms", 60_000)?
        .set_default("tiers.global.max_requests", 60)?
        .set_default("geo.provider_url", "http://127.0.0.1:8081/lookup")?
        .set_default("geo.lookup_timeout_ms", 3_000)?
        .set_default("captcha.verify_url", "https://challenges.example.com/siteverify")?
        .set_default("captcha.secret", "")?
        .build()?;

    config.try_deserialize()
}
