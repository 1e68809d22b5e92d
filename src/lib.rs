//! Abuse protection engine library.
//!
//! Exposes the core engines (rate limiting, geo analysis, behavioral
//! analysis, CAPTCHA challenges, bypass detection) together with the
//! configuration model and the HTTP API glue.

pub mod api;
pub mod config;
pub mod core;
pub mod models;
pub mod utils;
