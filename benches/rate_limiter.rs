use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::sync::Arc;

use abuse_protection_service::core::headers::RequestHeaders;
use abuse_protection_service::core::rate_limiter::{apply_penalty, RateLimiter};
use abuse_protection_service::core::store::RedisCounterStore;
use abuse_protection_service::models::{RateLimitTiers, UserContext, UserRole};

fn bench_tier_resolution(c: &mut Criterion) {
    let client = redis::Client::open("redis://127.0.0.1:6379").unwrap();
    let store = Arc::new(RedisCounterStore::new(client));
    let limiter = RateLimiter::new(store, RateLimitTiers::default());
    let context = UserContext {
        is_authenticated: true,
        user_id: Some("bench-user".to_string()),
        user_role: UserRole::Supplier,
        ip_address: "203.0.113.1".to_string(),
        user_agent: Some("bench/1.0".to_string()),
        country: None,
        city: None,
    };

    c.bench_function("resolve_limit", |b| {
        b.iter(|| {
            let tier = limiter.resolve_limit(black_box(&context), black_box(Some("/api/auth/login")));
            black_box(apply_penalty(&tier, 3.0))
        })
    });
}

fn bench_header_map(c: &mut Criterion) {
    c.bench_function("typed_header_map", |b| {
        b.iter(|| {
            let headers: RequestHeaders = [
                ("X-Forwarded-For", "203.0.113.7, 10.0.0.2"),
                ("X-Real-IP", "203.0.113.7"),
                ("User-Agent", "Mozilla/5.0"),
            ]
            .into_iter()
            .collect();
            black_box((headers.forwarded_for().map(|s| s.to_string()), headers.real_ip().map(|s| s.to_string())))
        })
    });
}

criterion_group!(benches, bench_tier_resolution, bench_header_map);
criterion_main!(benches);
