//! Rate limiting middleware using token bucket algorithm

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use governor::{
    clock::QuantaClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use scoperag_common::errors::{AppError, Result};
use scoperag_common::metrics::METRICS_PREFIX;
use std::num::NonZeroU32;
use std::sync::Arc;

/// Rate limiter using governor crate
pub type GlobalRateLimiter = RateLimiter<NotKeyed, InMemoryState, QuantaClock>;

/// Shared limiter together with its configured rate, for error bodies
#[derive(Clone)]
pub struct RateLimit {
    limiter: Arc<GlobalRateLimiter>,
    per_second: u32,
}

/// Create a new rate limiter
pub fn create_rate_limiter(requests_per_second: u32, burst: u32) -> Result<RateLimit> {
    let non_zero = |value: u32, name: &str| {
        NonZeroU32::new(value).ok_or_else(|| AppError::Configuration {
            message: format!("rate_limit.{} must be positive", name),
        })
    };

    let quota = Quota::per_second(non_zero(requests_per_second, "requests_per_second")?)
        .allow_burst(non_zero(burst, "burst")?);

    Ok(RateLimit {
        limiter: Arc::new(RateLimiter::direct(quota)),
        per_second: requests_per_second,
    })
}

/// Rate limiting middleware
pub async fn rate_limit_middleware(
    State(limit): State<RateLimit>,
    request: Request,
    next: Next,
) -> std::result::Result<Response, AppError> {
    match limit.limiter.check() {
        Ok(_) => Ok(next.run(request).await),
        Err(_) => {
            metrics::counter!(format!("{}_rate_limited_total", METRICS_PREFIX)).increment(1);
            Err(AppError::RateLimited { limit: limit.per_second })
        }
    }
}
