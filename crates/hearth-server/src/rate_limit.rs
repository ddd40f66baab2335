//! Token-bucket limiting for HTTP requests (by client address) and inbound
//! socket events (by user).

use std::hash::Hash;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{Request, StatusCode},
    middleware::Next,
    response::Response,
};
use dashmap::DashMap;
use tracing::warn;

/// HTTP: 10 requests per second sustained, bursts of 30.
const HTTP_RATE: f64 = 10.0;
const HTTP_BURST: f64 = 30.0;

#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: f64,
    refilled_at: Instant,
}

impl Bucket {
    fn take(&mut self, now: Instant, rate: f64, burst: f64) -> bool {
        let earned = now.saturating_duration_since(self.refilled_at).as_secs_f64() * rate;
        self.tokens = (self.tokens + earned).min(burst);
        self.refilled_at = now;

        let allowed = self.tokens >= 1.0;
        if allowed {
            self.tokens -= 1.0;
        }
        allowed
    }
}

#[derive(Clone)]
pub struct RateLimiter<K = IpAddr>
where
    K: Eq + Hash,
{
    buckets: Arc<DashMap<K, Bucket>>,
    rate: f64,
    burst: f64,
}

impl<K: Eq + Hash + Copy> RateLimiter<K> {
    /// `rate` tokens per second, holding at most `burst`.
    pub fn new(rate: f64, burst: f64) -> Self {
        Self {
            buckets: Arc::new(DashMap::new()),
            rate,
            burst,
        }
    }

    /// Spend one token for `key`. A key seen for the first time starts full.
    pub fn check(&self, key: K) -> bool {
        let now = Instant::now();
        self.buckets
            .entry(key)
            .or_insert(Bucket {
                tokens: self.burst,
                refilled_at: now,
            })
            .take(now, self.rate, self.burst)
    }

    /// Drop buckets untouched for at least `max_idle`. Returns how many went.
    pub fn purge_stale(&self, max_idle: Duration) -> usize {
        let now = Instant::now();
        let before = self.buckets.len();
        self.buckets
            .retain(|_, bucket| now.saturating_duration_since(bucket.refilled_at) < max_idle);
        before - self.buckets.len()
    }
}

impl Default for RateLimiter<IpAddr> {
    fn default() -> Self {
        Self::new(HTTP_RATE, HTTP_BURST)
    }
}

/// Rejects requests with 429 once the client address runs out of tokens.
/// Requests whose address cannot be determined pass through.
pub async fn limit_by_address(
    State(limiter): State<RateLimiter>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    if let Some(ip) = client_address(&req) {
        if !limiter.check(ip) {
            warn!(ip = %ip, path = %req.uri().path(), "HTTP rate limit exceeded");
            return Err(StatusCode::TOO_MANY_REQUESTS);
        }
    }
    Ok(next.run(req).await)
}

/// Peer address, else the first `X-Forwarded-For` hop, else `X-Real-IP`.
fn client_address<B>(req: &Request<B>) -> Option<IpAddr> {
    if let Some(ConnectInfo(peer)) = req.extensions().get::<ConnectInfo<SocketAddr>>() {
        return Some(peer.ip());
    }

    let header = |name: &str| req.headers().get(name).and_then(|v| v.to_str().ok());

    header("x-forwarded-for")
        .and_then(|v| v.split(',').next())
        .and_then(|first| first.trim().parse().ok())
        .or_else(|| header("x-real-ip").and_then(|v| v.trim().parse().ok()))
}
