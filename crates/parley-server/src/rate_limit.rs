//! Token-bucket rate limiting: one bucket per client IP on the REST routes
//! and one per WebSocket connection for inbound frames.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{ConnectInfo, State};
use axum::http::Request;
use axum::middleware::Next;
use axum::response::Response;
use tokio::sync::Mutex;
use tracing::warn;

use crate::error::ServerError;

#[derive(Debug, Clone)]
pub struct TokenBucket {
    rate: f64,
    capacity: f64,
    tokens: f64,
    touched: Instant,
}

impl TokenBucket {
    /// Full bucket of `capacity` tokens refilling at `rate` per second.
    pub fn new(rate: f64, capacity: f64) -> Self {
        Self {
            rate,
            capacity,
            tokens: capacity,
            touched: Instant::now(),
        }
    }

    fn take_at(&mut self, now: Instant) -> bool {
        let refill = now.saturating_duration_since(self.touched).as_secs_f64() * self.rate;
        self.tokens = (self.tokens + refill).min(self.capacity);
        self.touched = now;
        if self.tokens < 1.0 {
            return false;
        }
        self.tokens -= 1.0;
        true
    }

    /// Spend one token if there is one.
    pub fn try_consume(&mut self) -> bool {
        self.take_at(Instant::now())
    }

    fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.touched)
    }
}

/// Buckets keyed by client IP, shared across requests.
#[derive(Clone)]
pub struct RateLimiter {
    per_ip: Arc<Mutex<HashMap<IpAddr, TokenBucket>>>,
    rate: f64,
    capacity: f64,
}

impl RateLimiter {
    pub fn new(rate: f64, capacity: f64) -> Self {
        Self {
            per_ip: Arc::new(Mutex::new(HashMap::new())),
            rate,
            capacity,
        }
    }

    /// Independent bucket with the same limits, for one socket.
    pub fn bucket(&self) -> TokenBucket {
        TokenBucket::new(self.rate, self.capacity)
    }

    pub async fn check(&self, ip: IpAddr) -> bool {
        let mut per_ip = self.per_ip.lock().await;
        per_ip
            .entry(ip)
            .or_insert_with(|| self.bucket())
            .try_consume()
    }

    /// Forget IPs not seen for `max_idle`. Returns how many were dropped.
    pub async fn purge_stale(&self, max_idle: Duration) -> usize {
        let now = Instant::now();
        let mut per_ip = self.per_ip.lock().await;
        let before = per_ip.len();
        per_ip.retain(|_, bucket| bucket.idle_for(now) < max_idle);
        before - per_ip.len()
    }

    pub async fn tracked(&self) -> usize {
        self.per_ip.lock().await.len()
    }
}

pub async fn rate_limit_middleware(
    State(limiter): State<RateLimiter>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, ServerError> {
    // Requests with no identifiable origin are let through.
    if let Some(ip) = client_ip(&req) {
        if !limiter.check(ip).await {
            warn!(%ip, path = %req.uri().path(), "rate limited");
            return Err(ServerError::RateLimited);
        }
    }
    Ok(next.run(req).await)
}

/// Peer address of the TCP connection, else the first `X-Forwarded-For`
/// hop, else `X-Real-IP`.
pub(crate) fn client_ip<B>(req: &Request<B>) -> Option<IpAddr> {
    if let Some(ConnectInfo(addr)) = req.extensions().get::<ConnectInfo<SocketAddr>>() {
        return Some(addr.ip());
    }
    ["x-forwarded-for", "x-real-ip"].iter().find_map(|name| {
        req.headers()
            .get(*name)?
            .to_str()
            .ok()?
            .split(',')
            .next()?
            .trim()
            .parse()
            .ok()
    })
}
