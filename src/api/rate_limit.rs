//! Per-client fixed-window rate limiting.
//!
//! Clients are keyed by peer address. `X-Forwarded-For` is only honoured when the limiter
//! trusts its proxy. The number of tracked clients is capped; when the table is full,
//! expired windows are swept and unknown clients are refused until room frees up.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::Request,
    middleware::Next,
    response::{IntoResponse, Response},
};
use tokio::sync::Mutex;

use super::error::ApiError;
use super::routes::AppState;

/// Default cap on tracked clients.
pub const MAX_TRACKED_CLIENTS: usize = 10_000;

/// Minimum gap between sweeps of a full table.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

struct Window {
    started: Instant,
    count: usize,
}

struct Windows {
    entries: HashMap<String, Window>,
    last_sweep: Option<Instant>,
}

pub struct RateLimiter {
    windows: Mutex<Windows>,
    max_requests: usize,
    window: Duration,
    max_clients: usize,
    trust_proxy: bool,
}

impl RateLimiter {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            windows: Mutex::new(Windows {
                entries: HashMap::new(),
                last_sweep: None,
            }),
            max_requests,
            window,
            max_clients: MAX_TRACKED_CLIENTS,
            trust_proxy: false,
        }
    }

    /// Key clients on the first `X-Forwarded-For` hop when set.
    pub fn trust_proxy(mut self, trust: bool) -> Self {
        self.trust_proxy = trust;
        self
    }

    pub fn max_clients(mut self, max_clients: usize) -> Self {
        self.max_clients = max_clients.max(1);
        self
    }

    /// Count a request for `key`. Returns false once the key is over its limit.
    pub async fn check(&self, key: &str) -> bool {
        self.check_at(key, Instant::now()).await
    }

    async fn check_at(&self, key: &str, now: Instant) -> bool {
        let mut windows = self.windows.lock().await;

        if !windows.entries.contains_key(key) && windows.entries.len() >= self.max_clients {
            let due = windows
                .last_sweep
                .map_or(true, |last| now.duration_since(last) >= SWEEP_INTERVAL);
            if due {
                let window = self.window;
                windows
                    .entries
                    .retain(|_, w| now.duration_since(w.started) < window);
                windows.last_sweep = Some(now);
            }
            if windows.entries.len() >= self.max_clients {
                return false;
            }
        }

        let entry = windows.entries.entry(key.to_string()).or_insert(Window {
            started: now,
            count: 0,
        });
        if now.duration_since(entry.started) >= self.window {
            entry.started = now;
            entry.count = 0;
        }

        if entry.count >= self.max_requests {
            false
        } else {
            entry.count += 1;
            true
        }
    }

    #[cfg(test)]
    async fn tracked(&self) -> usize {
        self.windows.lock().await.entries.len()
    }

    /// Client key: the peer address, or the first `X-Forwarded-For` hop behind a trusted proxy.
    fn client_key(&self, req: &Request<Body>) -> String {
        if self.trust_proxy {
            if let Some(forwarded) = req
                .headers()
                .get("x-forwarded-for")
                .and_then(|h| h.to_str().ok())
                .and_then(|v| v.split(',').next())
                .map(str::trim)
                .filter(|v| !v.is_empty())
            {
                return forwarded.to_string();
            }
        }
        req.extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string())
            .unwrap_or_else(|| "unknown".to_string())
    }
}

pub async fn rate_limit(
    State(state): State<Arc<AppState>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let key = state.rate_limiter.client_key(&req);
    if !state.rate_limiter.check(&key).await {
        tracing::warn!(client = %key, "Rate limit exceeded");
        return ApiError::RateLimited.into_response();
    }
    next.run(req).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_from(peer: [u8; 4], forwarded: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder();
        if let Some(forwarded) = forwarded {
            builder = builder.header("x-forwarded-for", forwarded);
        }
        let mut req = builder.body(Body::empty()).unwrap();
        req.extensions_mut()
            .insert(ConnectInfo(SocketAddr::from((peer, 4000))));
        req
    }

    #[tokio::test]
    async fn test_limit_then_reset_after_window() {
        let limiter = RateLimiter::new(2, Duration::from_secs(60));
        let t0 = Instant::now();

        assert!(limiter.check_at("a", t0).await);
        assert!(limiter.check_at("a", t0).await);
        assert!(!limiter.check_at("a", t0).await);
        // Other clients have their own window
        assert!(limiter.check_at("b", t0).await);

        let later = t0 + Duration::from_secs(61);
        assert!(limiter.check_at("a", later).await);
    }

    #[test]
    fn test_forwarded_for_ignored_unless_trusted() {
        let limiter = RateLimiter::new(2, Duration::from_secs(60));
        let req = request_from([127, 0, 0, 1], Some("203.0.113.7, 10.0.0.1"));
        assert_eq!(limiter.client_key(&req), "127.0.0.1");

        let trusting = RateLimiter::new(2, Duration::from_secs(60)).trust_proxy(true);
        assert_eq!(trusting.client_key(&req), "203.0.113.7");
        let req = request_from([127, 0, 0, 1], None);
        assert_eq!(trusting.client_key(&req), "127.0.0.1");

        let req = Request::builder().body(Body::empty()).unwrap();
        assert_eq!(limiter.client_key(&req), "unknown");
    }

    #[tokio::test]
    async fn test_rotating_forwarded_for_shares_peer_window() {
        let limiter = RateLimiter::new(2, Duration::from_secs(60));
        let mut allowed = 0;
        for i in 0..500u32 {
            let forwarded = format!("198.51.{}.{}", i / 256, i % 256);
            let req = request_from([192, 0, 2, 9], Some(&forwarded));
            if limiter.check(&limiter.client_key(&req)).await {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 2);
        assert_eq!(limiter.tracked().await, 1);
    }

    #[tokio::test]
    async fn test_tracked_clients_are_capped() {
        let limiter = RateLimiter::new(5, Duration::from_secs(60)).max_clients(3);
        let t0 = Instant::now();

        for key in ["a", "b", "c"] {
            assert!(limiter.check_at(key, t0).await);
        }
        // Table full of live windows: new clients are refused, known ones still counted
        assert!(!limiter.check_at("d", t0).await);
        assert!(limiter.check_at("a", t0).await);
        assert_eq!(limiter.tracked().await, 3);

        // Once the windows expire a sweep makes room
        let later = t0 + Duration::from_secs(61);
        assert!(limiter.check_at("d", later).await);
        assert_eq!(limiter.tracked().await, 1);
    }

    #[tokio::test]
    async fn test_sweep_is_throttled_when_full() {
        let limiter = RateLimiter::new(5, Duration::from_millis(500)).max_clients(1);
        let t0 = Instant::now();

        assert!(limiter.check_at("a", t0).await);
        // Sweeps at t0 and finds nothing expired
        assert!(!limiter.check_at("b", t0).await);
        // `a` has expired, but the last sweep was too recent to run another
        let t1 = t0 + Duration::from_millis(600);
        assert!(!limiter.check_at("b", t1).await);
        assert!(limiter.check_at("b", t0 + SWEEP_INTERVAL).await);
    }
}
