//! Rate-limit decorator for HTTP handlers.
//!
//! [`RateLimitLayer`] wraps a handler in a [`RateLimitService`] holding the
//! limiter, the outcome recorder and the wrapped service. Each request is
//! keyed by caller identity and either forwarded, answered with 429 when the
//! quota is spent, or answered with 503 when the store is down and the
//! limiter fails closed.

use std::net::SocketAddr;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::extract::{ConnectInfo, Request};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::future::BoxFuture;
use tower::{Layer, Service};
use tracing::debug;

use super::identity::{client_identity, rate_limit_key};
use crate::metrics::{Outcome, OutcomeRecorder};
use crate::ratelimit::{Decision, WindowLimiter};

/// A request refused by policy. Distinct from infrastructure failure: the
/// caller may retry once the window has moved on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaExceeded {
    pub retry_after: Duration,
}

impl IntoResponse for QuotaExceeded {
    fn into_response(self) -> Response {
        let secs = self.retry_after.as_secs().max(1);
        let mut response = (StatusCode::TOO_MANY_REQUESTS, "Too Many Requests").into_response();
        response
            .headers_mut()
            .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        response
    }
}

/// A request refused because the window store could not be consulted and the
/// limiter fails closed. Not a quota decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreUnavailable;

impl IntoResponse for StoreUnavailable {
    fn into_response(self) -> Response {
        (StatusCode::SERVICE_UNAVAILABLE, "Service Unavailable").into_response()
    }
}

/// Applies the window limiter to every request of the wrapped service.
#[derive(Clone)]
pub struct RateLimitLayer {
    limiter: Arc<WindowLimiter>,
    recorder: Arc<dyn OutcomeRecorder>,
    key_prefix: Arc<str>,
}

impl RateLimitLayer {
    pub fn new(
        limiter: Arc<WindowLimiter>,
        recorder: Arc<dyn OutcomeRecorder>,
        key_prefix: impl Into<Arc<str>>,
    ) -> Self {
        Self {
            limiter,
            recorder,
            key_prefix: key_prefix.into(),
        }
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            limiter: Arc::clone(&self.limiter),
            recorder: Arc::clone(&self.recorder),
            key_prefix: Arc::clone(&self.key_prefix),
        }
    }
}

#[derive(Clone)]
pub struct RateLimitService<S> {
    inner: S,
    limiter: Arc<WindowLimiter>,
    recorder: Arc<dyn OutcomeRecorder>,
    key_prefix: Arc<str>,
}

impl<S> Service<Request> for RateLimitService<S>
where
    S: Service<Request, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Response, S::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request) -> Self::Future {
        // the readied service handles this request; keep a fresh clone for the next
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let limiter = Arc::clone(&self.limiter);
        let recorder = Arc::clone(&self.recorder);
        let key_prefix = Arc::clone(&self.key_prefix);

        Box::pin(async move {
            let peer = request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| *addr);
            let key = rate_limit_key(&key_prefix, &client_identity(request.headers(), peer));

            match limiter.check(&key).await {
                Decision::Admitted => {}
                Decision::Denied => {
                    recorder.record(Outcome::Blocked);
                    debug!(key = %key, "Request blocked");
                    let rejection = QuotaExceeded {
                        retry_after: limiter.policy().window(),
                    };
                    return Ok(rejection.into_response());
                }
                Decision::Unavailable { allowed: true, .. } => {
                    recorder.record_store_failure();
                }
                Decision::Unavailable { allowed: false, .. } => {
                    recorder.record_store_failure();
                    debug!(key = %key, "Request refused, window store unavailable");
                    return Ok(StoreUnavailable.into_response());
                }
            }

            recorder.record(Outcome::Allowed);
            inner.call(request).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::routing::get;
    use axum::Router;
    use tower::ServiceExt;

    use crate::metrics::{NoopRecorder, PrometheusRecorder};
    use crate::ratelimit::{FailurePolicy, MemoryWindowStore, WindowPolicy, WindowStore};

    fn limited_router(limit: u64, recorder: Arc<dyn OutcomeRecorder>) -> Router {
        let limiter = Arc::new(WindowLimiter::new(
            Arc::new(MemoryWindowStore::new()),
            WindowPolicy::new(limit, Duration::from_secs(60)),
        ));
        Router::new()
            .route("/", get(|| async { "ok" }))
            .route_layer(RateLimitLayer::new(limiter, recorder, "limit:"))
    }

    fn request_from(ip: &str) -> Request {
        axum::http::Request::builder()
            .uri("/")
            .header("x-forwarded-for", ip)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_blocks_after_limit_with_retry_after() {
        let recorder = Arc::new(PrometheusRecorder::new().unwrap());
        let router = limited_router(2, recorder.clone());

        for _ in 0..2 {
            let response = router.clone().oneshot(request_from("10.0.0.1")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let response = router.clone().oneshot(request_from("10.0.0.1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "60");

        assert_eq!(recorder.count(Outcome::Allowed), 2);
        assert_eq!(recorder.count(Outcome::Blocked), 1);
        assert_eq!(recorder.store_failures(), 0);
    }

    #[tokio::test]
    async fn test_callers_are_limited_independently() {
        let router = limited_router(1, Arc::new(NoopRecorder));

        let first = router.clone().oneshot(request_from("10.0.0.1")).await.unwrap();
        let second = router.clone().oneshot(request_from("10.0.0.2")).await.unwrap();
        let repeat = router.clone().oneshot(request_from("10.0.0.1")).await.unwrap();

        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(second.status(), StatusCode::OK);
        assert_eq!(repeat.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn test_closed_store_fails_open_and_counts_failure() {
        let store = Arc::new(MemoryWindowStore::new());
        store.close().await.unwrap();
        let limiter = Arc::new(WindowLimiter::new(
            store,
            WindowPolicy::new(0, Duration::from_secs(60)),
        ));
        let recorder = Arc::new(PrometheusRecorder::new().unwrap());
        let router = Router::new()
            .route("/", get(|| async { "ok" }))
            .route_layer(RateLimitLayer::new(limiter, recorder.clone(), "limit:"));

        let response = router.oneshot(request_from("10.0.0.1")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(recorder.count(Outcome::Allowed), 1);
        assert_eq!(recorder.store_failures(), 1);
    }

    #[tokio::test]
    async fn test_closed_store_fail_closed_answers_503() {
        let store = Arc::new(MemoryWindowStore::new());
        store.close().await.unwrap();
        let limiter = Arc::new(
            WindowLimiter::new(store, WindowPolicy::new(5, Duration::from_secs(60)))
                .with_failure_policy(FailurePolicy::Closed),
        );
        let recorder = Arc::new(PrometheusRecorder::new().unwrap());
        let router = Router::new()
            .route("/", get(|| async { "ok" }))
            .route_layer(RateLimitLayer::new(limiter, recorder.clone(), "limit:"));

        let response = router.oneshot(request_from("10.0.0.1")).await.unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(response.headers().get(header::RETRY_AFTER).is_none());
        assert_eq!(recorder.count(Outcome::Blocked), 0);
        assert_eq!(recorder.count(Outcome::Allowed), 0);
        assert_eq!(recorder.store_failures(), 1);
    }

    #[test]
    fn test_quota_exceeded_rounds_retry_after_up() {
        let response = QuotaExceeded {
            retry_after: Duration::from_millis(200),
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "1");
    }
}
