//! Rate limit HTTP handlers and middleware.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Path, Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use tracing::{debug, info, instrument, warn};

use crate::ratelimit::{LimitConfig, RateLimitDecision, RateLimiterBackend};

/// Header carrying the configured quota.
pub const LIMIT_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-limit");
/// Header carrying the quota left in the window.
pub const REMAINING_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-remaining");

/// Build the service router around a rate limiter.
pub fn router<R: RateLimiterBackend + 'static>(rate_limiter: Arc<R>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/limits/{identifier}/check", post(check_limit::<R>))
        .route("/v1/limits/{identifier}", delete(reset_limit::<R>))
        .with_state(rate_limiter)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

fn insert_quota_headers(headers: &mut HeaderMap, limits: &LimitConfig, decision: &RateLimitDecision) {
    headers.insert(LIMIT_HEADER, HeaderValue::from(limits.max_requests()));
    headers.insert(REMAINING_HEADER, HeaderValue::from(decision.remaining));
}

/// Map a decision to 200 or 429 with quota headers and a JSON body.
pub fn decision_response(limits: &LimitConfig, decision: RateLimitDecision) -> Response {
    let status = if decision.allowed {
        StatusCode::OK
    } else {
        StatusCode::TOO_MANY_REQUESTS
    };

    let mut response = (status, Json(decision)).into_response();
    insert_quota_headers(response.headers_mut(), limits, &decision);
    if !decision.allowed {
        response.headers_mut().insert(
            axum::http::header::RETRY_AFTER,
            HeaderValue::from(decision.retry_after_secs()),
        );
    }
    response
}

/// Determine whether the request for `identifier` is admitted.
#[instrument(skip_all, fields(identifier = %identifier))]
async fn check_limit<R: RateLimiterBackend + 'static>(
    State(rate_limiter): State<Arc<R>>,
    Path(identifier): Path<String>,
) -> Response {
    if identifier.trim().is_empty() {
        warn!("Received rate limit check with blank identifier");
        return error_response(StatusCode::BAD_REQUEST, "identifier is required");
    }

    let decision = rate_limiter.check_limit(&identifier).await;

    debug!(
        allowed = decision.allowed,
        remaining = decision.remaining,
        "Rate limit decision made"
    );

    decision_response(rate_limiter.limits(), decision)
}

/// Administrative reset of one identifier's quota.
#[instrument(skip_all, fields(identifier = %identifier))]
async fn reset_limit<R: RateLimiterBackend + 'static>(
    State(rate_limiter): State<Arc<R>>,
    Path(identifier): Path<String>,
) -> Response {
    match rate_limiter.reset(&identifier).await {
        Ok(()) => {
            info!("Rate limit reset");
            StatusCode::NO_CONTENT.into_response()
        }
        Err(e) => error_response(StatusCode::SERVICE_UNAVAILABLE, &e.to_string()),
    }
}

/// Derive the caller identifier for a request.
///
/// Order: `x-api-key`, first hop of `x-forwarded-for`, `x-real-ip`, the
/// connection address, then `"unknown"`.
pub fn client_identifier(addr: Option<SocketAddr>, headers: &HeaderMap) -> String {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
    };

    if let Some(key) = header("x-api-key") {
        return format!("key:{}", key);
    }

    if let Some(ip) = header("x-forwarded-for")
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
    {
        return ip.to_string();
    }

    if let Some(ip) = header("x-real-ip") {
        return ip.to_string();
    }

    addr.map(|a| a.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Middleware that rejects over-quota callers with 429.
///
/// Install with `axum::middleware::from_fn_with_state(limiter, enforce_rate_limit::<R>)`.
pub async fn enforce_rate_limit<R: RateLimiterBackend + 'static>(
    State(rate_limiter): State<Arc<R>>,
    request: Request,
    next: Next,
) -> Response {
    let addr = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let identifier = client_identifier(addr, request.headers());
    let decision = rate_limiter.check_limit(&identifier).await;

    if !decision.allowed {
        debug!(identifier = %identifier, path = %request.uri().path(), "Rejecting over-quota request");
        let mut response = (
            StatusCode::TOO_MANY_REQUESTS,
            Json(serde_json::json!({
                "error": "Rate limit exceeded",
                "retry_after": decision.retry_after_secs(),
            })),
        )
            .into_response();
        insert_quota_headers(response.headers_mut(), rate_limiter.limits(), &decision);
        response.headers_mut().insert(
            axum::http::header::RETRY_AFTER,
            HeaderValue::from(decision.retry_after_secs()),
        );
        return response;
    }

    let mut response = next.run(request).await;
    insert_quota_headers(response.headers_mut(), rate_limiter.limits(), &decision);
    response
}
