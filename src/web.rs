//! HTTP surface for the device authorization flow.
//!
//! Every route goes through the rate-limit middleware; allowed responses
//! carry the remaining-token headers, throttled ones get 429 + retry-after.
//! Authenticated routes resolve the caller from a bearer session token.
use crate::errors::LodestarError;
use crate::flow::{DeviceFlow, PollOutcome};
use crate::rate_limit::{EndpointClass, RateLimiter};
use crate::settings::Settings;
use crate::storage::Device;
use crate::token::{Claims, TokenCodec};
use axum::body::Body;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use miette::IntoDiagnostic;
use sea_orm::DatabaseConnection;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub codec: TokenCodec,
    pub flow: DeviceFlow,
    pub limiter: RateLimiter,
}

impl IntoResponse for LodestarError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            LodestarError::NotFound => (StatusCode::NOT_FOUND, self.to_string()),
            LodestarError::Expired => (StatusCode::GONE, self.to_string()),
            LodestarError::Conflict => (StatusCode::CONFLICT, self.to_string()),
            LodestarError::Forbidden => (StatusCode::FORBIDDEN, self.to_string()),
            LodestarError::InvalidInput(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            LodestarError::RateLimited => (StatusCode::TOO_MANY_REQUESTS, self.to_string()),
            LodestarError::TokenInvalid => (StatusCode::UNAUTHORIZED, self.to_string()),
            _ => {
                tracing::error!(error = %self, "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}

// Security headers middleware
async fn security_headers(request: Request<Body>, next: Next) -> impl IntoResponse {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();

    headers.insert(
        HeaderName::from_static("x-frame-options"),
        HeaderValue::from_static("DENY"),
    );
    headers.insert(
        HeaderName::from_static("x-content-type-options"),
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(
        HeaderName::from_static("content-security-policy"),
        HeaderValue::from_static("default-src 'none'; frame-ancestors 'none'"),
    );
    headers.insert(
        HeaderName::from_static("referrer-policy"),
        HeaderValue::from_static("strict-origin-when-cross-origin"),
    );

    response
}

/// Admission control. The caller key is the authenticated user when the
/// request carries a valid session token, the client address otherwise.
async fn rate_limit(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if !state.limiter.enabled() {
        return next.run(request).await;
    }

    let class = EndpointClass::classify(request.method().as_str(), request.uri().path());
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0);
    let key = request_key(&state.codec, request.headers(), peer);

    let decision = state.limiter.try_consume(&key, class, 1);
    if !decision.allowed {
        let mut response = LodestarError::RateLimited.into_response();
        if let Ok(v) = HeaderValue::from_str(&decision.retry_after_secs().to_string()) {
            response
                .headers_mut()
                .insert(HeaderName::from_static("retry-after"), v);
        }
        return response;
    }

    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    if let Ok(v) = HeaderValue::from_str(&decision.remaining.to_string()) {
        headers.insert(HeaderName::from_static("x-rate-limit-remaining"), v);
    }
    if let Ok(v) = HeaderValue::from_str(&decision.limit.to_string()) {
        headers.insert(HeaderName::from_static("x-rate-limit-limit"), v);
    }
    response
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(|s| s.to_string())
}

/// Resolve the authenticated principal from the Authorization header
fn bearer_principal(codec: &TokenCodec, headers: &HeaderMap) -> Result<Claims, LodestarError> {
    let token = bearer_token(headers).ok_or(LodestarError::TokenInvalid)?;
    codec.validate(&token)
}

fn request_key(codec: &TokenCodec, headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    if let Ok(claims) = bearer_principal(codec, headers) {
        return format!("user:{}", claims.subject);
    }

    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.split(',').next())
        .map(str::trim)
        .filter(|s| !s.is_empty());

    match forwarded {
        Some(ip) => format!("ip:{}", ip),
        None => match peer {
            Some(addr) => format!("ip:{}", addr.ip()),
            None => "ip:unknown".to_string(),
        },
    }
}

pub async fn serve(settings: Settings, db: DatabaseConnection) -> miette::Result<()> {
    let codec = TokenCodec::new(&settings.token);
    let flow = DeviceFlow::new(db, codec.clone(), settings.device_auth.clone());
    let limiter = RateLimiter::new(settings.rate_limit.clone());

    let state = AppState {
        settings: Arc::new(settings),
        codec,
        flow,
        limiter,
    };

    let router = router(state.clone());

    let addr: SocketAddr = state
        .settings
        .listen_addr()
        .parse()
        .map_err(|e| miette::miette!("bad listen addr: {e}"))?;

    tracing::info!(%addr, "Device authorization API listening");
    let listener = tokio::net::TcpListener::bind(addr).await.into_diagnostic()?;
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .into_diagnostic()?;
    Ok(())
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/auth/device", post(initiate_device_auth))
        .route("/api/auth/device/token", post(device_poll_for_token))
        .route("/api/auth/device/confirm", post(confirm_device_auth))
        .route("/api/auth/device/status/has-devices", get(has_active_devices))
        .route("/api/auth/device/status/{device_code}", get(get_device_status))
        .route("/api/auth/device/devices", get(get_user_devices))
        .route("/api/auth/device/cleanup", post(cleanup_expired_devices))
        .route("/api/auth/device/{device_id}", delete(revoke_device))
        .layer(middleware::from_fn_with_state(state.clone(), rate_limit))
        .layer(middleware::from_fn(security_headers))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeviceAuthRequest {
    device_name: Option<String>,
    device_type: Option<String>,
    device_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DeviceAuthResponse {
    device_code: String,
    user_code: String,
    verification_url: String,
    expires_in: i64,
    interval: u64,
}

/// POST /api/auth/device - start the flow for an unattended client
async fn initiate_device_auth(
    State(state): State<AppState>,
    Json(req): Json<DeviceAuthRequest>,
) -> Result<Json<DeviceAuthResponse>, LodestarError> {
    let device_name = req
        .device_name
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| LodestarError::InvalidInput("deviceName required".to_string()))?;
    let device_type = req.device_type.as_deref().unwrap_or("unknown");
    let device_id = req.device_id.as_deref().unwrap_or_default();

    let grant = state
        .flow
        .initiate(device_name, device_type, device_id)
        .await?;

    Ok(Json(DeviceAuthResponse {
        device_code: grant.device_code,
        user_code: grant.user_code,
        verification_url: grant.verification_url,
        expires_in: grant.expires_in,
        interval: grant.interval,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeviceCodeRequest {
    device_code: String,
}

/// POST /api/auth/device/token - poll until the session is handed out
async fn device_poll_for_token(
    State(state): State<AppState>,
    Json(req): Json<DeviceCodeRequest>,
) -> Response {
    match state.flow.poll(&req.device_code).await {
        Ok(PollOutcome::Approved { access_token }) => {
            (StatusCode::OK, Json(json!({ "accessToken": access_token }))).into_response()
        }
        Ok(PollOutcome::Pending) => {
            (StatusCode::ACCEPTED, Json(json!({ "status": "pending" }))).into_response()
        }
        Ok(PollOutcome::Claimed) => (
            StatusCode::CONFLICT,
            Json(json!({
                "status": "claimed",
                "error": "A session was already issued for this device code"
            })),
        )
            .into_response(),
        Ok(PollOutcome::Expired) | Ok(PollOutcome::NotFound) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "Device code not found or expired" })),
        )
            .into_response(),
        Err(e) => e.into_response(),
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DeviceConfirmResponse {
    device_id: String,
    device_name: String,
    status: String,
}

/// POST /api/auth/device/confirm - called by the web app after user login.
/// Approves the code; the session itself is handed out to the poller.
async fn confirm_device_auth(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<DeviceCodeRequest>,
) -> Result<Json<DeviceConfirmResponse>, LodestarError> {
    let principal = bearer_principal(&state.codec, &headers)?;

    let device = state
        .flow
        .confirm(&req.device_code, &principal.subject, &principal.email)
        .await?;

    Ok(Json(DeviceConfirmResponse {
        device_id: device.device_id,
        device_name: device.device_name,
        status: device.status,
    }))
}

/// GET /api/auth/device/status/{device_code}
async fn get_device_status(
    State(state): State<AppState>,
    Path(device_code): Path<String>,
) -> Result<Json<Value>, LodestarError> {
    let status = state.flow.status(&device_code).await?;
    Ok(Json(json!({ "status": status })))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DeviceView {
    id: String,
    device_name: String,
    device_type: String,
    device_id: String,
    status: String,
    active: bool,
    last_seen_at: Option<i64>,
    created_at: i64,
}

// The device_code stays server-side; it is a secret, not display data.
impl From<Device> for DeviceView {
    fn from(d: Device) -> Self {
        DeviceView {
            id: d.id,
            device_name: d.device_name,
            device_type: d.device_type,
            device_id: d.device_id,
            status: d.status,
            active: d.active == 1,
            last_seen_at: d.last_seen_at,
            created_at: d.created_at,
        }
    }
}

/// GET /api/auth/device/devices - the caller's connected devices
async fn get_user_devices(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<DeviceView>>, LodestarError> {
    let principal = bearer_principal(&state.codec, &headers)?;

    let devices = state.flow.list_devices(&principal.subject).await?;
    Ok(Json(devices.into_iter().map(DeviceView::from).collect()))
}

/// GET /api/auth/device/status/has-devices
async fn has_active_devices(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Json<Value> {
    // An anonymous caller definitely has no connected devices
    let principal = match bearer_principal(&state.codec, &headers) {
        Ok(p) => p,
        Err(_) => return Json(json!({ "hasDevices": false })),
    };

    match state.flow.has_active_devices(&principal.subject).await {
        Ok(has_devices) => Json(json!({ "hasDevices": has_devices })),
        Err(_) => Json(json!({ "hasDevices": false })),
    }
}

/// DELETE /api/auth/device/{device_id}
async fn revoke_device(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(device_id): Path<String>,
) -> Result<Json<Value>, LodestarError> {
    let principal = bearer_principal(&state.codec, &headers)?;

    if state.flow.revoke(&device_id, &principal.subject).await? {
        Ok(Json(json!({ "message": "Device revoked successfully" })))
    } else {
        Err(LodestarError::Conflict)
    }
}

/// POST /api/auth/device/cleanup - administrative sweep of expired records
async fn cleanup_expired_devices(
    State(state): State<AppState>,
) -> Result<Json<Value>, LodestarError> {
    let removed = state.flow.cleanup().await?;
    Ok(Json(json!({
        "message": "Expired devices cleaned up",
        "removed": removed
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::Token as TokenCfg;

    fn codec() -> TokenCodec {
        TokenCodec::new(&TokenCfg {
            secret: "web-test-secret-key-0123456789abc".to_string(),
            ttl_secs: 3600,
        })
    }

    fn headers_with_bearer(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", token)).unwrap(),
        );
        headers
    }

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(
            LodestarError::NotFound.into_response().status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            LodestarError::Expired.into_response().status(),
            StatusCode::GONE
        );
        assert_eq!(
            LodestarError::Conflict.into_response().status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            LodestarError::Forbidden.into_response().status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            LodestarError::InvalidInput("x".to_string())
                .into_response()
                .status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            LodestarError::RateLimited.into_response().status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            LodestarError::TokenInvalid.into_response().status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            LodestarError::Other("boom".to_string())
                .into_response()
                .status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_bearer_principal_round_trip() {
        let codec = codec();
        let token = codec.issue("user-1", "u1@example.com").expect("issue");

        let claims =
            bearer_principal(&codec, &headers_with_bearer(&token)).expect("expected principal");
        assert_eq!(claims.subject, "user-1");
        assert_eq!(claims.email, "u1@example.com");
    }

    #[test]
    fn test_bearer_principal_rejects_missing_and_malformed() {
        let codec = codec();

        assert!(matches!(
            bearer_principal(&codec, &HeaderMap::new()),
            Err(LodestarError::TokenInvalid)
        ));
        assert!(matches!(
            bearer_principal(&codec, &headers_with_bearer("garbage")),
            Err(LodestarError::TokenInvalid)
        ));

        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_static("Basic dXNlcjpwYXNz"),
        );
        assert!(matches!(
            bearer_principal(&codec, &headers),
            Err(LodestarError::TokenInvalid)
        ));
    }

    #[test]
    fn test_request_key_prefers_principal() {
        let codec = codec();
        let token = codec.issue("user-42", "u42@example.com").expect("issue");

        assert_eq!(
            request_key(&codec, &headers_with_bearer(&token), None),
            "user:user-42"
        );
    }

    #[test]
    fn test_request_key_falls_back_to_forwarded_ip_then_peer() {
        let codec = codec();

        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_static("x-forwarded-for"),
            HeaderValue::from_static("203.0.113.7, 10.0.0.1"),
        );
        let peer: SocketAddr = "192.0.2.1:54321".parse().unwrap();

        // The first forwarded hop wins over the peer address
        assert_eq!(
            request_key(&codec, &headers, Some(peer)),
            "ip:203.0.113.7"
        );
        assert_eq!(
            request_key(&codec, &HeaderMap::new(), Some(peer)),
            "ip:192.0.2.1"
        );
        assert_eq!(request_key(&codec, &HeaderMap::new(), None), "ip:unknown");
    }
}
