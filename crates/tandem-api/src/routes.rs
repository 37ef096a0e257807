use std::sync::Arc;

use axum::extract::{Path, Query, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tandem_core::models::Device;
use tandem_core::remote::{
    MemoryBackend, PullResponse, PushRequest, PushResult, PushStatus, IDEMPOTENCY_KEY_HEADER,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::auth::{AuthenticatedAccount, TokenAuthenticator};
use crate::config::AppConfig;
use crate::error::AppError;
use crate::rate_limit::{account_fingerprint, AccountRateLimiter, RateLimitMetricsSnapshot};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    backend: Arc<MemoryBackend>,
    authenticator: Arc<TokenAuthenticator>,
    rate_limiter: Arc<AccountRateLimiter>,
}

impl AppState {
    pub fn from_config(config: Arc<AppConfig>) -> Self {
        let max_payload_bytes = config.max_payload_bytes;
        let backend = MemoryBackend::new().with_validator(move |op| {
            let size = op
                .payload
                .as_ref()
                .map_or(0, |payload| payload.to_string().len());
            if size > max_payload_bytes {
                Err(format!(
                    "payload is {size} bytes; the limit is {max_payload_bytes}"
                ))
            } else {
                Ok(())
            }
        });
        Self {
            backend: Arc::new(backend),
            authenticator: Arc::new(TokenAuthenticator::from_config(&config)),
            rate_limiter: Arc::new(AccountRateLimiter::from_config(&config)),
            config,
        }
    }
}

pub fn app_router(state: AppState) -> Router {
    let protected_routes = Router::new()
        .route("/sync/push", post(push))
        .route("/sync/pull", get(pull))
        .route("/devices", post(register_device).get(list_devices))
        .route("/devices/{device_id}/primary", post(set_primary_device))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .route("/healthz", get(healthz))
        .nest("/v1", protected_routes)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_headers(Any)
                .allow_methods(Any),
        )
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp: i64,
    rate_limit: RateLimitMetricsSnapshot,
}

async fn healthz(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        timestamp: Utc::now().timestamp(),
        rate_limit: state.rate_limiter.metrics_snapshot(),
    })
}

async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let account = state.authenticator.authenticate(request.headers())?;
    state.rate_limiter.check(&account.account_id).await?;
    request.extensions_mut().insert(account);
    Ok(next.run(request).await)
}

async fn push(
    State(state): State<AppState>,
    Extension(account): Extension<AuthenticatedAccount>,
    headers: HeaderMap,
    Json(request): Json<PushRequest>,
) -> Result<Json<Vec<PushResult>>, AppError> {
    validate_push(&request, &headers, state.config.max_push_batch)?;

    let results = state.backend.push(&account.account_id, &request.operations);
    let count = |status: PushStatus| results.iter().filter(|r| r.status == status).count();
    tracing::info!(
        endpoint = "sync_push",
        account = account_fingerprint(&account.account_id),
        accepted = count(PushStatus::Accepted),
        conflicts = count(PushStatus::Conflict),
        rejected = count(PushStatus::Rejected),
        "Applied push batch"
    );
    Ok(Json(results))
}

fn validate_push(
    request: &PushRequest,
    headers: &HeaderMap,
    max_batch: usize,
) -> Result<(), AppError> {
    if request.operations.is_empty() {
        return Err(AppError::bad_request("push batch is empty"));
    }
    if request.operations.len() > max_batch {
        return Err(AppError::bad_request(format!(
            "push batch has {} operations; the limit is {max_batch}",
            request.operations.len()
        )));
    }
    if let Some(op) = request
        .operations
        .iter()
        .find(|op| op.idempotency_key.trim().is_empty() || op.entity_id.trim().is_empty())
    {
        return Err(AppError::bad_request(format!(
            "operation {} is missing an entity id or idempotency key",
            op.op_id
        )));
    }

    // A single-operation push may repeat its key in a header; both must agree.
    if let Some(header) = headers.get(IDEMPOTENCY_KEY_HEADER) {
        let header = header
            .to_str()
            .map_err(|_| AppError::bad_request("Idempotency-Key header is not valid UTF-8"))?;
        match request.operations.as_slice() {
            [single] if single.idempotency_key == header.trim() => {}
            _ => {
                return Err(AppError::bad_request(
                    "Idempotency-Key header does not match the pushed operation",
                ))
            }
        }
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
struct PullQuery {
    since: Option<String>,
}

async fn pull(
    State(state): State<AppState>,
    Extension(account): Extension<AuthenticatedAccount>,
    Query(query): Query<PullQuery>,
) -> Result<Json<PullResponse>, AppError> {
    let since = query.since.as_deref().map(str::trim).filter(|s| !s.is_empty());
    let response = state.backend.pull(&account.account_id, since)?;
    tracing::debug!(
        endpoint = "sync_pull",
        account = account_fingerprint(&account.account_id),
        changes = response.changes.len(),
        has_more = response.has_more,
        "Served pull page"
    );
    Ok(Json(response))
}

async fn register_device(
    State(state): State<AppState>,
    Extension(account): Extension<AuthenticatedAccount>,
    Json(device): Json<Device>,
) -> Result<Json<Device>, AppError> {
    if device.device_id.trim().is_empty() {
        return Err(AppError::bad_request("device_id must not be empty"));
    }
    let stored = state.backend.register_device(&account.account_id, &device);
    tracing::info!(
        endpoint = "devices_register",
        account = account_fingerprint(&account.account_id),
        platform = %stored.platform,
        is_primary = stored.is_primary,
        "Registered device"
    );
    Ok(Json(stored))
}

async fn list_devices(
    State(state): State<AppState>,
    Extension(account): Extension<AuthenticatedAccount>,
) -> Json<Vec<Device>> {
    Json(state.backend.list_devices(&account.account_id))
}

async fn set_primary_device(
    State(state): State<AppState>,
    Extension(account): Extension<AuthenticatedAccount>,
    Path(device_id): Path<String>,
) -> Result<StatusCode, AppError> {
    state
        .backend
        .set_primary_device(&account.account_id, &device_id)?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use axum::body::{to_bytes, Body};
    use axum::http::{header, Method, Request};
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::*;

    fn test_state(requests_per_window: u32) -> AppState {
        AppState::from_config(Arc::new(AppConfig {
            bind_addr: "127.0.0.1:0".to_string(),
            api_tokens: HashMap::from([
                ("tok-a".to_string(), "acct-1".to_string()),
                ("tok-b".to_string(), "acct-2".to_string()),
            ]),
            rate_limit_window: Duration::from_secs(60),
            requests_per_window,
            max_push_batch: 10,
            max_payload_bytes: 256,
        }))
    }

    fn request(
        method: Method,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn send(router: &Router, request: Request<Body>) -> (StatusCode, HeaderMap, Value) {
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, headers, body)
    }

    fn push_body(key: &str, entity_id: &str, base_version: i64, payload: Value) -> Value {
        json!({
            "operations": [{
                "op_id": "0190a5e4-0000-7000-8000-000000000001",
                "idempotency_key": key,
                "entity_type": "booking",
                "entity_id": entity_id,
                "operation": "create",
                "payload": payload,
                "base_version": base_version,
                "device_id": "dev-a"
            }]
        })
    }

    #[tokio::test]
    async fn healthz_is_public() {
        let router = app_router(test_state(10));
        let (status, _, body) = send(&router, request(Method::GET, "/healthz", None, None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn sync_routes_require_known_token() {
        let router = app_router(test_state(10));
        let (status, _, body) =
            send(&router, request(Method::GET, "/v1/sync/pull", None, None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(body["error"].as_str().unwrap().contains("Authorization"));

        let (status, _, _) = send(
            &router,
            request(Method::GET, "/v1/sync/pull", Some("nope"), None),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn push_then_pull_is_scoped_to_account() {
        let router = app_router(test_state(10));
        let (status, _, body) = send(
            &router,
            request(
                Method::POST,
                "/v1/sync/push",
                Some("tok-a"),
                Some(push_body("k1", "b1", 0, json!({"party": 2}))),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["status"], "accepted");
        assert_eq!(body[0]["new_version"], 1);

        let (_, _, page) = send(
            &router,
            request(Method::GET, "/v1/sync/pull", Some("tok-a"), None),
        )
        .await;
        assert_eq!(page["changes"].as_array().unwrap().len(), 1);
        assert_eq!(page["changes"][0]["entity_id"], "b1");
        assert_eq!(page["cursor"], "1");

        let (_, _, other) = send(
            &router,
            request(Method::GET, "/v1/sync/pull", Some("tok-b"), None),
        )
        .await;
        assert_eq!(other["changes"].as_array().unwrap().len(), 0);

        let (_, _, caught_up) = send(
            &router,
            request(Method::GET, "/v1/sync/pull?since=1", Some("tok-a"), None),
        )
        .await;
        assert_eq!(caught_up["changes"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn replayed_key_and_stale_base_version() {
        let router = app_router(test_state(10));
        let first = push_body("k1", "b1", 0, json!({"party": 2}));
        send(&router, request(Method::POST, "/v1/sync/push", Some("tok-a"), Some(first.clone())))
            .await;

        // Same key: the stored result comes back, nothing is applied twice.
        let (_, _, replay) =
            send(&router, request(Method::POST, "/v1/sync/push", Some("tok-a"), Some(first))).await;
        assert_eq!(replay[0]["status"], "accepted");
        assert_eq!(replay[0]["new_version"], 1);

        let (_, _, stale) = send(
            &router,
            request(
                Method::POST,
                "/v1/sync/push",
                Some("tok-a"),
                Some(push_body("k2", "b1", 0, json!({"party": 3}))),
            ),
        )
        .await;
        assert_eq!(stale[0]["status"], "conflict");
        assert_eq!(stale[0]["current_version"], 1);
        assert_eq!(stale[0]["current_payload"], json!({"party": 2}));
    }

    #[tokio::test]
    async fn oversized_payload_is_rejected_per_operation() {
        let router = app_router(test_state(10));
        let notes = "x".repeat(300);
        let (status, _, body) = send(
            &router,
            request(
                Method::POST,
                "/v1/sync/push",
                Some("tok-a"),
                Some(push_body("k1", "b1", 0, json!({"notes": notes}))),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["status"], "rejected");
    }

    #[tokio::test]
    async fn malformed_push_batches_are_bad_requests() {
        let router = app_router(test_state(10));
        let (status, _, _) = send(
            &router,
            request(
                Method::POST,
                "/v1/sync/push",
                Some("tok-a"),
                Some(json!({"operations": []})),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let mut mismatched = request(
            Method::POST,
            "/v1/sync/push",
            Some("tok-a"),
            Some(push_body("k1", "b1", 0, json!({}))),
        );
        mismatched
            .headers_mut()
            .insert("idempotency-key", "other".parse().unwrap());
        let (status, _, _) = send(&router, mismatched).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _, _) = send(
            &router,
            request(Method::GET, "/v1/sync/pull?since=abc", Some("tok-a"), None),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn rate_limit_returns_retry_after() {
        let router = app_router(test_state(1));
        let (status, _, _) = send(
            &router,
            request(Method::GET, "/v1/devices", Some("tok-a"), None),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, headers, _) = send(
            &router,
            request(Method::GET, "/v1/devices", Some("tok-a"), None),
        )
        .await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        let retry_after = headers[header::RETRY_AFTER].to_str().unwrap();
        assert!(retry_after.parse::<u64>().unwrap() >= 1);

        // Limits are per account.
        let (status, _, _) = send(
            &router,
            request(Method::GET, "/v1/devices", Some("tok-b"), None),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn first_device_is_primary_until_moved() {
        let router = app_router(test_state(20));
        let device = |id: &str| {
            json!({
                "device_id": id,
                "account_id": "ignored",
                "platform": "ios",
                "app_version": "3.1",
                "os_version": "17",
                "is_primary": false,
                "is_active": true,
                "registered_at": 1,
                "last_seen_at": 1
            })
        };

        let (_, _, phone) = send(
            &router,
            request(Method::POST, "/v1/devices", Some("tok-a"), Some(device("phone"))),
        )
        .await;
        assert_eq!(phone["is_primary"], true);
        assert_eq!(phone["account_id"], "acct-1");

        let (_, _, tablet) = send(
            &router,
            request(Method::POST, "/v1/devices", Some("tok-a"), Some(device("tablet"))),
        )
        .await;
        assert_eq!(tablet["is_primary"], false);

        let (status, _, _) = send(
            &router,
            request(Method::POST, "/v1/devices/tablet/primary", Some("tok-a"), None),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (_, _, devices) = send(
            &router,
            request(Method::GET, "/v1/devices", Some("tok-a"), None),
        )
        .await;
        let primaries = devices
            .as_array()
            .unwrap()
            .iter()
            .filter(|d| d["is_primary"] == true)
            .map(|d| d["device_id"].as_str().unwrap().to_string())
            .collect::<Vec<_>>();
        assert_eq!(primaries, vec!["tablet".to_string()]);

        let (status, _, _) = send(
            &router,
            request(Method::POST, "/v1/devices/watch/primary", Some("tok-a"), None),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
