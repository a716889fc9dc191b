//! This peer's lock server: the axum surface every other peer's
//! [`RemotePeer`](super::RemotePeer) talks to.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};

use super::rpc::{ForceUnlockRequest, LockRequest, RefreshRequest, RefreshResponse, UnlockRequest};
use super::table::LocalLockTable;
use super::LockGrant;

#[derive(Clone)]
pub struct LockServerState {
    pub table: Arc<LocalLockTable>,
    pub token: Arc<String>,
}

async fn require_bearer_token(
    State(state): State<LockServerState>,
    req: axum::extract::Request,
    next: Next,
) -> Response {
    let authorized = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|presented| presented == state.token.as_str());
    if !authorized {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    next.run(req).await
}

async fn lock(State(state): State<LockServerState>, Json(req): Json<LockRequest>) -> Json<LockGrant> {
    let ttl = Duration::from_millis(req.ttl_ms);
    Json(state.table.lock(&req.resource, req.mode, &req.owner, ttl))
}

async fn unlock(State(state): State<LockServerState>, Json(req): Json<UnlockRequest>) -> StatusCode {
    state.table.unlock(&req.lease_id);
    StatusCode::NO_CONTENT
}

async fn refresh(State(state): State<LockServerState>, Json(req): Json<RefreshRequest>) -> Json<RefreshResponse> {
    let ttl = Duration::from_millis(req.ttl_ms);
    let refreshed = state.table.refresh(&req.lease_id, ttl);
    Json(RefreshResponse { refreshed })
}

async fn force_unlock(State(state): State<LockServerState>, Json(req): Json<ForceUnlockRequest>) -> StatusCode {
    state.table.force_unlock(&req.resource);
    StatusCode::NO_CONTENT
}

/// Builds the peer-to-peer lock router, gated behind bearer-token auth using
/// `distribute.token`.
pub fn router(state: LockServerState) -> Router {
    Router::new()
        .route("/lock/v1/lock", post(lock))
        .route("/lock/v1/unlock", post(unlock))
        .route("/lock/v1/refresh", post(refresh))
        .route("/lock/v1/force-unlock", post(force_unlock))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_bearer_token))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn test_state() -> LockServerState {
        LockServerState {
            table: Arc::new(LocalLockTable::new()),
            token: Arc::new("secret".to_string()),
        }
    }

    #[tokio::test]
    async fn rejects_missing_bearer_token() {
        let app = router(test_state());
        let response = app
            .oneshot(Request::builder().method("POST").uri("/lock/v1/lock").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn grants_lock_with_valid_token() {
        let app = router(test_state());
        let body = serde_json::to_vec(&LockRequest {
            resource: "b/o".to_string(),
            mode: super::super::LockMode::Exclusive,
            owner: "owner-1".to_string(),
            ttl_ms: 30_000,
        })
        .unwrap();
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/lock/v1/lock")
                    .header(header::AUTHORIZATION, "Bearer secret")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
