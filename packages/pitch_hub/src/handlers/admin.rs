//! Administrative control surface used by other backend services.

use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info};

use crate::AppState;
use crate::error::HubError;
use crate::hub::protocol::PresenceStatus;
use crate::hub::queue::QueueOptions;

#[derive(Deserialize)]
pub struct BroadcastRequest {
    message: Value,
}

pub async fn broadcast_handler(
    State(state): State<AppState>,
    Json(request): Json<BroadcastRequest>,
) -> Result<impl IntoResponse, HubError> {
    let receipt = state.hub.broadcast(request.message).await?;
    Ok(Json(receipt))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendRequest {
    user_id: String,
    message: Value,
    /// Storage options used if the user is offline
    #[serde(flatten)]
    queue: QueueOptions,
}

fn missing_user_id() -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({ "error": "userId is required" })),
    )
        .into_response()
}

pub async fn send_handler(
    State(state): State<AppState>,
    Json(request): Json<SendRequest>,
) -> Result<Response, HubError> {
    let user_id = request.user_id.trim();
    if user_id.is_empty() {
        return Ok(missing_user_id());
    }
    let receipt = state
        .hub
        .send(user_id.to_string(), request.message, request.queue)
        .await?;
    Ok(Json(receipt).into_response())
}

#[derive(Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRequest {
    user_id: String,
    status: PresenceStatus,
}

pub async fn presence_handler(
    State(state): State<AppState>,
    Json(request): Json<PresenceRequest>,
) -> Result<Response, HubError> {
    let user_id = request.user_id.trim().to_string();
    if user_id.is_empty() {
        return Ok(missing_user_id());
    }
    info!(user_id = %user_id, status = ?request.status, "API: presence override");
    let status = state.hub.set_presence(user_id.clone(), request.status).await?;
    Ok(Json(PresenceRequest { user_id, status }).into_response())
}

pub async fn stats_handler(State(state): State<AppState>) -> Result<impl IntoResponse, HubError> {
    Ok(Json(state.hub.stats().await?))
}

/// Offline queue storage stats, read straight from the database.
pub async fn storage_stats_handler(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, StatusCode> {
    match state.db.get_stats().await {
        Ok(stats) => Ok(Json(stats)),
        Err(e) => {
            error!("Failed to get database stats: {}", e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        Router,
        body::Body,
        http::Request,
        routing::{get, post},
    };
    use tower::ServiceExt;

    fn router(state: AppState) -> Router {
        Router::new()
            .route("/broadcast", post(broadcast_handler))
            .route("/send", post(send_handler))
            .route("/presence", post(presence_handler))
            .route("/stats", get(stats_handler))
            .route("/stats/storage", get(storage_stats_handler))
            .with_state(state)
    }

    async fn post_json(app: Router, uri: &str, body: &str) -> (StatusCode, Value) {
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(uri)
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
    }

    #[tokio::test]
    async fn test_broadcast_with_no_connections() {
        let state = crate::test_helpers::test_app_state().await;
        let (status, json) = post_json(
            router(state),
            "/broadcast",
            r#"{"message":{"type":"system.maintenance"}}"#,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["delivered"], 0);
        assert_eq!(json["total"], 0);
    }

    #[tokio::test]
    async fn test_send_to_offline_user_is_queued() {
        let state = crate::test_helpers::test_app_state().await;
        let app = router(state);
        let (status, json) = post_json(
            app.clone(),
            "/send",
            r#"{"userId":"u1","message":{"type":"nda.signed","pitchId":"7"}}"#,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "queued");
        assert!(json.get("connections").is_none());

        let resp = app
            .oneshot(Request::builder().uri("/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let stats: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(stats["queuedMessages"], 1);
        assert_eq!(stats["totalConnections"], 0);
    }

    #[tokio::test]
    async fn test_send_stores_queue_options() {
        let state = crate::test_helpers::test_app_state().await;
        let repository = crate::repository::HubRepository::new(state.db.pool.clone());
        let (status, json) = post_json(
            router(state),
            "/send",
            r#"{"userId":"u1","message":{"type":"investment.funded"},"priority":"critical","ttlSeconds":60}"#,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "queued");

        let stored = repository
            .load_queue(&crate::repository::queue_key("u1"))
            .await
            .unwrap()
            .unwrap();
        let stored: Value = serde_json::from_str(&stored).unwrap();
        assert_eq!(stored[0]["priority"], "critical");
        assert_eq!(stored[0]["ttlSeconds"], 60);
        assert_eq!(stored[0]["type"], "investment.funded");
    }

    #[tokio::test]
    async fn test_send_requires_user_id() {
        let state = crate::test_helpers::test_app_state().await;
        let (status, json) = post_json(
            router(state),
            "/send",
            r#"{"userId":"  ","message":{"type":"nda.signed"}}"#,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"], "userId is required");
    }

    #[tokio::test]
    async fn test_send_rejects_missing_fields() {
        let state = crate::test_helpers::test_app_state().await;
        let (status, _) = post_json(router(state), "/send", r#"{"message":{}}"#).await;
        assert!(status.is_client_error());
    }

    #[tokio::test]
    async fn test_presence_echoes() {
        let state = crate::test_helpers::test_app_state().await;
        let (status, json) = post_json(
            router(state),
            "/presence",
            r#"{"userId":"u1","status":"away"}"#,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["userId"], "u1");
        assert_eq!(json["status"], "away");
    }

    #[tokio::test]
    async fn test_presence_rejects_unknown_status() {
        let state = crate::test_helpers::test_app_state().await;
        let (status, _) = post_json(
            router(state),
            "/presence",
            r#"{"userId":"u1","status":"busy"}"#,
        )
        .await;
        assert!(status.is_client_error());
    }

    #[tokio::test]
    async fn test_stats_shape() {
        let state = crate::test_helpers::test_app_state().await;
        let resp = router(state)
            .oneshot(Request::builder().uri("/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let stats: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(stats["uniqueUsers"], 0);
        assert_eq!(stats["presence"]["online"], 0);
        assert_eq!(stats["portals"]["creator"], 0);
        assert_eq!(stats["portals"]["investor"], 0);
        assert_eq!(stats["portals"]["production"], 0);
    }

    #[tokio::test]
    async fn test_storage_stats_after_queueing() {
        let state = crate::test_helpers::test_app_state().await;
        let app = router(state);
        for user in ["u1", "u1", "u2"] {
            let body = format!(r#"{{"userId":"{}","message":{{"type":"nda.requested"}}}}"#, user);
            let (status, _) = post_json(app.clone(), "/send", &body).await;
            assert_eq!(status, StatusCode::OK);
        }

        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/stats/storage")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let stats: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(stats["queued_users"], 2);
        assert_eq!(stats["queued_messages"], 3);
    }
}
