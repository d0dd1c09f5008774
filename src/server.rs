//! HTTP surface.
//!
//! Thin axum handlers over [`crate::commands`]. Every error leaves as
//! `{"error": ..., "retryable": ...}` with a status derived from its kind.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde_json::json;
use tower_http::trace::TraceLayer;

use crate::agent_core::DeskError;
use crate::commands::chat::{self, SendMessageRequest};
use crate::commands::session;
use crate::AppState;

type SharedState = Arc<AppState>;

/// Build the router with every route bound to `state`.
pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/sessions", post(start_session))
        .route("/sessions/:id/history", get(history))
        .route("/sessions/:id/reports", get(reports))
        .route("/sessions/:id/close", post(close_session))
        .route("/messages", post(send_message))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ─── Errors ─────────────────────────────────────────────────────────────────

/// A [`DeskError`] on its way out as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub DeskError);

impl From<DeskError> for ApiError {
    fn from(e: DeskError) -> Self {
        Self(e)
    }
}

pub(crate) fn status_for(e: &DeskError) -> StatusCode {
    match e {
        DeskError::Validation { .. } | DeskError::SessionClosed { .. } => StatusCode::BAD_REQUEST,
        DeskError::SessionNotFound { .. } => StatusCode::NOT_FOUND,
        DeskError::SessionBusy { .. } => StatusCode::CONFLICT,
        DeskError::Cancelled { .. } => StatusCode::GATEWAY_TIMEOUT,
        DeskError::TransientUpstream { .. }
        | DeskError::TerminalUpstream { .. }
        | DeskError::Storage { .. }
        | DeskError::Serialization { .. }
        | DeskError::Config { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), error = %self.0, "request failed");
        } else {
            tracing::debug!(status = status.as_u16(), error = %self.0, "request rejected");
        }
        let body = Json(json!({
            "error": self.0.to_string(),
            "retryable": self.0.is_retryable(),
        }));
        (status, body).into_response()
    }
}

// ─── Handlers ───────────────────────────────────────────────────────────────

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}

async fn start_session(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let resp = session::start_session(&state)?;
    Ok((StatusCode::CREATED, Json(resp)))
}

async fn send_message(
    State(state): State<SharedState>,
    Json(req): Json<SendMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(chat::send_message(&state, req).await?))
}

async fn history(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(session::get_history(&state, &id)?))
}

async fn reports(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(session::list_reports(&state, &id)?))
}

async fn close_session(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(session::close_session(&state, &id).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use crate::inference::DeskConfig;

    fn app() -> Router {
        router(Arc::new(AppState::from_config(DeskConfig::default()).unwrap()))
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_status_mapping() {
        let busy = DeskError::SessionBusy {
            session_id: "s".into(),
        };
        assert_eq!(status_for(&busy), StatusCode::CONFLICT);
        assert_eq!(
            status_for(&DeskError::SessionNotFound {
                session_id: "s".into()
            }),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_for(&DeskError::SessionClosed {
                session_id: "s".into()
            }),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&DeskError::Cancelled {
                reason: "deadline".into()
            }),
            StatusCode::GATEWAY_TIMEOUT
        );
    }

    #[tokio::test]
    async fn test_health() {
        let resp = app()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["status"], "ok");
    }

    #[tokio::test]
    async fn test_start_then_read_history() {
        let app = app();
        let resp = app
            .clone()
            .oneshot(Request::post("/sessions").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let id = body_json(resp).await["session_id"].as_str().unwrap().to_string();

        let resp = app
            .oneshot(
                Request::get(format!("/sessions/{id}/history"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["flow_state"], "active");
    }

    #[tokio::test]
    async fn test_errors_carry_status_and_body() {
        let resp = app()
            .oneshot(
                Request::get("/sessions/not-a-uuid/reports")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body = body_json(resp).await;
        assert_eq!(body["retryable"], false);
        assert!(body["error"].as_str().unwrap().contains("invalid session id"));
    }

    #[tokio::test]
    async fn test_empty_message_rejected() {
        let resp = app()
            .oneshot(
                Request::post("/messages")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"text": "   "}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
