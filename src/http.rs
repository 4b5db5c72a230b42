//! HTTP surface
//!
//! | Route                               | Description                       |
//! |-------------------------------------|-----------------------------------|
//! | `POST /webhooks/:channel/:user_id`  | Provider webhooks (slack, sms, whatsapp, email) |
//! | `GET /audience/:user_id`            | Merged audience context           |
//! | `GET /health`                       | Load balancer health probe        |

use crate::channels::{WebhookRequest, WebhookResponse};
use crate::service::InboxService;
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<InboxService>,
}

/// Build the router
pub fn build_app(service: Arc<InboxService>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/webhooks/:channel/:user_id", post(webhook))
        .route("/audience/:user_id", get(audience))
        .with_state(AppState { service })
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let healthy = state.service.health().await;
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(HealthResponse {
            status: if healthy { "ok" } else { "degraded" }.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }),
    )
}

fn error_response(status: StatusCode, code: &str, message: impl Into<String>) -> Response {
    (
        status,
        Json(serde_json::json!({"error": {"code": code, "message": message.into()}})),
    )
        .into_response()
}

/// Public URL of the request, as the provider saw it
fn public_url(headers: &HeaderMap, uri: &Uri) -> Option<String> {
    let host = headers
        .get("x-forwarded-host")
        .or_else(|| headers.get(header::HOST))?
        .to_str()
        .ok()?;
    let scheme = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("https");
    let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
    Some(format!("{}://{}{}", scheme, host, path))
}

fn webhook_request(
    headers: &HeaderMap,
    uri: &Uri,
    query: HashMap<String, String>,
    body: Bytes,
) -> WebhookRequest {
    let mut request = WebhookRequest::new(body.to_vec());
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            request = request.with_header(name.as_str(), value);
        }
    }
    for (name, value) in query {
        request = request.with_query(name, value);
    }
    if let Some(url) = public_url(headers, uri) {
        request = request.with_url(url);
    }
    request
}

async fn webhook(
    State(state): State<AppState>,
    Path((channel, user_id)): Path<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    uri: Uri,
    body: Bytes,
) -> Response {
    tracing::debug!(
        channel = %channel,
        user_id = %user_id,
        body_len = body.len(),
        "Webhook received"
    );
    let request = webhook_request(&headers, &uri, query, body);

    let response = match state
        .service
        .handle_webhook(&channel, &user_id, &request)
        .await
    {
        Ok(Some(response)) => response,
        Ok(None) => {
            return error_response(
                StatusCode::NOT_FOUND,
                "NOT_CONNECTED",
                format!("{} is not connected", channel),
            )
        }
        Err(e) => {
            tracing::error!(channel = %channel, user_id = %user_id, error = %e, "Webhook failed");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL", "internal error");
        }
    };

    match response {
        WebhookResponse::Challenge(challenge) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain")],
            challenge,
        )
            .into_response(),
        WebhookResponse::Accepted {
            message_ids,
            duplicates,
        } => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "accepted",
                "messageIds": message_ids,
                "duplicates": duplicates,
            })),
        )
            .into_response(),
        WebhookResponse::Duplicate => {
            (StatusCode::OK, Json(serde_json::json!({"status": "duplicate"}))).into_response()
        }
        WebhookResponse::StatusApplied { applied } => (
            StatusCode::OK,
            Json(serde_json::json!({"status": "status_applied", "applied": applied})),
        )
            .into_response(),
        WebhookResponse::Ignored(reason) => (
            StatusCode::OK,
            Json(serde_json::json!({"status": "ignored", "reason": reason})),
        )
            .into_response(),
        WebhookResponse::Dropped(reason) => (
            StatusCode::OK,
            Json(serde_json::json!({"status": "dropped", "reason": reason})),
        )
            .into_response(),
        WebhookResponse::Rejected(_) => {
            // Never echo why a signature failed
            error_response(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", "invalid signature")
        }
        WebhookResponse::Deferred(reason) => {
            error_response(StatusCode::SERVICE_UNAVAILABLE, "RETRY", reason)
        }
    }
}

async fn audience(State(state): State<AppState>, Path(user_id): Path<String>) -> Response {
    match state.service.audience(&user_id).await {
        Ok(context) => Json(context).into_response(),
        Err(e) => {
            tracing::error!(user_id = %user_id, error = %e, "Audience context failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL", "internal error")
        }
    }
}
