//! Axum route handlers: the webhook entry point and the linking RPC API.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::Json;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use vip_link_types::*;

use crate::db::Db;
use crate::error::ServiceError;
use crate::events::classify;
use crate::handlers::EventProcessor;

pub const EVENT_HEADER: &str = "X-Patreon-Event";

pub struct AppState {
    pub db: Arc<Db>,
    pub processor: Arc<EventProcessor>,
    pub start_time: Instant,
}

/// Webhook acknowledgment body.
#[derive(Debug, Serialize)]
pub struct WebhookAck {
    pub event: Option<String>,
    pub outcome: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub grants: Vec<GrantReport>,
}

fn error_status(e: &ServiceError) -> StatusCode {
    match e {
        ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
        ServiceError::Conflict(_) => StatusCode::CONFLICT,
        ServiceError::MalformedEvent(_) => StatusCode::BAD_REQUEST,
        ServiceError::Unmatched(_) => StatusCode::BAD_REQUEST,
        ServiceError::InvalidDuration(_) => StatusCode::BAD_REQUEST,
        ServiceError::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
        ServiceError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

// POST /webhook/patreon
//
// Classification happens before the body is parsed: a malformed header is
// rejected on the spot, and an unmatched event is acknowledged with 200 so
// the platform does not keep redelivering something we will never handle.
pub async fn patreon_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    raw_body: String,
) -> (StatusCode, Json<RpcResponse<WebhookAck>>) {
    let Some(header) = headers.get(EVENT_HEADER).and_then(|v| v.to_str().ok()) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(RpcResponse::err(format!("missing {} header", EVENT_HEADER))),
        );
    };

    let kind = match classify(header) {
        Ok(kind) => kind,
        Err(e @ ServiceError::Unmatched(_)) => {
            log::info!("[Webhook] Ignoring event: {}", e);
            return (
                StatusCode::OK,
                Json(RpcResponse::ok(WebhookAck {
                    event: None,
                    outcome: "ignored".to_string(),
                    grants: Vec::new(),
                })),
            );
        }
        Err(e) => {
            log::error!("[Webhook] Rejecting event header {:?}: {}", header, e);
            return (error_status(&e), Json(RpcResponse::err(e.to_string())));
        }
    };

    let body: serde_json::Value = match serde_json::from_str(&raw_body) {
        Ok(v) => v,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(RpcResponse::err(format!("invalid JSON payload: {}", e))),
            );
        }
    };

    match state.processor.process(kind, &body).await {
        Ok(outcome) if outcome.has_failures() => {
            // Partially failed: report it so the sender redelivers.
            let ack = WebhookAck {
                event: Some(kind.as_str().to_string()),
                outcome: "partial_failure".to_string(),
                grants: outcome.grants,
            };
            (
                StatusCode::BAD_GATEWAY,
                Json(RpcResponse {
                    success: false,
                    data: Some(ack),
                    error: Some("entitlement extension partially failed".to_string()),
                }),
            )
        }
        Ok(outcome) => (
            StatusCode::OK,
            Json(RpcResponse::ok(WebhookAck {
                event: Some(kind.as_str().to_string()),
                outcome: "handled".to_string(),
                grants: outcome.grants,
            })),
        ),
        Err(e) => {
            log::error!("[Webhook] {} failed: {}", kind.as_str(), e);
            (error_status(&e), Json(RpcResponse::err(e.to_string())))
        }
    }
}

// POST /rpc/link/primary
pub async fn link_primary(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LinkPrimaryRequest>,
) -> (StatusCode, Json<RpcResponse<LinkReport>>) {
    match state.db.link_primary(&req.chat_name, &req.player_id) {
        Ok(report) => (StatusCode::OK, Json(RpcResponse::ok(report))),
        Err(e) => (error_status(&e), Json(RpcResponse::err(e.to_string()))),
    }
}

// POST /rpc/unlink/primary
pub async fn unlink_primary(
    State(state): State<Arc<AppState>>,
    Json(req): Json<UnlinkPrimaryRequest>,
) -> (StatusCode, Json<RpcResponse<UnlinkReport>>) {
    match state.db.unlink_primary(&req.chat_name) {
        Ok(report) => (StatusCode::OK, Json(RpcResponse::ok(report))),
        Err(e) => (error_status(&e), Json(RpcResponse::err(e.to_string()))),
    }
}

// POST /rpc/link/sponsored
pub async fn link_sponsored(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LinkSponsoredRequest>,
) -> (StatusCode, Json<RpcResponse<LinkReport>>) {
    match state.db.link_sponsored(&req.chat_name, &req.player_id) {
        Ok(report) => (StatusCode::OK, Json(RpcResponse::ok(report))),
        Err(e) => (error_status(&e), Json(RpcResponse::err(e.to_string()))),
    }
}

// POST /rpc/unlink/sponsored
pub async fn unlink_sponsored(
    State(state): State<Arc<AppState>>,
    Json(req): Json<UnlinkSponsoredRequest>,
) -> (StatusCode, Json<RpcResponse<UnlinkReport>>) {
    match state.db.unlink_sponsored(&req.chat_name, &req.player_id) {
        Ok(report) => (StatusCode::OK, Json(RpcResponse::ok(report))),
        Err(e) => (error_status(&e), Json(RpcResponse::err(e.to_string()))),
    }
}

// POST /rpc/link/billing
pub async fn link_billing(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LinkBillingRequest>,
) -> (StatusCode, Json<RpcResponse<LinkReport>>) {
    match state.db.link_billing(&req.chat_name, &req.billing_id) {
        Ok(report) => (StatusCode::OK, Json(RpcResponse::ok(report))),
        Err(e) => (error_status(&e), Json(RpcResponse::err(e.to_string()))),
    }
}

// POST /rpc/unlink/billing
pub async fn unlink_billing(
    State(state): State<Arc<AppState>>,
    Json(req): Json<UnlinkBillingRequest>,
) -> (StatusCode, Json<RpcResponse<UnlinkReport>>) {
    match state.db.unlink_billing(&req.chat_name) {
        Ok(report) => (StatusCode::OK, Json(RpcResponse::ok(report))),
        Err(e) => (error_status(&e), Json(RpcResponse::err(e.to_string()))),
    }
}

// GET /rpc/stats
pub async fn stats(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<RpcResponse<LinkStats>>) {
    match state.db.stats() {
        Ok(s) => (StatusCode::OK, Json(RpcResponse::ok(s))),
        Err(e) => (error_status(&e), Json(RpcResponse::err(e.to_string()))),
    }
}

// GET /rpc/status
pub async fn status(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<RpcResponse<ServiceStatus>>) {
    let stats = state.db.stats().ok();
    (
        StatusCode::OK,
        Json(RpcResponse::ok(ServiceStatus {
            running: true,
            uptime_secs: state.start_time.elapsed().as_secs(),
            chat_identities: stats.as_ref().map(|s| s.chat_identities).unwrap_or(0),
            player_identities: stats.as_ref().map(|s| s.player_identities).unwrap_or(0),
        })),
    )
}
