//! Webhook ingestion and health handlers.
//!
//! The ingest handler answers the provider only after durable persistence:
//! audit capture (best-effort) → content-type check → signature validation
//! → parse → enqueue → 200. Expected provider-side conditions never produce
//! a 500, because a 500 invites unbounded provider retries.

use std::{collections::HashMap, sync::Arc, time::Duration};

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use chrono::Utc;
use notiq_core::{Provider, TenantId};
use notiq_ingest::{Parsed, SourceAdapter};
use notiq_queue::{AuditRecord, AuditStore, Enqueue, QueueStore};
use serde::Serialize;
use tracing::{debug, error, info, warn};

/// Shared state for the ingestion endpoints.
pub struct AppState {
    adapters: HashMap<Provider, Arc<dyn SourceAdapter>>,
    queue: Arc<dyn QueueStore>,
    audit: Arc<dyn AuditStore>,
    secrets: HashMap<Provider, String>,
    tenant: TenantId,
    enqueue_timeout: Duration,
}

impl AppState {
    /// Assembles the handler state.
    pub fn new(
        adapters: Vec<Arc<dyn SourceAdapter>>,
        queue: Arc<dyn QueueStore>,
        audit: Arc<dyn AuditStore>,
        secrets: HashMap<Provider, String>,
        tenant: TenantId,
        enqueue_timeout: Duration,
    ) -> Self {
        let adapters = adapters.into_iter().map(|a| (a.provider(), a)).collect();
        Self { adapters, queue, audit, secrets, tenant, enqueue_timeout }
    }
}

#[derive(Debug, Serialize)]
struct SuccessResponse {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<&'static str>,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    status: &'static str,
    message: String,
}

fn success(message: Option<&'static str>) -> Response {
    (StatusCode::OK, Json(SuccessResponse { status: "success", message })).into_response()
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(ErrorResponse { status: "error", message: message.into() })).into_response()
}

/// Ingests one provider webhook.
///
/// Responses: 200 after durable enqueue (also for duplicates and test
/// webhooks), 400 for signature/parse failures, 404 for unknown providers,
/// 415 for the wrong content type, 500 only for unexpected internal
/// failures.
pub async fn ingest_webhook(
    Path(provider): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(provider) = Provider::from_path(&provider) else {
        return error_response(StatusCode::NOT_FOUND, format!("unknown provider: {provider}"));
    };

    // Raw capture happens before validation so rejected requests are
    // debuggable too. Best-effort: never blocks or fails the request.
    let record = AuditRecord::from_request(
        provider.as_str(),
        "POST",
        &format!("/webhooks/{provider}"),
        headers
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string()))),
        &body,
        Utc::now(),
    );
    let audit = state.audit.clone();
    tokio::spawn(async move {
        audit.capture(record).await;
    });

    let Some(adapter) = state.adapters.get(&provider) else {
        return error_response(StatusCode::NOT_FOUND, format!("no adapter for {provider}"));
    };

    let content_type = headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !content_type.starts_with(adapter.expected_content_type()) {
        debug!(%provider, content_type, "wrong content type");
        return error_response(
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            format!("expected {}", adapter.expected_content_type()),
        );
    }

    let Some(secret) = state.secrets.get(&provider).filter(|s| !s.is_empty()) else {
        // Missing credential: operator-side fault, never a silent drop.
        error!(%provider, "webhook secret not configured");
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "provider not configured");
    };

    if !adapter.validate(&body, &headers, secret) {
        warn!(%provider, "webhook signature validation failed");
        return error_response(StatusCode::BAD_REQUEST, "invalid webhook signature");
    }

    let event = match adapter.parse(&body, &headers) {
        Ok(Parsed::Event(event)) => event,
        Ok(Parsed::Test) => {
            debug!(%provider, "test webhook acknowledged");
            return success(Some("test webhook received"));
        },
        Err(e) => {
            warn!(%provider, error = %e, "webhook parse failed");
            return error_response(StatusCode::BAD_REQUEST, e.to_string());
        },
    };

    // Durable persistence bounded by a short timeout: the provider must
    // get its 200 only after the event is safe, but a slow store must not
    // stall the caller indefinitely.
    let enqueue = tokio::time::timeout(
        state.enqueue_timeout,
        state.queue.enqueue(&event, state.tenant),
    )
    .await;

    match enqueue {
        Ok(Ok(Enqueue::Enqueued { queue_key })) => {
            info!(%provider, queue_key = %queue_key, kind = %event.kind, "webhook enqueued");
            success(None)
        },
        Ok(Ok(Enqueue::Duplicate { queue_key })) => {
            info!(%provider, queue_key = %queue_key, "duplicate webhook ignored");
            success(None)
        },
        Ok(Err(e)) => {
            error!(%provider, error = %e, "failed to enqueue webhook");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to persist event")
        },
        Err(_) => {
            error!(%provider, "enqueue timed out");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "storage timeout")
        },
    }
}

/// Basic health probe.
pub async fn health_check() -> Response {
    (StatusCode::OK, Json(serde_json::json!({"status": "healthy"}))).into_response()
}

/// Liveness probe.
pub async fn liveness_check() -> Response {
    (StatusCode::OK, Json(serde_json::json!({"status": "alive"}))).into_response()
}

/// Readiness probe.
pub async fn readiness_check() -> Response {
    (StatusCode::OK, Json(serde_json::json!({"status": "ready"}))).into_response()
}
