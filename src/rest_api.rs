//! HTTP ingress: a thin Axum surface in front of the queue manager and
//! router. Validation happens entirely at this boundary — nothing
//! malformed reaches the queue.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::diary_store::DiaryStore;
use crate::domain_types::PatientId;
use crate::event::{EventEnvelope, EventType, Payload, SenderRole};
use crate::queue::QueueManager;
use crate::router::GatewayRouter;

/// Drives a single envelope through the router, discarding the result —
/// the HTTP caller gets an acknowledgement, not the pipeline's output.
pub struct RouterProcessor {
    router: Arc<GatewayRouter>,
}

impl RouterProcessor {
    /// Wraps `router` for use as a queue manager's processor.
    #[must_use]
    pub fn new(router: Arc<GatewayRouter>) -> Self {
        Self { router }
    }
}

#[async_trait::async_trait]
impl crate::queue::EventProcessor for RouterProcessor {
    async fn process(&self, envelope: EventEnvelope) {
        let router = Arc::clone(&self.router);
        let _ = router.process_event(envelope).await;
    }
}

/// Shared state handed to every Axum handler.
#[derive(Clone)]
pub struct AppState {
    /// Queue manager that preserves per-patient FIFO for ingested events.
    pub queue: Arc<QueueManager<RouterProcessor>>,
    /// The router, consulted directly for status and diary reads.
    pub router: Arc<GatewayRouter>,
    /// Diary store, consulted directly for read-only ingress endpoints.
    pub store: Arc<dyn DiaryStore>,
}

/// Request body for `POST /api/gateway/emit`.
#[derive(Debug, Deserialize)]
pub struct EmitRequest {
    patient_id: Option<String>,
    event_type: String,
    sender_role: String,
    sender_id: Option<String>,
    #[serde(default)]
    payload: Payload,
}

/// Response body for a successfully enqueued emit.
#[derive(Debug, Serialize)]
pub struct EmitResponse {
    event_id: String,
    status: &'static str,
}

/// Query parameters for `GET /api/gateway/events/{id}`.
#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    limit: Option<usize>,
}

fn parse_event_type(raw: &str) -> Option<EventType> {
    serde_json::from_value(Value::String(raw.to_string())).ok()
}

fn parse_sender_role(raw: &str) -> Option<SenderRole> {
    serde_json::from_value(Value::String(raw.to_string())).ok()
}

async fn emit(State(state): State<AppState>, Json(request): Json<EmitRequest>) -> impl IntoResponse {
    let Some(raw_patient_id) = request.patient_id else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "patient_id is required"})),
        )
            .into_response();
    };

    let Ok(patient_id) = PatientId::try_new(raw_patient_id) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "patient_id must be 1-128 characters"})),
        )
            .into_response();
    };

    let Some(event_type) = parse_event_type(&request.event_type) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": format!("unknown event_type: {}", request.event_type)})),
        )
            .into_response();
    };

    let Some(sender_role) = parse_sender_role(&request.sender_role) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": format!("unknown sender_role: {}", request.sender_role)})),
        )
            .into_response();
    };

    let mut envelope = EventEnvelope::new(event_type, patient_id, sender_role, "http_ingress");
    envelope.sender_id = request.sender_id;
    envelope.payload = request.payload;

    let event_id = envelope.event_id.to_string();
    state.queue.enqueue(envelope).await;

    (
        StatusCode::ACCEPTED,
        Json(EmitResponse {
            event_id,
            status: "queued",
        }),
    )
        .into_response()
}

async fn get_diary(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    let Ok(patient_id) = PatientId::try_new(id) else {
        return (StatusCode::BAD_REQUEST, Json(json!({"error": "invalid patient id"}))).into_response();
    };

    match state.store.load(&patient_id).await {
        Ok((diary, generation)) => {
            Json(json!({"diary": diary, "generation": generation.as_i64()})).into_response()
        }
        Err(crate::error::DiaryStoreError::NotFound { .. }) => {
            (StatusCode::NOT_FOUND, Json(json!({"error": "no diary for patient"}))).into_response()
        }
        Err(error) => {
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": error.to_string()}))).into_response()
        }
    }
}

async fn get_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> impl IntoResponse {
    let Ok(patient_id) = PatientId::try_new(id) else {
        return (StatusCode::BAD_REQUEST, Json(json!({"error": "invalid patient id"}))).into_response();
    };

    match state.store.load(&patient_id).await {
        Ok((diary, _)) => {
            let limit = query.limit.unwrap_or(diary.conversation_log.len());
            let entries: Vec<_> = diary.conversation_log.iter().rev().take(limit).collect();
            Json(json!({"events": entries})).into_response()
        }
        Err(crate::error::DiaryStoreError::NotFound { .. }) => {
            (StatusCode::NOT_FOUND, Json(json!({"error": "no diary for patient"}))).into_response()
        }
        Err(error) => {
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": error.to_string()}))).into_response()
        }
    }
}

async fn get_status(State(state): State<AppState>) -> impl IntoResponse {
    let health = state.router.health().await;
    let metrics = state.router.metrics().snapshot();
    let status_code = if health.overall_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status_code,
        Json(json!({
            "agents_registered": health.agents_registered,
            "agent_names": health.agent_names,
            "channels_registered": health.channels_registered,
            "channel_names": health.channel_names,
            "diary_store_available": health.diary_store_available,
            "overall_healthy": health.overall_healthy,
            "events_processed": metrics.events_processed,
            "events_failed": metrics.events_failed,
            "events_rate_limited": metrics.events_rate_limited,
            "diary_save_failures": metrics.diary_save_failures,
            "dispatch_failures": metrics.dispatch_failures,
        })),
    )
        .into_response()
}

/// Builds the Axum router for the Gateway's HTTP ingress surface.
#[must_use]
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/gateway/emit", post(emit))
        .route("/api/gateway/diary/{id}", get(get_diary))
        .route("/api/gateway/events/{id}", get(get_events))
        .route("/api/gateway/status", get(get_status))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_parses_screaming_snake_case() {
        assert_eq!(parse_event_type("USER_MESSAGE"), Some(EventType::UserMessage));
        assert_eq!(parse_event_type("not_a_real_type"), None);
    }

    #[test]
    fn sender_role_parses_snake_case() {
        assert_eq!(parse_sender_role("patient"), Some(SenderRole::Patient));
        assert_eq!(parse_sender_role("not_a_role"), None);
    }
}
