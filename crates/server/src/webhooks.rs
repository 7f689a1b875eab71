//! Inbound webhook ingestion.
//!
//! The platform treats any non-200 as a delivery failure and retries with
//! backoff, eventually disabling the webhook. The only hard rejection here is
//! a body without an event type; everything else is acknowledged with 200 and
//! the failure reported in the response body.

use std::collections::HashMap;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use secrecy::ExposeSecret;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use motocrm_core::event::normalize_webhook;

use crate::bootstrap::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookResponse {
    pub success: bool,
    pub processed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lead_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    pub deduplicated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub fn router(state: AppState) -> Router {
    Router::new().route("/webhooks/{platform}", post(receive).get(verify)).with_state(state)
}

pub async fn receive(
    State(state): State<AppState>,
    Path(platform): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    let event = match normalize_webhook(&body) {
        Ok(event) => event,
        Err(error) => {
            warn!(
                platform = %platform,
                error = %error,
                event_name = "webhook.rejected",
                "webhook rejected"
            );
            return (StatusCode::BAD_REQUEST, Json(json!({"error": error.to_string()})))
                .into_response();
        }
    };

    match state.processor.process(&event).await {
        Ok(outcome) => {
            info!(
                platform = %platform,
                processed = outcome.processed,
                deduplicated = outcome.deduplicated,
                event_name = "webhook.processed",
                "webhook processed"
            );
            Json(WebhookResponse {
                success: true,
                processed: outcome.processed,
                lead_id: outcome.lead_id.map(|id| id.0),
                conversation_id: outcome.conversation_id.map(|id| id.0),
                message_id: outcome.message_id.map(|id| id.0),
                deduplicated: outcome.deduplicated,
                error: None,
            })
            .into_response()
        }
        // Acknowledge anyway; the platform redelivers on non-200 and a store
        // failure here is not the platform's problem.
        Err(error) => {
            warn!(
                platform = %platform,
                error = %error,
                event_name = "webhook.process_failed",
                "webhook processing failed"
            );
            Json(WebhookResponse {
                success: false,
                processed: false,
                lead_id: None,
                conversation_id: None,
                message_id: None,
                deduplicated: false,
                error: Some(error.to_string()),
            })
            .into_response()
        }
    }
}

/// Meta-style subscription handshake: echo `hub.challenge` when the mode is
/// `subscribe` and the token matches.
pub async fn verify(
    State(state): State<AppState>,
    Path(platform): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let mode = params.get("hub.mode").map(String::as_str);
    let token = params.get("hub.verify_token").map(String::as_str);

    if mode == Some("subscribe") && token == Some(state.verify_token.expose_secret()) {
        let challenge = params.get("hub.challenge").cloned().unwrap_or_default();
        info!(platform = %platform, event_name = "webhook.verified", "webhook handshake accepted");
        (StatusCode::OK, challenge).into_response()
    } else {
        warn!(platform = %platform, event_name = "webhook.verify_denied", "webhook handshake denied");
        StatusCode::FORBIDDEN.into_response()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use tower::util::ServiceExt;

    use motocrm_db::repositories::{
        InMemoryConversationRepository, InMemoryLeadRepository, InMemoryMessageRepository,
        InMemorySyncQueueRepository,
    };
    use motocrm_platform::FakePlatformClient;
    use motocrm_sync::{BulkSyncOrchestrator, EventProcessor, ProgressStore, SyncQueue};

    use crate::bootstrap::AppState;

    struct Fixture {
        leads: Arc<InMemoryLeadRepository>,
        messages: Arc<InMemoryMessageRepository>,
        state: AppState,
    }

    fn fixture() -> Fixture {
        let leads = Arc::new(InMemoryLeadRepository::new());
        let conversations = Arc::new(InMemoryConversationRepository::new());
        let messages = Arc::new(InMemoryMessageRepository::new());
        let records = Arc::new(InMemorySyncQueueRepository::new());
        let platform = Arc::new(FakePlatformClient::new());

        let processor =
            Arc::new(EventProcessor::new(leads.clone(), conversations.clone(), messages.clone()));
        let queue = Arc::new(SyncQueue::new(
            records,
            leads.clone(),
            platform.clone(),
            5,
            Duration::ZERO,
        ));
        let bulk = Arc::new(BulkSyncOrchestrator::new(
            leads.clone(),
            platform,
            Arc::new(ProgressStore::new(Duration::from_secs(3600), 25)),
            Duration::ZERO,
        ));

        let state = AppState {
            processor,
            queue,
            bulk,
            verify_token: "verify-secret".to_string().into(),
        };
        Fixture { leads, messages, state }
    }

    async fn post_webhook(state: AppState, body: Value) -> (StatusCode, Value) {
        let app = super::router(state);
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/webhooks/whatsapp")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .expect("request"),
            )
            .await
            .expect("response");

        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body bytes");
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).expect("json body")
        };
        (status, json)
    }

    #[tokio::test]
    async fn missing_event_type_is_rejected_without_side_effects() {
        let fx = fixture();

        let (status, body) =
            post_webhook(fx.state.clone(), json!({"subscriber": {"id": "987"}})).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Missing event_type");
        assert!(fx.leads.is_empty().await);
    }

    #[tokio::test]
    async fn new_subscriber_creates_a_lead_and_acknowledges() {
        let fx = fixture();

        let (status, body) = post_webhook(
            fx.state.clone(),
            json!({
                "event_type": "new_subscriber",
                "subscriber": {"id": "987654321", "name": "María González"}
            }),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["processed"], true);
        assert!(body["leadId"].as_str().expect("leadId").starts_with("LD-"));
        assert!(body.get("conversationId").is_none());
        assert_eq!(fx.leads.len().await, 1);
    }

    #[tokio::test]
    async fn replayed_message_acknowledges_with_the_stored_ids() {
        let fx = fixture();
        let webhook = json!({
            "event_type": "message_received",
            "subscriber": {"id": "987654321", "whatsapp_phone": "+5437099"},
            "message": {"id": "msg_1", "body": "Hola", "timestamp": 1720000000}
        });

        let (_, first) = post_webhook(fx.state.clone(), webhook.clone()).await;
        let (status, second) = post_webhook(fx.state.clone(), webhook).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(second["success"], true);
        assert_eq!(second["deduplicated"], true);
        assert_eq!(second["messageId"], first["messageId"]);
        assert_eq!(second["conversationId"], first["conversationId"]);
        assert_eq!(fx.messages.len().await, 1);
    }

    #[tokio::test]
    async fn processing_failure_is_acknowledged_with_200() {
        let fx = fixture();

        // A tag event without a tag name cannot be applied, but the webhook
        // must still be acknowledged.
        let (status, body) = post_webhook(
            fx.state.clone(),
            json!({"event_type": "tag_applied", "subscriber": {"id": "987"}}),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], false);
        assert!(body["error"].as_str().expect("error").contains("tag"));
    }

    #[tokio::test]
    async fn handshake_echoes_the_challenge_on_token_match() {
        let fx = fixture();
        let app = super::router(fx.state.clone());

        let response = app
            .oneshot(
                Request::builder()
                    .uri(
                        "/webhooks/whatsapp?hub.mode=subscribe\
                         &hub.verify_token=verify-secret&hub.challenge=12345",
                    )
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body bytes");
        assert_eq!(&bytes[..], b"12345");
    }

    #[tokio::test]
    async fn handshake_with_a_bad_token_is_forbidden() {
        let fx = fixture();
        let app = super::router(fx.state);

        let response = app
            .oneshot(
                Request::builder()
                    .uri(
                        "/webhooks/whatsapp?hub.mode=subscribe\
                         &hub.verify_token=wrong&hub.challenge=12345",
                    )
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }
}
