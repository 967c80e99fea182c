use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, State},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tandem_agent::{AgentRequest, CalendarService, Orchestrator, OrchestratorError};
use tracing::{error, info, warn};

pub const CRON_SECRET_HEADER: &str = "x-cron-secret";
const INTERNAL_ERROR_MESSAGE: &str = "An unexpected internal error occurred.";

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub calendar: Arc<CalendarService>,
    pub cron_secret: Option<SecretString>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct AgentBody {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub context: Option<Map<String, Value>>,
    #[serde(default, rename = "conversationId", alias = "conversation_id")]
    pub conversation_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse {
    pub success: bool,
    pub calendars_synced: u32,
    pub calendars_failed: u32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    pub duration: u64,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/agent", post(agent))
        .route("/api/v1/calendar/sync", post(calendar_sync))
        .with_state(state)
}

pub async fn agent(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<AgentBody>, JsonRejection>,
) -> Response {
    let token = bearer_token(&headers);
    let body = match body {
        Ok(Json(body)) => body,
        Err(rejection) => {
            if let Err(error) = state.orchestrator.authorize(token.as_deref()).await {
                return error_response(error);
            }
            warn!(event_name = "api.agent.bad_body", reason = %rejection.body_text());
            let body = json!({ "error": rejection.body_text() });
            return (StatusCode::BAD_REQUEST, Json(body)).into_response();
        }
    };

    let request = AgentRequest {
        bearer_token: token,
        message: body.message,
        context: body.context,
        conversation_id: body.conversation_id,
    };

    match state.orchestrator.handle(request).await {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(error) => error_response(error),
    }
}

pub async fn calendar_sync(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Some(expected) = &state.cron_secret {
        let provided = headers.get(CRON_SECRET_HEADER).and_then(|value| value.to_str().ok());
        if provided != Some(expected.expose_secret()) {
            warn!(event_name = "api.calendar_sync.rejected", "cron secret mismatch");
            return (StatusCode::UNAUTHORIZED, Json(json!({ "error": "Unauthorized" })))
                .into_response();
        }
    }

    match state.calendar.sync_all().await {
        Ok(summary) => {
            info!(
                event_name = "api.calendar_sync.completed",
                synced = summary.calendars_synced,
                failed = summary.calendars_failed,
                "calendar sync finished"
            );
            let payload = SyncResponse {
                success: summary.success,
                calendars_synced: summary.calendars_synced,
                calendars_failed: summary.calendars_failed,
                errors: summary.errors,
                duration: summary.duration_ms,
            };
            (StatusCode::OK, Json(payload)).into_response()
        }
        Err(source) => {
            let trace_id = uuid::Uuid::new_v4().to_string();
            error!(
                event_name = "api.calendar_sync.failed",
                correlation_id = %trace_id,
                error = %source,
                "calendar sync could not start"
            );
            internal_error(&trace_id)
        }
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ")?.trim();
    (!token.is_empty()).then(|| token.to_string())
}

fn error_response(error: OrchestratorError) -> Response {
    let status = match &error {
        OrchestratorError::Unauthorized => StatusCode::UNAUTHORIZED,
        OrchestratorError::Validation(_) => StatusCode::BAD_REQUEST,
        OrchestratorError::Forbidden => StatusCode::FORBIDDEN,
        OrchestratorError::NotFound(_) => StatusCode::NOT_FOUND,
        OrchestratorError::Conflict(_) => StatusCode::CONFLICT,
        OrchestratorError::Internal { trace_id } => return internal_error(trace_id),
    };
    (status, Json(json!({ "error": error.to_string() }))).into_response()
}

/// The detail stays in the logs; callers only get the trace id to quote.
fn internal_error(trace_id: &str) -> Response {
    let body = json!({
        "error": "Internal server error",
        "message": INTERNAL_ERROR_MESSAGE,
        "trace_id": trace_id,
    });
    (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
        Router,
    };
    use serde_json::{json, Value};
    use tandem_agent::orchestrator::TIMEOUT_APOLOGY;
    use tandem_agent::{
        AgentDeps, BroadcastHub, CalendarService, LlmClient, LlmError, LogNotifier, MockLlm,
        Orchestrator, TimeoutLlm,
    };
    use tandem_core::config::CalendarConfig;
    use tandem_core::domain::conversation::{Conversation, ConversationId};
    use tandem_core::domain::identity::{bearer_token_digest, AuthSession, UserId};
    use tandem_db::repositories::RepositorySet;
    use tower::ServiceExt;

    use super::{router, AppState, CRON_SECRET_HEADER};

    async fn app(cron_secret: Option<&str>) -> (Router, RepositorySet) {
        app_with(Arc::new(MockLlm::replying(&["hello from the model"])), cron_secret).await
    }

    async fn app_with(
        llm: Arc<dyn LlmClient>,
        cron_secret: Option<&str>,
    ) -> (Router, RepositorySet) {
        let repositories = RepositorySet::in_memory();
        repositories
            .auth
            .save_session(AuthSession {
                token_sha256: bearer_token_digest("token-1"),
                user_id: UserId::from("therapist-1"),
                expires_at: None,
            })
            .await
            .expect("session");
        let calendar = Arc::new(CalendarService::new(
            repositories.calendars.clone(),
            repositories.appointments.clone(),
            &CalendarConfig::default(),
        ));
        let deps = AgentDeps::new(
            llm,
            repositories.clone(),
            calendar.clone(),
            Arc::new(LogNotifier),
            Arc::new(BroadcastHub::default()),
        );
        let state = AppState {
            orchestrator: Arc::new(Orchestrator::new(deps)),
            calendar,
            cron_secret: cron_secret.map(|secret| secret.to_string().into()),
        };
        (router(state), repositories)
    }

    fn agent_request(token: Option<&str>, body: Value) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/api/v1/agent")
            .header("content-type", "application/json");
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        builder.body(Body::from(body.to_string())).expect("request")
    }

    async fn json_body(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        serde_json::from_slice(&bytes).expect("json body")
    }

    #[tokio::test]
    async fn agent_requires_a_bearer_token() {
        let (app, _) = app(None).await;

        let response = app
            .clone()
            .oneshot(agent_request(None, json!({ "message": "hi" })))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(json_body(response).await, json!({ "error": "Unauthorized" }));

        let response = app
            .oneshot(agent_request(Some("nope"), json!({ "message": "hi" })))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn agent_checks_the_token_before_reading_the_body() {
        let (app, _) = app(None).await;

        let no_body = Request::builder()
            .method("POST")
            .uri("/api/v1/agent")
            .body(Body::empty())
            .expect("request");
        let response = app.clone().oneshot(no_body).await.expect("response");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(json_body(response).await, json!({ "error": "Unauthorized" }));

        let malformed = Request::builder()
            .method("POST")
            .uri("/api/v1/agent")
            .header("content-type", "application/json")
            .header("authorization", "Bearer token-1")
            .body(Body::from("{not json"))
            .expect("request");
        let response = app.oneshot(malformed).await.expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert!(body["error"].as_str().is_some_and(|message| !message.is_empty()));
    }

    #[tokio::test]
    async fn agent_timeout_answers_with_the_apology_envelope() {
        let slow = Arc::new(MockLlm::replying(&[]).with_delay(Duration::from_millis(250)));
        let llm = Arc::new(TimeoutLlm::new(slow, Duration::from_millis(20)));
        let (app, _) = app_with(llm, None).await;

        let response = app
            .oneshot(agent_request(Some("token-1"), json!({ "message": "hello" })))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["response"], json!(TIMEOUT_APOLOGY));
        assert_eq!(body["error"], json!("timeout"));
        assert!(body["conversationId"].as_str().is_some_and(|id| !id.is_empty()));
    }

    #[tokio::test]
    async fn agent_infrastructure_failure_returns_an_opaque_500() {
        let llm = Arc::new(MockLlm::new(vec![Err(LlmError::Transport(
            "connection refused to 10.0.0.7".to_string(),
        ))]));
        let (app, _) = app_with(llm, None).await;

        let response = app
            .oneshot(agent_request(
                Some("token-1"),
                json!({ "message": "hello", "context": { "agent": "general" } }),
            ))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = json_body(response).await;
        let keys: Vec<&str> = body
            .as_object()
            .map(|map| map.keys().map(String::as_str).collect())
            .unwrap_or_default();
        assert_eq!(keys, vec!["error", "message", "trace_id"]);
        assert_eq!(body["error"], json!("Internal server error"));
        assert!(body["trace_id"].as_str().is_some_and(|id| !id.is_empty()));
        assert!(!body.to_string().contains("10.0.0.7"));
    }

    #[tokio::test]
    async fn agent_rejects_an_empty_message() {
        let (app, _) = app(None).await;

        let response =
            app.oneshot(agent_request(Some("token-1"), json!({}))).await.expect("response");

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert!(body["error"].as_str().is_some_and(|message| !message.is_empty()));
    }

    #[tokio::test]
    async fn agent_returns_dashboard_components_for_explicit_insights_requests() {
        let (app, _) = app(None).await;

        let response = app
            .oneshot(agent_request(
                Some("token-1"),
                json!({
                    "message": "show my dashboard",
                    "context": { "agent": "insights", "action": "generate_dashboard" }
                }),
            ))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["agentType"], json!("insights"));
        assert_eq!(body["confidence"], json!(100));
        assert_eq!(body["components"].as_array().map(Vec::len), Some(3));
        assert!(body["conversationId"].as_str().is_some_and(|id| !id.is_empty()));
    }

    #[tokio::test]
    async fn agent_maps_conversation_lookup_failures() {
        let (app, repositories) = app(None).await;
        let foreign = Conversation::start(
            ConversationId("conv-foreign".to_string()),
            UserId::from("therapist-2"),
            chrono::Utc::now(),
        );
        repositories.conversations.save(&foreign).await.expect("save");

        let missing = app
            .clone()
            .oneshot(agent_request(
                Some("token-1"),
                json!({ "message": "hello", "conversationId": "conv-missing" }),
            ))
            .await
            .expect("response");
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let forbidden = app
            .oneshot(agent_request(
                Some("token-1"),
                json!({ "message": "hello", "conversationId": "conv-foreign" }),
            ))
            .await
            .expect("response");
        assert_eq!(forbidden.status(), StatusCode::FORBIDDEN);
        assert_eq!(json_body(forbidden).await, json!({ "error": "Forbidden" }));
    }

    #[tokio::test]
    async fn calendar_sync_checks_the_cron_secret() {
        let (app, _) = app(Some("s3cret")).await;

        let rejected = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/calendar/sync")
                    .header(CRON_SECRET_HEADER, "wrong")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(rejected.status(), StatusCode::UNAUTHORIZED);

        let accepted = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/calendar/sync")
                    .header(CRON_SECRET_HEADER, "s3cret")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(accepted.status(), StatusCode::OK);
        let body = json_body(accepted).await;
        assert_eq!(body["success"], json!(true));
        assert_eq!(body["calendarsSynced"], json!(0));
        assert_eq!(body["calendarsFailed"], json!(0));
        assert!(body.get("errors").is_none());
    }
}
