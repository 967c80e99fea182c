//! Request pipeline for `POST /api/v1/agent`:
//! authenticate, load or create the conversation, verify ownership, classify,
//! dispatch to the agent node, persist the turn, audit, respond.

use std::time::Instant;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use tandem_core::domain::conversation::{Conversation, ConversationId};
use tandem_core::domain::execution::{
    AgentExecution, ExecutionId, ExecutionStatus, ModelPricing, TokenUsage,
};
use tandem_core::domain::identity::{bearer_token_digest, UserId};
use tandem_core::domain::intent::{AgentIntent, ClassificationSource, IntentClassification};
use tandem_core::surface::SurfaceComponent;
use tandem_db::repositories::RepositoryError;

use crate::classifier::IntentClassifier;
use crate::nodes::{self, AgentDeps, AgentError, AgentState, AgentUpdate, ToolExecution};

pub const TIMEOUT_APOLOGY: &str =
    "I'm sorry, this is taking longer than expected. Please try again in a moment.";
const EXPLICIT_CONFIDENCE: u8 = 100;

#[derive(Clone, Debug, Default)]
pub struct AgentRequest {
    pub bearer_token: Option<String>,
    pub message: String,
    pub context: Option<Map<String, Value>>,
    pub conversation_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentResponse {
    pub conversation_id: ConversationId,
    pub agent_type: AgentIntent,
    pub response: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolExecution>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub components: Option<Vec<SurfaceComponent>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
    pub confidence: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Unauthorized")]
    Unauthorized,
    #[error("{0}")]
    Validation(String),
    #[error("Forbidden")]
    Forbidden,
    #[error("conversation `{0}` not found")]
    NotFound(String),
    #[error("conversation was updated concurrently: {0}")]
    Conflict(String),
    #[error("internal error (trace id {trace_id})")]
    Internal { trace_id: String },
}

pub struct Orchestrator {
    deps: AgentDeps,
    classifier: IntentClassifier,
    pricing: ModelPricing,
}

/// Per-request bookkeeping carried from dispatch to the audit row.
struct Turn {
    correlation_id: String,
    now: DateTime<Utc>,
    classification: IntentClassification,
    duration_ms: u64,
}

impl Orchestrator {
    pub fn new(deps: AgentDeps) -> Self {
        let classifier = IntentClassifier::new(deps.llm.clone());
        Self { deps, classifier, pricing: ModelPricing::default() }
    }

    pub fn with_pricing(mut self, pricing: ModelPricing) -> Self {
        self.pricing = pricing;
        self
    }

    pub fn deps(&self) -> &AgentDeps {
        &self.deps
    }

    /// Resolves the caller without running a turn.
    pub async fn authorize(&self, bearer_token: Option<&str>) -> Result<UserId, OrchestratorError> {
        let correlation_id = Uuid::new_v4().to_string();
        self.authenticate(bearer_token, Utc::now(), &correlation_id).await
    }

    pub async fn handle(&self, request: AgentRequest) -> Result<AgentResponse, OrchestratorError> {
        let correlation_id = Uuid::new_v4().to_string();
        let now = Utc::now();

        let user_id =
            self.authenticate(request.bearer_token.as_deref(), now, &correlation_id).await?;
        let message = request.message.trim();
        if message.is_empty() {
            return Err(OrchestratorError::Validation("message must not be empty".to_string()));
        }
        let context = request.context.unwrap_or_default();
        let mut conversation = self
            .load_or_create(request.conversation_id.as_deref(), &user_id, now, &correlation_id)
            .await?;

        let classification = match explicit_intent(&context) {
            Some(intent) => IntentClassification {
                intent,
                confidence: EXPLICIT_CONFIDENCE,
                reasoning: vec!["agent requested explicitly".to_string()],
                source: ClassificationSource::Explicit,
            },
            None => self.classifier.classify(message, &context).await,
        };
        info!(
            event_name = "agent.dispatch",
            correlation_id = %correlation_id,
            conversation_id = %conversation.id.0,
            intent = classification.intent.as_str(),
            confidence = classification.confidence,
        );

        let state = AgentState {
            user_id,
            conversation_id: conversation.id.clone(),
            message: message.to_string(),
            history: conversation.messages.clone(),
            context: context.clone(),
            correlation_id: correlation_id.clone(),
            now,
        };
        let started = Instant::now();
        let result = nodes::dispatch(classification.intent, &state, &self.deps).await;
        let turn = Turn {
            correlation_id,
            now,
            classification,
            duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        };

        match result {
            Ok(update) => self.complete(&mut conversation, message, &context, update, &turn).await,
            Err(error) if error.is_timeout() => {
                self.apologise(&mut conversation, message, &context, error.tool_calls(), &turn)
                    .await
            }
            Err(error) => {
                self.record_failure(&conversation.id, &turn, error.tool_calls(), &error.to_string())
                    .await;
                Err(match error {
                    AgentError::InvalidAction(reason) => OrchestratorError::Validation(reason),
                    other => {
                        error!(
                            event_name = "agent.failed",
                            correlation_id = %turn.correlation_id,
                            error = %other,
                        );
                        OrchestratorError::Internal { trace_id: turn.correlation_id.clone() }
                    }
                })
            }
        }
    }

    async fn authenticate(
        &self,
        bearer_token: Option<&str>,
        now: DateTime<Utc>,
        correlation_id: &str,
    ) -> Result<UserId, OrchestratorError> {
        let token = bearer_token
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .ok_or(OrchestratorError::Unauthorized)?;
        let session = self
            .deps
            .repositories
            .auth
            .find_session(&bearer_token_digest(token))
            .await
            .map_err(|error| internal(error, correlation_id))?;
        match session {
            Some(session) if session.is_active_at(now) => Ok(session.user_id),
            _ => Err(OrchestratorError::Unauthorized),
        }
    }

    async fn load_or_create(
        &self,
        conversation_id: Option<&str>,
        user_id: &UserId,
        now: DateTime<Utc>,
        correlation_id: &str,
    ) -> Result<Conversation, OrchestratorError> {
        let Some(id) = conversation_id.map(str::trim).filter(|id| !id.is_empty()) else {
            return Ok(Conversation::start(
                ConversationId(Uuid::new_v4().to_string()),
                user_id.clone(),
                now,
            ));
        };

        let conversation = self
            .deps
            .repositories
            .conversations
            .find_by_id(&ConversationId(id.to_string()))
            .await
            .map_err(|error| internal(error, correlation_id))?
            .ok_or_else(|| OrchestratorError::NotFound(id.to_string()))?;
        if !conversation.is_owned_by(user_id) {
            warn!(
                event_name = "conversation.forbidden",
                correlation_id = %correlation_id,
                conversation_id = %id,
                user_id = %user_id,
            );
            return Err(OrchestratorError::Forbidden);
        }
        Ok(conversation)
    }

    async fn complete(
        &self,
        conversation: &mut Conversation,
        message: &str,
        context: &Map<String, Value>,
        update: AgentUpdate,
        turn: &Turn,
    ) -> Result<AgentResponse, OrchestratorError> {
        if let Err(error) =
            self.persist_turn(conversation, message, &update.response, context, turn).await
        {
            self.record_failure(&conversation.id, turn, &update.tool_calls, &error.to_string())
                .await;
            return Err(error);
        }

        let cost = self.pricing.cost(&update.usage);
        let mut metadata = update.metadata;
        if !update.risk_flags.is_empty() {
            metadata.insert("risk_flags".to_string(), Value::Array(update.risk_flags));
        }

        let mut audit_metadata = audit_metadata(turn);
        for (key, value) in &metadata {
            audit_metadata.entry(key.clone()).or_insert_with(|| value.clone());
        }
        self.append_execution(AgentExecution {
            id: ExecutionId(Uuid::new_v4().to_string()),
            conversation_id: conversation.id.clone(),
            agent_type: turn.classification.intent,
            tool_calls: serde_json::to_value(&update.tool_calls).unwrap_or(Value::Null),
            tokens_used: update.usage.total(),
            cost_usd: cost,
            duration_ms: turn.duration_ms,
            status: ExecutionStatus::Success,
            metadata: Value::Object(audit_metadata),
            created_at: turn.now,
        })
        .await;

        let has_usage = update.usage.total() > 0;
        Ok(AgentResponse {
            conversation_id: conversation.id.clone(),
            agent_type: turn.classification.intent,
            response: update.response,
            tool_calls: (!update.tool_calls.is_empty()).then_some(update.tool_calls),
            components: update.components,
            metadata: (!metadata.is_empty()).then_some(metadata),
            confidence: turn.classification.confidence,
            usage: has_usage.then_some(update.usage),
            cost: has_usage.then_some(cost),
            error: None,
        })
    }

    /// A timed-out model call still answers the user; the turn is kept so the
    /// conversation id stays valid, and the audit row is marked failed. Tools
    /// that already ran are reported in both.
    async fn apologise(
        &self,
        conversation: &mut Conversation,
        message: &str,
        context: &Map<String, Value>,
        tool_calls: &[ToolExecution],
        turn: &Turn,
    ) -> Result<AgentResponse, OrchestratorError> {
        warn!(
            event_name = "agent.timeout",
            correlation_id = %turn.correlation_id,
            conversation_id = %conversation.id.0,
        );
        self.persist_turn(conversation, message, TIMEOUT_APOLOGY, context, turn).await?;
        self.record_failure(&conversation.id, turn, tool_calls, "timeout").await;

        Ok(AgentResponse {
            conversation_id: conversation.id.clone(),
            agent_type: turn.classification.intent,
            response: TIMEOUT_APOLOGY.to_string(),
            tool_calls: (!tool_calls.is_empty()).then(|| tool_calls.to_vec()),
            components: None,
            metadata: None,
            confidence: turn.classification.confidence,
            usage: None,
            cost: None,
            error: Some("timeout".to_string()),
        })
    }

    async fn persist_turn(
        &self,
        conversation: &mut Conversation,
        message: &str,
        reply: &str,
        context: &Map<String, Value>,
        turn: &Turn,
    ) -> Result<(), OrchestratorError> {
        conversation.record_turn(message, reply, turn.classification.intent, turn.now);
        conversation.merge_context(context);
        match self.deps.repositories.conversations.save(conversation).await {
            Ok(version) => {
                conversation.version = version;
                Ok(())
            }
            Err(RepositoryError::Conflict(detail)) => {
                warn!(
                    event_name = "conversation.conflict",
                    correlation_id = %turn.correlation_id,
                    conversation_id = %conversation.id.0,
                );
                Err(OrchestratorError::Conflict(detail))
            }
            Err(error) => Err(internal(error, &turn.correlation_id)),
        }
    }

    async fn record_failure(
        &self,
        conversation_id: &ConversationId,
        turn: &Turn,
        tool_calls: &[ToolExecution],
        reason: &str,
    ) {
        let mut metadata = audit_metadata(turn);
        metadata.insert("error".to_string(), Value::from(reason));
        self.append_execution(AgentExecution {
            id: ExecutionId(Uuid::new_v4().to_string()),
            conversation_id: conversation_id.clone(),
            agent_type: turn.classification.intent,
            tool_calls: serde_json::to_value(tool_calls).unwrap_or(Value::Null),
            tokens_used: 0,
            cost_usd: Decimal::ZERO,
            duration_ms: turn.duration_ms,
            status: ExecutionStatus::Failed,
            metadata: Value::Object(metadata),
            created_at: turn.now,
        })
        .await;
    }

    async fn append_execution(&self, execution: AgentExecution) {
        let execution_id = execution.id.0.clone();
        if let Err(error) = self.deps.repositories.executions.append(execution).await {
            warn!(
                event_name = "audit.write_failed",
                execution_id = %execution_id,
                error = %error,
                "agent execution audit row was not stored"
            );
        }
    }
}

fn explicit_intent(context: &Map<String, Value>) -> Option<AgentIntent> {
    context.get("agent").and_then(Value::as_str).and_then(AgentIntent::parse)
}

fn audit_metadata(turn: &Turn) -> Map<String, Value> {
    let mut metadata = Map::new();
    metadata.insert("correlation_id".to_string(), Value::from(turn.correlation_id.clone()));
    metadata.insert("confidence".to_string(), Value::from(turn.classification.confidence));
    metadata.insert(
        "classification_source".to_string(),
        serde_json::to_value(turn.classification.source).unwrap_or(Value::Null),
    );
    metadata.insert("reasoning".to_string(), Value::from(turn.classification.reasoning.clone()));
    metadata
}

fn internal(error: RepositoryError, correlation_id: &str) -> OrchestratorError {
    error!(
        event_name = "agent.repository_failed",
        correlation_id = %correlation_id,
        error = %error,
    );
    OrchestratorError::Internal { trace_id: correlation_id.to_string() }
}
