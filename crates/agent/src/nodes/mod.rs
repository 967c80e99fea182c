//! Intent-specific agents. Each node turns one user message into an
//! [`AgentUpdate`]; the orchestrator owns persistence around it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{info, warn};

use tandem_core::audit::{AuditEvent, AuditSink};
use tandem_core::domain::conversation::{ConversationId, ConversationMessage, MessageRole};
use tandem_core::domain::execution::TokenUsage;
use tandem_core::domain::identity::UserId;
use tandem_core::domain::intent::AgentIntent;
use tandem_core::errors::DomainError;
use tandem_core::flows::{FlowEngine, FollowUpFlow};
use tandem_core::surface::SurfaceComponent;
use tandem_db::repositories::{RepositoryError, RepositorySet};

use crate::broadcast::SurfaceBroadcaster;
use crate::calendar::CalendarService;
use crate::llm::{ChatMessage, CompletionOptions, LlmClient, LlmError, ToolCall};
use crate::notify::Notifier;
use crate::tools::{
    booking_tools, insights_tools, session_tools, ToolContext, ToolError, ToolRegistry,
};

pub mod booking;
pub mod followup;
pub mod general;
pub mod insights;
pub mod session;

/// Prior messages replayed to the model on every turn.
pub const HISTORY_WINDOW: usize = 10;

#[derive(Clone, Debug)]
pub struct AgentState {
    pub user_id: UserId,
    pub conversation_id: ConversationId,
    pub message: String,
    pub history: Vec<ConversationMessage>,
    pub context: Map<String, Value>,
    pub correlation_id: String,
    pub now: DateTime<Utc>,
}

impl AgentState {
    pub fn tool_context(&self) -> ToolContext {
        ToolContext {
            user_id: self.user_id.clone(),
            conversation_id: self.conversation_id.clone(),
            now: self.now,
        }
    }

    pub fn context_str(&self, key: &str) -> Option<&str> {
        self.context.get(key).and_then(Value::as_str).map(str::trim).filter(|v| !v.is_empty())
    }

    /// Patient the turn is about: `context.patient_id`, else the caller.
    pub fn subject_id(&self) -> UserId {
        self.context_str("patient_id").map(UserId::from).unwrap_or_else(|| self.user_id.clone())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ToolExecution {
    pub call: ToolCall,
    pub result: Option<Value>,
    pub error: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct AgentUpdate {
    pub response: String,
    pub tool_calls: Vec<ToolExecution>,
    pub components: Option<Vec<SurfaceComponent>>,
    pub metadata: Map<String, Value>,
    pub risk_flags: Vec<Value>,
    pub usage: TokenUsage,
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Llm(#[from] LlmError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Tool(#[from] ToolError),
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("invalid action: {0}")]
    InvalidAction(String),
    /// The model failed after tools had already run; their results are kept for the audit.
    #[error("{source}")]
    AfterTools {
        #[source]
        source: LlmError,
        tool_calls: Vec<ToolExecution>,
    },
}

impl AgentError {
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Llm(error) | Self::AfterTools { source: error, .. } => error.is_timeout(),
            _ => false,
        }
    }

    pub fn tool_calls(&self) -> &[ToolExecution] {
        match self {
            Self::AfterTools { tool_calls, .. } => tool_calls,
            _ => &[],
        }
    }
}

/// Writes flow audit events to the log.
#[derive(Clone, Debug, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn emit(&self, event: AuditEvent) {
        info!(
            event_name = %event.event_type,
            correlation_id = %event.correlation_id,
            actor = %event.actor,
            outcome = ?event.outcome,
            metadata = ?event.metadata,
            "audit event"
        );
    }
}

/// Collaborators shared by every node.
pub struct AgentDeps {
    pub llm: Arc<dyn LlmClient>,
    pub repositories: RepositorySet,
    pub calendar: Arc<CalendarService>,
    pub notifier: Arc<dyn Notifier>,
    pub surfaces: Arc<dyn SurfaceBroadcaster>,
    pub audit: Arc<dyn AuditSink>,
    pub flows: FlowEngine<FollowUpFlow>,
    pub booking_tools: ToolRegistry,
    pub session_tools: ToolRegistry,
    pub insights_tools: ToolRegistry,
}

impl AgentDeps {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        repositories: RepositorySet,
        calendar: Arc<CalendarService>,
        notifier: Arc<dyn Notifier>,
        surfaces: Arc<dyn SurfaceBroadcaster>,
    ) -> Self {
        let booking_tools = booking_tools(
            calendar.clone(),
            repositories.appointments.clone(),
            repositories.proposals.clone(),
            notifier.clone(),
        );
        let session_tools = session_tools(repositories.clinical.clone(), notifier.clone());
        let insights_tools =
            insights_tools(repositories.appointments.clone(), repositories.clinical.clone());

        Self {
            llm,
            repositories,
            calendar,
            notifier,
            surfaces,
            audit: Arc::new(TracingAuditSink),
            flows: FlowEngine::default(),
            booking_tools,
            session_tools,
            insights_tools,
        }
    }

    pub fn with_audit_sink(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }
}

pub async fn dispatch(
    intent: AgentIntent,
    state: &AgentState,
    deps: &AgentDeps,
) -> Result<AgentUpdate, AgentError> {
    match intent {
        AgentIntent::Booking => booking::run(state, deps).await,
        AgentIntent::Session => session::run(state, deps).await,
        AgentIntent::Insights => insights::run(state, deps).await,
        AgentIntent::Followup => followup::run(state, deps).await,
        AgentIntent::General => general::run(state, deps).await,
    }
}

pub(crate) fn prompt_messages(system_prompt: String, state: &AgentState) -> Vec<ChatMessage> {
    let start = state.history.len().saturating_sub(HISTORY_WINDOW);
    let mut messages = vec![ChatMessage::system(system_prompt)];
    messages.extend(state.history[start..].iter().filter_map(|message| match message.role {
        MessageRole::User => Some(ChatMessage::user(message.content.clone())),
        MessageRole::Assistant => Some(ChatMessage::assistant(message.content.clone())),
        MessageRole::System | MessageRole::Tool => None,
    }));
    messages.push(ChatMessage::user(state.message.clone()));
    messages
}

/// Runs calls in order. A failing call is recorded and the rest still run.
pub(crate) async fn execute_tool_calls(
    tools: &ToolRegistry,
    calls: &[ToolCall],
    ctx: &ToolContext,
) -> Vec<ToolExecution> {
    let mut executions = Vec::with_capacity(calls.len());
    for call in calls {
        let execution = match tools.execute(&call.name, call.arguments.clone(), ctx).await {
            Ok(result) => ToolExecution { call: call.clone(), result: Some(result), error: None },
            Err(error) => {
                warn!(event_name = "tool.failed", tool = %call.name, error = %error);
                ToolExecution { call: call.clone(), result: None, error: Some(error.to_string()) }
            }
        };
        executions.push(execution);
    }
    executions
}

/// One model call with the given tools. When the model answers only with tool
/// calls, a second call without tools turns the results into a reply.
pub(crate) async fn run_tool_agent(
    state: &AgentState,
    deps: &AgentDeps,
    system_prompt: String,
    tools: &ToolRegistry,
) -> Result<AgentUpdate, AgentError> {
    let mut messages = prompt_messages(system_prompt, state);
    let options = CompletionOptions { tools: tools.definitions(), ..CompletionOptions::default() };
    let completion = deps.llm.complete(&messages, &options).await?;
    let mut usage = completion.usage;

    let executions =
        execute_tool_calls(tools, &completion.tool_calls, &state.tool_context()).await;
    let mut response = completion.content.trim().to_string();
    if response.is_empty() && !executions.is_empty() {
        let results = serde_json::to_string(&executions).unwrap_or_default();
        messages.push(ChatMessage::system(format!(
            "Tool results (JSON): {results}\nReply to the user based on these results."
        )));
        let follow_up = match deps.llm.complete(&messages, &CompletionOptions::default()).await {
            Ok(follow_up) => follow_up,
            Err(source) => return Err(AgentError::AfterTools { source, tool_calls: executions }),
        };
        usage.add(follow_up.usage);
        response = follow_up.content.trim().to_string();
    }

    Ok(AgentUpdate { response, tool_calls: executions, usage, ..AgentUpdate::default() })
}
