//! Follow-up check-in forms driven through the flow engine.
//!
//! `context.action` selects the step: absent or `start` opens a form,
//! `on_change_<field>` stores one answer, `submit` completes the form.

use serde_json::{Map, Value};
use tracing::info;
use uuid::Uuid;

use tandem_core::audit::AuditContext;
use tandem_core::domain::followup::{
    FollowUpSession, FollowUpSessionId, FollowUpTemplate, DEFAULT_TEMPLATE,
};
use tandem_core::errors::DomainError;
use tandem_core::flows::{
    FlowContext, FlowEvent, FlowState, FlowTransitionError, TransitionOutcome,
};
use tandem_db::repositories::RepositoryError;

use super::{AgentDeps, AgentError, AgentState, AgentUpdate};
use crate::broadcast::SurfaceUpdate;

pub async fn run(state: &AgentState, deps: &AgentDeps) -> Result<AgentUpdate, AgentError> {
    match state.context_str("action") {
        None | Some("start") => start(state, deps).await,
        Some("submit") => submit(state, deps).await,
        Some(action) => match action.strip_prefix("on_change_") {
            Some(field) if !field.is_empty() => change_field(state, deps, field).await,
            _ => Err(AgentError::InvalidAction(format!("unsupported follow-up action `{action}`"))),
        },
    }
}

async fn start(state: &AgentState, deps: &AgentDeps) -> Result<AgentUpdate, AgentError> {
    let name = state.context_str("template").unwrap_or(DEFAULT_TEMPLATE);
    let template = FollowUpTemplate::named(name)
        .ok_or_else(|| AgentError::InvalidAction(format!("unknown follow-up template `{name}`")))?;
    let session = FollowUpSession::start(
        FollowUpSessionId(Uuid::new_v4().to_string()),
        state.user_id.clone(),
        state.conversation_id.clone(),
        &template,
        state.now,
    )?;
    deps.repositories.followups.save_session(&session).await?;
    publish(state, deps, &session);
    info!(
        event_name = "followup.started",
        correlation_id = %state.correlation_id,
        session_id = %session.id.0,
        template = %template.name,
    );

    Ok(AgentUpdate {
        response: format!("{}: please answer the questions below.", template.title),
        components: Some(session.surface.components.clone()),
        metadata: session_metadata(&session),
        ..AgentUpdate::default()
    })
}

async fn change_field(
    state: &AgentState,
    deps: &AgentDeps,
    field: &str,
) -> Result<AgentUpdate, AgentError> {
    let (mut session, template) = active_session(state, deps).await?;
    let value = state.context.get("value").cloned().unwrap_or(Value::Null);
    let outcome = transition(
        state,
        deps,
        &session,
        FlowEvent::FieldChanged { field: field.to_string() },
        FlowContext::default(),
    )
    .map_err(rejected)?;
    session.apply_outcome(&outcome, &template, &value, state.now).map_err(invalid_answer)?;
    deps.repositories.followups.save_session(&session).await?;
    publish(state, deps, &session);

    Ok(AgentUpdate {
        response: "Got it, answer saved.".to_string(),
        components: Some(session.surface.component(field).cloned().into_iter().collect()),
        metadata: session_metadata(&session),
        ..AgentUpdate::default()
    })
}

async fn submit(state: &AgentState, deps: &AgentDeps) -> Result<AgentUpdate, AgentError> {
    let (mut session, template) = active_session(state, deps).await?;
    let context = session.submit_context(&template);
    let outcome = match transition(state, deps, &session, FlowEvent::Submitted, context) {
        Ok(outcome) => outcome,
        Err(FlowTransitionError::MissingRequiredFields { missing_fields, .. }) => {
            let mut metadata = session_metadata(&session);
            metadata.insert("missing_fields".to_string(), Value::from(missing_fields.clone()));
            return Ok(AgentUpdate {
                response: format!(
                    "Please answer before submitting: {}.",
                    missing_fields.join(", ")
                ),
                metadata,
                ..AgentUpdate::default()
            });
        }
        Err(error) => return Err(rejected(error)),
    };

    session.apply_outcome(&outcome, &template, &Value::Null, state.now)?;
    let response_id = Uuid::new_v4().to_string();
    match deps.repositories.followups.complete_session(&session, &response_id).await {
        Ok(()) => {}
        Err(RepositoryError::Conflict(_)) => {
            return Err(AgentError::InvalidAction(
                "this follow-up form was already submitted".to_string(),
            ));
        }
        Err(error) => return Err(error.into()),
    }
    publish(state, deps, &session);
    info!(
        event_name = "followup.completed",
        correlation_id = %state.correlation_id,
        session_id = %session.id.0,
        answers = session.responses.len(),
    );

    let mut metadata = session_metadata(&session);
    metadata.insert("responses".to_string(), Value::Object(session.responses.clone()));
    Ok(AgentUpdate {
        response: format!("Thank you for completing the {}.", template.title.to_lowercase()),
        components: Some(session.surface.components.clone()),
        metadata,
        ..AgentUpdate::default()
    })
}

async fn active_session(
    state: &AgentState,
    deps: &AgentDeps,
) -> Result<(FollowUpSession, FollowUpTemplate), AgentError> {
    let session = deps
        .repositories
        .followups
        .latest_for_conversation(&state.conversation_id)
        .await?
        .ok_or_else(|| {
            AgentError::InvalidAction(
                "no follow-up form was started in this conversation".to_string(),
            )
        })?;
    let template = FollowUpTemplate::named(&session.template).ok_or_else(|| {
        AgentError::InvalidAction(format!("unknown follow-up template `{}`", session.template))
    })?;
    Ok((session, template))
}

fn transition(
    state: &AgentState,
    deps: &AgentDeps,
    session: &FollowUpSession,
    event: FlowEvent,
    context: FlowContext,
) -> Result<TransitionOutcome, FlowTransitionError> {
    let audit = AuditContext::new(
        Some(state.conversation_id.clone()),
        state.correlation_id.clone(),
        state.user_id.as_str(),
    );
    deps.flows.apply_with_audit(&session.state, &event, &context, deps.audit.as_ref(), &audit)
}

fn rejected(error: FlowTransitionError) -> AgentError {
    match error {
        FlowTransitionError::InvalidTransition { state: FlowState::Completed, .. } => {
            AgentError::InvalidAction("this follow-up form is already completed".to_string())
        }
        other => AgentError::InvalidAction(other.to_string()),
    }
}

fn invalid_answer(error: DomainError) -> AgentError {
    match error {
        DomainError::InvalidFormField { .. } => AgentError::InvalidAction(error.to_string()),
        other => AgentError::Domain(other),
    }
}

fn publish(state: &AgentState, deps: &AgentDeps, session: &FollowUpSession) {
    deps.surfaces.publish(SurfaceUpdate {
        conversation_id: state.conversation_id.clone(),
        surface: session.surface.clone(),
    });
}

fn session_metadata(session: &FollowUpSession) -> Map<String, Value> {
    let mut metadata = Map::new();
    metadata.insert("followup_session_id".to_string(), Value::from(session.id.0.clone()));
    metadata.insert("template".to_string(), Value::from(session.template.clone()));
    metadata.insert("state".to_string(), Value::from(session.state.as_str()));
    metadata.insert("surface_version".to_string(), Value::from(session.surface.version));
    metadata
}
