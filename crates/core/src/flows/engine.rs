use thiserror::Error;

use crate::audit::{AuditCategory, AuditContext, AuditOutcome, AuditSink};
use crate::flows::states::{
    FlowAction, FlowContext, FlowEvent, FlowState, FlowType, TransitionOutcome,
};

pub trait FlowDefinition {
    fn flow_type(&self) -> FlowType;
    fn initial_state(&self) -> FlowState;
    fn transition(
        &self,
        current: &FlowState,
        event: &FlowEvent,
        context: &FlowContext,
    ) -> Result<TransitionOutcome, FlowTransitionError>;
}

/// Questionnaire lifecycle: any number of field edits, then a single submit.
#[derive(Clone, Debug, Default)]
pub struct FollowUpFlow;

impl FlowDefinition for FollowUpFlow {
    fn flow_type(&self) -> FlowType {
        FlowType::FollowUp
    }

    fn initial_state(&self) -> FlowState {
        FlowState::Initialized
    }

    fn transition(
        &self,
        current: &FlowState,
        event: &FlowEvent,
        context: &FlowContext,
    ) -> Result<TransitionOutcome, FlowTransitionError> {
        transition_follow_up(current, event, context)
    }
}

pub struct FlowEngine<F> {
    flow: F,
}

impl<F> FlowEngine<F>
where
    F: FlowDefinition,
{
    pub fn new(flow: F) -> Self {
        Self { flow }
    }

    pub fn flow_type(&self) -> FlowType {
        self.flow.flow_type()
    }

    pub fn initial_state(&self) -> FlowState {
        self.flow.initial_state()
    }

    pub fn apply(
        &self,
        current: &FlowState,
        event: &FlowEvent,
        context: &FlowContext,
    ) -> Result<TransitionOutcome, FlowTransitionError> {
        self.flow.transition(current, event, context)
    }

    pub fn apply_with_audit<S>(
        &self,
        current: &FlowState,
        event: &FlowEvent,
        context: &FlowContext,
        sink: &S,
        audit: &AuditContext,
    ) -> Result<TransitionOutcome, FlowTransitionError>
    where
        S: AuditSink + ?Sized,
    {
        let result = self.apply(current, event, context);
        match &result {
            Ok(outcome) => sink.emit(
                audit
                    .event("flow.transition_applied", AuditCategory::Flow, AuditOutcome::Success)
                    .with_metadata("from", outcome.from.as_str())
                    .with_metadata("to", outcome.to.as_str())
                    .with_metadata("event", format!("{:?}", outcome.event)),
            ),
            Err(error) => sink.emit(
                audit
                    .event("flow.transition_rejected", AuditCategory::Flow, AuditOutcome::Rejected)
                    .with_metadata("error", error.to_string()),
            ),
        }
        result
    }
}

impl Default for FlowEngine<FollowUpFlow> {
    fn default() -> Self {
        Self::new(FollowUpFlow)
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FlowTransitionError {
    #[error("missing required fields before transition from {state:?}: {missing_fields:?}")]
    MissingRequiredFields { state: FlowState, missing_fields: Vec<String> },
    #[error("invalid transition from {state:?} using event {event:?}")]
    InvalidTransition { state: FlowState, event: FlowEvent },
}

fn transition_follow_up(
    current: &FlowState,
    event: &FlowEvent,
    context: &FlowContext,
) -> Result<TransitionOutcome, FlowTransitionError> {
    use FlowState::{Completed, Initialized};

    let (to, actions) = match (current, event) {
        (Initialized, FlowEvent::FieldChanged { field }) => (
            Initialized,
            vec![
                FlowAction::MergeResponse { field: field.clone() },
                FlowAction::RefreshComponent { field: field.clone() },
            ],
        ),
        (Initialized, FlowEvent::Submitted) => {
            if !context.missing_required_fields.is_empty() {
                return Err(FlowTransitionError::MissingRequiredFields {
                    state: *current,
                    missing_fields: context.missing_required_fields.clone(),
                });
            }
            (Completed, vec![FlowAction::PersistResponses, FlowAction::MarkSurfaceCompleted])
        }
        (Completed, _) => {
            return Err(FlowTransitionError::InvalidTransition {
                state: *current,
                event: event.clone(),
            });
        }
    };

    Ok(TransitionOutcome { from: *current, to, event: event.clone(), actions })
}
