use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowType {
    FollowUp,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FlowState {
    Initialized,
    Completed,
}

impl FlowState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initialized => "initialized",
            Self::Completed => "completed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "initialized" => Some(Self::Initialized),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowEvent {
    FieldChanged { field: String },
    Submitted,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct FlowContext {
    pub missing_required_fields: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowAction {
    MergeResponse { field: String },
    RefreshComponent { field: String },
    PersistResponses,
    MarkSurfaceCompleted,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionOutcome {
    pub from: FlowState,
    pub to: FlowState,
    pub event: FlowEvent,
    pub actions: Vec<FlowAction>,
}

#[cfg(test)]
mod tests {
    use super::FlowState;

    #[test]
    fn flow_state_storage_round_trip() {
        for state in [FlowState::Initialized, FlowState::Completed] {
            assert_eq!(FlowState::parse(state.as_str()), Some(state));
        }
        assert_eq!(FlowState::parse("archived"), None);
        assert!(FlowState::Completed.is_terminal());
    }
}
