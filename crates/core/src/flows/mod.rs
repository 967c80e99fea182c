pub mod engine;
pub mod states;

pub use engine::{FlowDefinition, FlowEngine, FlowTransitionError, FollowUpFlow};
pub use states::{FlowAction, FlowContext, FlowEvent, FlowState, FlowType, TransitionOutcome};
