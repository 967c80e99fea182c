pub mod audit;
pub mod availability;
pub mod config;
pub mod domain;
pub mod errors;
pub mod flows;
pub mod surface;

pub use availability::find_free_slots;
pub use domain::appointment::{Appointment, AppointmentId, AppointmentStatus, BookingOutcome};
pub use domain::calendar::{
    intervals_overlap, AvailabilityPreferences, CalendarEvent, CalendarIntegration,
    CalendarSource, DateRange, TeamVisibility, TimeSlot, WorkingHours,
};
pub use domain::clinical::{
    Escalation, EscalationId, Goal, NotificationStatus, PatientMemory, RiskFlag, RiskFlagId,
    RiskSeverity,
};
pub use domain::conversation::{Conversation, ConversationId, ConversationMessage, MessageRole};
pub use domain::execution::{AgentExecution, ExecutionId, ExecutionStatus, TokenUsage};
pub use domain::followup::{FollowUpSession, FollowUpSessionId, FollowUpTemplate};
pub use domain::identity::{bearer_token_digest, AuthSession, UserId};
pub use domain::intent::{AgentIntent, ClassificationSource, IntentClassification};
pub use domain::proposal::{ProposalId, ProposalStatus, SlotProposal};
pub use errors::DomainError;
pub use surface::{apply_action, Surface, SurfaceAction, SurfaceComponent, SurfaceError};
