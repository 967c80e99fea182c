use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use thiserror::Error;

use tandem_core::domain::appointment::{Appointment, AppointmentId, BookingOutcome};
use tandem_core::domain::calendar::{
    AvailabilityPreferences, CalendarEvent, CalendarIntegration, CalendarSource, DateRange,
    TeamVisibility,
};
use tandem_core::domain::clinical::{
    Escalation, EscalationId, Goal, NotificationStatus, PatientMemory, RiskFlag,
};
use tandem_core::domain::conversation::{Conversation, ConversationId};
use tandem_core::domain::execution::AgentExecution;
use tandem_core::domain::followup::FollowUpSession;
use tandem_core::domain::identity::{AuthSession, UserId};
use tandem_core::domain::proposal::{ProposalId, SlotProposal};

pub mod appointment;
pub mod auth;
pub mod calendar;
pub mod clinical;
pub mod conversation;
pub mod execution;
pub mod followup;
pub mod memory;
pub mod proposal;

pub use appointment::SqlAppointmentRepository;
pub use auth::SqlAuthRepository;
pub use calendar::SqlCalendarRepository;
pub use clinical::SqlClinicalRepository;
pub use conversation::SqlConversationRepository;
pub use execution::SqlExecutionRepository;
pub use followup::SqlFollowUpRepository;
pub use memory::{
    InMemoryAppointmentRepository, InMemoryAuthRepository, InMemoryCalendarRepository,
    InMemoryClinicalRepository, InMemoryConversationRepository, InMemoryExecutionRepository,
    InMemoryFollowUpRepository, InMemoryProposalRepository,
};
pub use proposal::SqlProposalRepository;

use crate::DbPool;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("concurrent update rejected: {0}")]
    Conflict(String),
}

#[async_trait]
pub trait AuthRepository: Send + Sync {
    async fn find_session(&self, token_sha256: &str)
        -> Result<Option<AuthSession>, RepositoryError>;
    async fn save_session(&self, session: AuthSession) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait CalendarRepository: Send + Sync {
    async fn find_integration(
        &self,
        owner_id: &UserId,
        provider: CalendarSource,
    ) -> Result<Option<CalendarIntegration>, RepositoryError>;

    /// Inserts or replaces the single integration row for `(owner, provider)`.
    async fn save_integration(&self, integration: CalendarIntegration)
        -> Result<(), RepositoryError>;

    /// Connected integrations, optionally narrowed to one owner.
    async fn list_connected_integrations(
        &self,
        owner_id: Option<&UserId>,
    ) -> Result<Vec<CalendarIntegration>, RepositoryError>;

    /// Flips `is_connected` off and drops cached events for the pair in one
    /// transaction. Returns whether an integration row existed.
    async fn disconnect(
        &self,
        owner_id: &UserId,
        provider: CalendarSource,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError>;

    async fn mark_synced(
        &self,
        owner_id: &UserId,
        provider: CalendarSource,
        synced_at: DateTime<Utc>,
    ) -> Result<(), RepositoryError>;

    /// Replaces every cached event for `(owner, source)` atomically.
    async fn replace_events(
        &self,
        owner_id: &UserId,
        source: CalendarSource,
        events: Vec<CalendarEvent>,
        synced_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<(), RepositoryError>;

    /// Unexpired cached events for the owner overlapping `range`, ordered by start.
    async fn list_events(
        &self,
        owner_id: &UserId,
        range: &DateRange,
        now: DateTime<Utc>,
    ) -> Result<Vec<CalendarEvent>, RepositoryError>;

    async fn find_preferences(
        &self,
        owner_id: &UserId,
    ) -> Result<Option<AvailabilityPreferences>, RepositoryError>;

    async fn save_preferences(
        &self,
        owner_id: &UserId,
        preferences: AvailabilityPreferences,
        now: DateTime<Utc>,
    ) -> Result<(), RepositoryError>;

    async fn find_team_visibility(
        &self,
        owner_id: &UserId,
    ) -> Result<Option<TeamVisibility>, RepositoryError>;

    async fn list_practice_members(
        &self,
        practice_id: &str,
    ) -> Result<Vec<TeamVisibility>, RepositoryError>;

    async fn save_team_visibility(&self, visibility: TeamVisibility)
        -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait AppointmentRepository: Send + Sync {
    /// Checks for overlapping pending/confirmed appointments and inserts in the
    /// same transaction.
    async fn book(&self, appointment: Appointment) -> Result<BookingOutcome, RepositoryError>;

    async fn find_by_id(&self, id: &AppointmentId)
        -> Result<Option<Appointment>, RepositoryError>;

    /// Appointments where the user is therapist or patient, starting inside `range`.
    async fn list_for_participant(
        &self,
        user_id: &UserId,
        range: &DateRange,
    ) -> Result<Vec<Appointment>, RepositoryError>;

    /// Pending or confirmed appointments of the therapist overlapping `range`.
    async fn list_blocking(
        &self,
        therapist_id: &UserId,
        range: &DateRange,
    ) -> Result<Vec<Appointment>, RepositoryError>;
}

#[async_trait]
pub trait ProposalRepository: Send + Sync {
    async fn insert(&self, proposal: SlotProposal) -> Result<(), RepositoryError>;

    async fn find_by_id(&self, id: &ProposalId) -> Result<Option<SlotProposal>, RepositoryError>;

    /// Persists a response. Fails with `Conflict` unless the stored row is still pending.
    async fn record_response(&self, proposal: SlotProposal) -> Result<(), RepositoryError>;

    /// Marks every pending proposal whose expiry has passed as expired.
    async fn expire_due(&self, now: DateTime<Utc>) -> Result<u64, RepositoryError>;
}

#[async_trait]
pub trait ConversationRepository: Send + Sync {
    async fn find_by_id(
        &self,
        id: &ConversationId,
    ) -> Result<Option<Conversation>, RepositoryError>;

    /// Inserts when `version == 0`, otherwise updates only if the stored version
    /// still matches. Returns the new version.
    async fn save(&self, conversation: &Conversation) -> Result<u32, RepositoryError>;
}

#[async_trait]
pub trait ExecutionRepository: Send + Sync {
    async fn append(&self, execution: AgentExecution) -> Result<(), RepositoryError>;

    async fn list_for_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<AgentExecution>, RepositoryError>;
}

#[async_trait]
pub trait ClinicalRepository: Send + Sync {
    async fn append_risk_flag(&self, flag: RiskFlag) -> Result<(), RepositoryError>;

    async fn list_risk_flags(&self, patient_id: &UserId) -> Result<Vec<RiskFlag>, RepositoryError>;

    async fn insert_escalation(&self, escalation: Escalation) -> Result<(), RepositoryError>;

    async fn update_escalation_status(
        &self,
        id: &EscalationId,
        status: NotificationStatus,
    ) -> Result<(), RepositoryError>;

    async fn find_escalation(&self, id: &EscalationId)
        -> Result<Option<Escalation>, RepositoryError>;

    async fn insert_memory(&self, memory: PatientMemory) -> Result<(), RepositoryError>;

    async fn list_memories(&self, patient_id: &UserId)
        -> Result<Vec<PatientMemory>, RepositoryError>;

    async fn save_goal(&self, goal: Goal) -> Result<(), RepositoryError>;

    async fn list_goals(&self, patient_id: &UserId) -> Result<Vec<Goal>, RepositoryError>;
}

#[async_trait]
pub trait FollowUpRepository: Send + Sync {
    async fn save_session(&self, session: &FollowUpSession) -> Result<(), RepositoryError>;

    async fn latest_for_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Option<FollowUpSession>, RepositoryError>;

    /// Stores the completed session and its submitted responses atomically.
    async fn complete_session(
        &self,
        session: &FollowUpSession,
        response_id: &str,
    ) -> Result<(), RepositoryError>;
}

/// Every repository the agent runtime needs, behind trait objects.
#[derive(Clone)]
pub struct RepositorySet {
    pub auth: Arc<dyn AuthRepository>,
    pub calendars: Arc<dyn CalendarRepository>,
    pub appointments: Arc<dyn AppointmentRepository>,
    pub proposals: Arc<dyn ProposalRepository>,
    pub conversations: Arc<dyn ConversationRepository>,
    pub executions: Arc<dyn ExecutionRepository>,
    pub clinical: Arc<dyn ClinicalRepository>,
    pub followups: Arc<dyn FollowUpRepository>,
}

impl RepositorySet {
    pub fn sql(pool: DbPool) -> Self {
        Self {
            auth: Arc::new(SqlAuthRepository::new(pool.clone())),
            calendars: Arc::new(SqlCalendarRepository::new(pool.clone())),
            appointments: Arc::new(SqlAppointmentRepository::new(pool.clone())),
            proposals: Arc::new(SqlProposalRepository::new(pool.clone())),
            conversations: Arc::new(SqlConversationRepository::new(pool.clone())),
            executions: Arc::new(SqlExecutionRepository::new(pool.clone())),
            clinical: Arc::new(SqlClinicalRepository::new(pool.clone())),
            followups: Arc::new(SqlFollowUpRepository::new(pool)),
        }
    }

    pub fn in_memory() -> Self {
        Self {
            auth: Arc::new(InMemoryAuthRepository::default()),
            calendars: Arc::new(InMemoryCalendarRepository::default()),
            appointments: Arc::new(InMemoryAppointmentRepository::default()),
            proposals: Arc::new(InMemoryProposalRepository::default()),
            conversations: Arc::new(InMemoryConversationRepository::default()),
            executions: Arc::new(InMemoryExecutionRepository::default()),
            clinical: Arc::new(InMemoryClinicalRepository::default()),
            followups: Arc::new(InMemoryFollowUpRepository::default()),
        }
    }
}

/// Fixed-width UTC encoding so that text comparison in SQL matches time order.
pub(crate) fn encode_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn decode_error(error: sqlx::Error) -> RepositoryError {
    RepositoryError::Decode(error.to_string())
}

pub(crate) fn parse_timestamp(
    column: &str,
    value: String,
) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(&value).map(|timestamp| timestamp.with_timezone(&Utc)).map_err(
        |error| {
            RepositoryError::Decode(format!("invalid timestamp in `{column}`: `{value}` ({error})"))
        },
    )
}

pub(crate) fn parse_optional_timestamp(
    column: &str,
    value: Option<String>,
) -> Result<Option<DateTime<Utc>>, RepositoryError> {
    value.map(|value| parse_timestamp(column, value)).transpose()
}

pub(crate) fn parse_u32(column: &str, value: i64) -> Result<u32, RepositoryError> {
    u32::try_from(value).map_err(|_| {
        RepositoryError::Decode(format!(
            "invalid value for `{column}` (expected non-negative u32): {value}"
        ))
    })
}

pub(crate) fn parse_json<T: serde::de::DeserializeOwned>(
    column: &str,
    value: &str,
) -> Result<T, RepositoryError> {
    serde_json::from_str(value)
        .map_err(|error| RepositoryError::Decode(format!("invalid json in `{column}`: {error}")))
}

pub(crate) fn encode_json<T: serde::Serialize>(
    column: &str,
    value: &T,
) -> Result<String, RepositoryError> {
    serde_json::to_string(value)
        .map_err(|error| RepositoryError::Decode(format!("cannot encode `{column}`: {error}")))
}

pub(crate) fn unknown_value(column: &str, value: &str) -> RepositoryError {
    RepositoryError::Decode(format!("unknown value for `{column}`: `{value}`"))
}
