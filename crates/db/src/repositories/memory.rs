use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

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
use tandem_core::domain::proposal::{ProposalId, ProposalStatus, SlotProposal};
use tandem_core::flows::FlowState;

use super::{
    AppointmentRepository, AuthRepository, CalendarRepository, ClinicalRepository,
    ConversationRepository, ExecutionRepository, FollowUpRepository, ProposalRepository,
    RepositoryError,
};

#[derive(Default)]
pub struct InMemoryAuthRepository {
    sessions: RwLock<HashMap<String, AuthSession>>,
}

#[async_trait::async_trait]
impl AuthRepository for InMemoryAuthRepository {
    async fn find_session(
        &self,
        token_sha256: &str,
    ) -> Result<Option<AuthSession>, RepositoryError> {
        Ok(self.sessions.read().await.get(token_sha256).cloned())
    }

    async fn save_session(&self, session: AuthSession) -> Result<(), RepositoryError> {
        self.sessions.write().await.insert(session.token_sha256.clone(), session);
        Ok(())
    }
}

struct CachedEvent {
    event: CalendarEvent,
    expires_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct InMemoryCalendarRepository {
    integrations: RwLock<BTreeMap<(UserId, CalendarSource), CalendarIntegration>>,
    events: RwLock<HashMap<(UserId, CalendarSource), Vec<CachedEvent>>>,
    preferences: RwLock<HashMap<UserId, AvailabilityPreferences>>,
    visibility: RwLock<BTreeMap<UserId, TeamVisibility>>,
}

#[async_trait::async_trait]
impl CalendarRepository for InMemoryCalendarRepository {
    async fn find_integration(
        &self,
        owner_id: &UserId,
        provider: CalendarSource,
    ) -> Result<Option<CalendarIntegration>, RepositoryError> {
        let integrations = self.integrations.read().await;
        Ok(integrations.get(&(owner_id.clone(), provider)).cloned())
    }

    async fn save_integration(
        &self,
        integration: CalendarIntegration,
    ) -> Result<(), RepositoryError> {
        let key = (integration.owner_id.clone(), integration.provider);
        self.integrations.write().await.insert(key, integration);
        Ok(())
    }

    async fn list_connected_integrations(
        &self,
        owner_id: Option<&UserId>,
    ) -> Result<Vec<CalendarIntegration>, RepositoryError> {
        let integrations = self.integrations.read().await;
        Ok(integrations
            .values()
            .filter(|integration| integration.is_connected)
            .filter(|integration| owner_id.map_or(true, |owner| &integration.owner_id == owner))
            .cloned()
            .collect())
    }

    async fn disconnect(
        &self,
        owner_id: &UserId,
        provider: CalendarSource,
        _now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let key = (owner_id.clone(), provider);
        let mut integrations = self.integrations.write().await;
        let mut events = self.events.write().await;
        events.remove(&key);
        Ok(match integrations.get_mut(&key) {
            Some(integration) => {
                integration.is_connected = false;
                true
            }
            None => false,
        })
    }

    async fn mark_synced(
        &self,
        owner_id: &UserId,
        provider: CalendarSource,
        synced_at: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let mut integrations = self.integrations.write().await;
        if let Some(integration) = integrations.get_mut(&(owner_id.clone(), provider)) {
            integration.last_synced_at = Some(synced_at);
        }
        Ok(())
    }

    async fn replace_events(
        &self,
        owner_id: &UserId,
        source: CalendarSource,
        events: Vec<CalendarEvent>,
        _synced_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let cached = events.into_iter().map(|event| CachedEvent { event, expires_at }).collect();
        self.events.write().await.insert((owner_id.clone(), source), cached);
        Ok(())
    }

    async fn list_events(
        &self,
        owner_id: &UserId,
        range: &DateRange,
        now: DateTime<Utc>,
    ) -> Result<Vec<CalendarEvent>, RepositoryError> {
        let events = self.events.read().await;
        let mut listed: Vec<CalendarEvent> = events
            .iter()
            .filter(|((owner, _), _)| owner == owner_id)
            .flat_map(|(_, cached)| cached.iter())
            .filter(|cached| cached.expires_at > now)
            .filter(|cached| cached.event.overlaps(range.start, range.end))
            .map(|cached| cached.event.clone())
            .collect();
        listed.sort_by(|left, right| {
            (left.start, left.end, &left.id).cmp(&(right.start, right.end, &right.id))
        });
        Ok(listed)
    }

    async fn find_preferences(
        &self,
        owner_id: &UserId,
    ) -> Result<Option<AvailabilityPreferences>, RepositoryError> {
        Ok(self.preferences.read().await.get(owner_id).cloned())
    }

    async fn save_preferences(
        &self,
        owner_id: &UserId,
        preferences: AvailabilityPreferences,
        _now: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        self.preferences.write().await.insert(owner_id.clone(), preferences);
        Ok(())
    }

    async fn find_team_visibility(
        &self,
        owner_id: &UserId,
    ) -> Result<Option<TeamVisibility>, RepositoryError> {
        Ok(self.visibility.read().await.get(owner_id).cloned())
    }

    async fn list_practice_members(
        &self,
        practice_id: &str,
    ) -> Result<Vec<TeamVisibility>, RepositoryError> {
        let visibility = self.visibility.read().await;
        Ok(visibility.values().filter(|row| row.practice_id == practice_id).cloned().collect())
    }

    async fn save_team_visibility(
        &self,
        visibility: TeamVisibility,
    ) -> Result<(), RepositoryError> {
        self.visibility.write().await.insert(visibility.owner_id.clone(), visibility);
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryAppointmentRepository {
    appointments: RwLock<Vec<Appointment>>,
}

#[async_trait::async_trait]
impl AppointmentRepository for InMemoryAppointmentRepository {
    async fn book(&self, appointment: Appointment) -> Result<BookingOutcome, RepositoryError> {
        let mut appointments = self.appointments.write().await;
        let conflict_count = appointments
            .iter()
            .filter(|existing| existing.therapist_id == appointment.therapist_id)
            .filter(|existing| existing.conflicts_with(appointment.start, appointment.end))
            .count();
        if conflict_count > 0 {
            return Ok(BookingOutcome::Conflict { conflict_count });
        }
        if appointments.iter().any(|existing| existing.id == appointment.id) {
            return Err(RepositoryError::Conflict(format!(
                "appointment `{}` already exists",
                appointment.id.0
            )));
        }
        appointments.push(appointment.clone());
        Ok(BookingOutcome::Booked(appointment))
    }

    async fn find_by_id(
        &self,
        id: &AppointmentId,
    ) -> Result<Option<Appointment>, RepositoryError> {
        let appointments = self.appointments.read().await;
        Ok(appointments.iter().find(|appointment| &appointment.id == id).cloned())
    }

    async fn list_for_participant(
        &self,
        user_id: &UserId,
        range: &DateRange,
    ) -> Result<Vec<Appointment>, RepositoryError> {
        let appointments = self.appointments.read().await;
        let mut listed: Vec<Appointment> = appointments
            .iter()
            .filter(|appointment| {
                &appointment.therapist_id == user_id || &appointment.patient_id == user_id
            })
            .filter(|appointment| appointment.start >= range.start && appointment.start < range.end)
            .cloned()
            .collect();
        listed.sort_by_key(|appointment| appointment.start);
        Ok(listed)
    }

    async fn list_blocking(
        &self,
        therapist_id: &UserId,
        range: &DateRange,
    ) -> Result<Vec<Appointment>, RepositoryError> {
        let appointments = self.appointments.read().await;
        let mut listed: Vec<Appointment> = appointments
            .iter()
            .filter(|appointment| &appointment.therapist_id == therapist_id)
            .filter(|appointment| appointment.conflicts_with(range.start, range.end))
            .cloned()
            .collect();
        listed.sort_by_key(|appointment| appointment.start);
        Ok(listed)
    }
}

#[derive(Default)]
pub struct InMemoryProposalRepository {
    proposals: RwLock<HashMap<String, SlotProposal>>,
}

#[async_trait::async_trait]
impl ProposalRepository for InMemoryProposalRepository {
    async fn insert(&self, proposal: SlotProposal) -> Result<(), RepositoryError> {
        self.proposals.write().await.insert(proposal.id.0.clone(), proposal);
        Ok(())
    }

    async fn find_by_id(&self, id: &ProposalId) -> Result<Option<SlotProposal>, RepositoryError> {
        Ok(self.proposals.read().await.get(&id.0).cloned())
    }

    async fn record_response(&self, proposal: SlotProposal) -> Result<(), RepositoryError> {
        let mut proposals = self.proposals.write().await;
        match proposals.get(&proposal.id.0) {
            Some(stored) if stored.status == ProposalStatus::Pending => {
                proposals.insert(proposal.id.0.clone(), proposal);
                Ok(())
            }
            _ => Err(RepositoryError::Conflict(format!(
                "proposal `{}` is no longer pending",
                proposal.id.0
            ))),
        }
    }

    async fn expire_due(&self, now: DateTime<Utc>) -> Result<u64, RepositoryError> {
        let mut proposals = self.proposals.write().await;
        let mut expired = 0;
        for proposal in proposals.values_mut().filter(|proposal| proposal.is_past_expiry(now)) {
            proposal.status = ProposalStatus::Expired;
            proposal.responded_at = Some(now);
            expired += 1;
        }
        Ok(expired)
    }
}

#[derive(Default)]
pub struct InMemoryConversationRepository {
    conversations: RwLock<HashMap<String, Conversation>>,
}

#[async_trait::async_trait]
impl ConversationRepository for InMemoryConversationRepository {
    async fn find_by_id(
        &self,
        id: &ConversationId,
    ) -> Result<Option<Conversation>, RepositoryError> {
        Ok(self.conversations.read().await.get(&id.0).cloned())
    }

    async fn save(&self, conversation: &Conversation) -> Result<u32, RepositoryError> {
        let mut conversations = self.conversations.write().await;
        let stored_version = conversations.get(&conversation.id.0).map(|stored| stored.version);
        let expected = if conversation.version == 0 { None } else { Some(conversation.version) };
        if stored_version != expected {
            return Err(RepositoryError::Conflict(format!(
                "conversation `{}` was modified since version {}",
                conversation.id.0, conversation.version
            )));
        }

        let mut next = conversation.clone();
        next.version = conversation.version.saturating_add(1);
        let version = next.version;
        conversations.insert(next.id.0.clone(), next);
        Ok(version)
    }
}

#[derive(Default)]
pub struct InMemoryExecutionRepository {
    executions: RwLock<Vec<AgentExecution>>,
}

#[async_trait::async_trait]
impl ExecutionRepository for InMemoryExecutionRepository {
    async fn append(&self, execution: AgentExecution) -> Result<(), RepositoryError> {
        self.executions.write().await.push(execution);
        Ok(())
    }

    async fn list_for_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<AgentExecution>, RepositoryError> {
        let executions = self.executions.read().await;
        let mut listed: Vec<AgentExecution> = executions
            .iter()
            .filter(|execution| &execution.conversation_id == conversation_id)
            .cloned()
            .collect();
        listed.sort_by(|left, right| {
            (left.created_at, &left.id.0).cmp(&(right.created_at, &right.id.0))
        });
        Ok(listed)
    }
}

#[derive(Default)]
pub struct InMemoryClinicalRepository {
    risk_flags: RwLock<Vec<RiskFlag>>,
    escalations: RwLock<HashMap<String, Escalation>>,
    memories: RwLock<Vec<PatientMemory>>,
    goals: RwLock<HashMap<String, Goal>>,
}

#[async_trait::async_trait]
impl ClinicalRepository for InMemoryClinicalRepository {
    async fn append_risk_flag(&self, flag: RiskFlag) -> Result<(), RepositoryError> {
        self.risk_flags.write().await.push(flag);
        Ok(())
    }

    async fn list_risk_flags(&self, patient_id: &UserId) -> Result<Vec<RiskFlag>, RepositoryError> {
        let flags = self.risk_flags.read().await;
        let mut listed: Vec<RiskFlag> =
            flags.iter().filter(|flag| &flag.patient_id == patient_id).cloned().collect();
        listed.sort_by(|left, right| right.flagged_at.cmp(&left.flagged_at));
        Ok(listed)
    }

    async fn insert_escalation(&self, escalation: Escalation) -> Result<(), RepositoryError> {
        self.escalations.write().await.insert(escalation.id.0.clone(), escalation);
        Ok(())
    }

    async fn update_escalation_status(
        &self,
        id: &EscalationId,
        status: NotificationStatus,
    ) -> Result<(), RepositoryError> {
        let mut escalations = self.escalations.write().await;
        let escalation = escalations.get_mut(&id.0).ok_or_else(|| {
            RepositoryError::Conflict(format!("escalation `{}` does not exist", id.0))
        })?;
        escalation.notification_status = status;
        Ok(())
    }

    async fn find_escalation(
        &self,
        id: &EscalationId,
    ) -> Result<Option<Escalation>, RepositoryError> {
        Ok(self.escalations.read().await.get(&id.0).cloned())
    }

    async fn insert_memory(&self, memory: PatientMemory) -> Result<(), RepositoryError> {
        self.memories.write().await.push(memory);
        Ok(())
    }

    async fn list_memories(
        &self,
        patient_id: &UserId,
    ) -> Result<Vec<PatientMemory>, RepositoryError> {
        let memories = self.memories.read().await;
        let mut listed: Vec<PatientMemory> =
            memories.iter().filter(|memory| &memory.patient_id == patient_id).cloned().collect();
        listed.sort_by(|left, right| right.created_at.cmp(&left.created_at));
        Ok(listed)
    }

    async fn save_goal(&self, goal: Goal) -> Result<(), RepositoryError> {
        self.goals.write().await.insert(goal.id.clone(), goal);
        Ok(())
    }

    async fn list_goals(&self, patient_id: &UserId) -> Result<Vec<Goal>, RepositoryError> {
        let goals = self.goals.read().await;
        let mut listed: Vec<Goal> =
            goals.values().filter(|goal| &goal.patient_id == patient_id).cloned().collect();
        listed.sort_by(|left, right| right.updated_at.cmp(&left.updated_at));
        Ok(listed)
    }
}

#[derive(Default)]
pub struct InMemoryFollowUpRepository {
    sessions: RwLock<HashMap<String, FollowUpSession>>,
    responses: RwLock<Vec<(String, FollowUpSession)>>,
}

impl InMemoryFollowUpRepository {
    /// Number of submitted response rows recorded so far.
    pub async fn response_count(&self) -> usize {
        self.responses.read().await.len()
    }
}

#[async_trait::async_trait]
impl FollowUpRepository for InMemoryFollowUpRepository {
    async fn save_session(&self, session: &FollowUpSession) -> Result<(), RepositoryError> {
        self.sessions.write().await.insert(session.id.0.clone(), session.clone());
        Ok(())
    }

    async fn latest_for_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Option<FollowUpSession>, RepositoryError> {
        let sessions = self.sessions.read().await;
        Ok(sessions
            .values()
            .filter(|session| &session.conversation_id == conversation_id)
            .max_by(|left, right| {
                (left.created_at, &left.id.0).cmp(&(right.created_at, &right.id.0))
            })
            .cloned())
    }

    async fn complete_session(
        &self,
        session: &FollowUpSession,
        response_id: &str,
    ) -> Result<(), RepositoryError> {
        if session.state != FlowState::Completed {
            return Err(RepositoryError::Conflict(format!(
                "follow-up session `{}` is {}, not completed",
                session.id.0,
                session.state.as_str()
            )));
        }
        let mut sessions = self.sessions.write().await;
        if sessions.get(&session.id.0).is_some_and(|stored| stored.state == FlowState::Completed) {
            return Err(RepositoryError::Conflict(format!(
                "follow-up session `{}` was already submitted",
                session.id.0
            )));
        }
        sessions.insert(session.id.0.clone(), session.clone());
        self.responses.write().await.push((response_id.to_owned(), session.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration, Utc};

    use tandem_core::domain::appointment::{
        Appointment, AppointmentId, AppointmentStatus, BookingOutcome,
    };
    use tandem_core::domain::calendar::{CalendarEvent, CalendarSource, DateRange, TimeSlot};
    use tandem_core::domain::conversation::{Conversation, ConversationId};
    use tandem_core::domain::identity::UserId;
    use tandem_core::domain::proposal::{ProposalId, ProposalStatus, SlotProposal};

    use crate::repositories::{
        AppointmentRepository, CalendarRepository, ConversationRepository,
        InMemoryAppointmentRepository, InMemoryCalendarRepository,
        InMemoryConversationRepository, InMemoryProposalRepository, ProposalRepository,
        RepositoryError,
    };

    fn parse_ts(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value).expect("timestamp").with_timezone(&Utc)
    }

    #[tokio::test]
    async fn in_memory_booking_matches_sql_conflict_rules() {
        let repo = InMemoryAppointmentRepository::default();
        let start = parse_ts("2026-03-02T10:00:00Z");
        let appointment = |id: &str, offset: i64| Appointment {
            id: AppointmentId(id.to_owned()),
            therapist_id: UserId::from("therapist-1"),
            patient_id: UserId::from("patient-1"),
            start: start + Duration::minutes(offset),
            end: start + Duration::minutes(offset + 60),
            status: AppointmentStatus::Pending,
            notes: None,
            created_at: start,
        };

        assert!(matches!(
            repo.book(appointment("a1", 0)).await.expect("book"),
            BookingOutcome::Booked(_)
        ));
        assert_eq!(
            repo.book(appointment("a2", 30)).await.expect("book"),
            BookingOutcome::Conflict { conflict_count: 1 }
        );
        assert!(matches!(
            repo.book(appointment("a3", 60)).await.expect("book"),
            BookingOutcome::Booked(_)
        ));
    }

    #[tokio::test]
    async fn in_memory_event_cache_honours_expiry_and_disconnect() {
        let repo = InMemoryCalendarRepository::default();
        let owner = UserId::from("therapist-1");
        let now = parse_ts("2026-03-02T08:00:00Z");
        let event = CalendarEvent {
            id: "evt-1".into(),
            owner_id: owner.clone(),
            title: "Supervision".into(),
            start: parse_ts("2026-03-02T10:00:00Z"),
            end: parse_ts("2026-03-02T11:00:00Z"),
            is_busy: true,
            source: CalendarSource::Google,
        };
        repo.replace_events(
            &owner,
            CalendarSource::Google,
            vec![event],
            now,
            now + Duration::hours(24),
        )
        .await
        .expect("replace");

        let range = DateRange::new(now, now + Duration::days(1)).expect("range");
        assert_eq!(repo.list_events(&owner, &range, now).await.expect("list").len(), 1);
        assert!(repo
            .list_events(&owner, &range, now + Duration::hours(25))
            .await
            .expect("list expired")
            .is_empty());

        assert!(!repo.disconnect(&owner, CalendarSource::Google, now).await.expect("disconnect"));
        assert!(repo.list_events(&owner, &range, now).await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn in_memory_proposals_and_conversations_reject_stale_writes() {
        let now = parse_ts("2026-03-02T08:00:00Z");
        let proposals = InMemoryProposalRepository::default();
        let slot = TimeSlot { start: now, end: now + Duration::minutes(50), confidence: 1.0 };
        let mut proposal = SlotProposal::new(
            ProposalId("p1".into()),
            UserId::from("therapist-1"),
            UserId::from("patient-1"),
            vec![slot],
            now,
        )
        .expect("proposal");
        proposals.insert(proposal.clone()).await.expect("insert");
        assert_eq!(proposals.expire_due(now + Duration::hours(48)).await.expect("sweep"), 1);
        proposal.transition_to(ProposalStatus::Declined, now).expect("decline");
        assert!(matches!(
            proposals.record_response(proposal).await,
            Err(RepositoryError::Conflict(_))
        ));

        let conversations = InMemoryConversationRepository::default();
        let conversation =
            Conversation::start(ConversationId("c1".into()), UserId::from("patient-1"), now);
        assert_eq!(conversations.save(&conversation).await.expect("insert"), 1);
        assert!(matches!(
            conversations.save(&conversation).await,
            Err(RepositoryError::Conflict(_))
        ));
    }
}
