use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::calendar::TimeSlot;
use crate::domain::identity::UserId;
use crate::errors::DomainError;

pub const MIN_PROPOSED_SLOTS: usize = 1;
pub const MAX_PROPOSED_SLOTS: usize = 5;
pub const PROPOSAL_TTL_HOURS: i64 = 48;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProposalId(pub String);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    Pending,
    Accepted,
    Declined,
    Expired,
}

impl ProposalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
            Self::Declined => "declined",
            Self::Expired => "expired",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "accepted" => Some(Self::Accepted),
            "declined" => Some(Self::Declined),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SlotProposal {
    pub id: ProposalId,
    pub proposer_id: UserId,
    pub recipient_id: UserId,
    pub proposed_slots: Vec<TimeSlot>,
    pub status: ProposalStatus,
    pub accepted_slot: Option<TimeSlot>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub responded_at: Option<DateTime<Utc>>,
}

impl SlotProposal {
    /// Builds a pending proposal with the fixed patient-facing expiry window.
    pub fn new(
        id: ProposalId,
        proposer_id: UserId,
        recipient_id: UserId,
        proposed_slots: Vec<TimeSlot>,
        now: DateTime<Utc>,
    ) -> Result<Self, DomainError> {
        let count = proposed_slots.len();
        if !(MIN_PROPOSED_SLOTS..=MAX_PROPOSED_SLOTS).contains(&count) {
            return Err(DomainError::InvalidProposalSlotCount(count));
        }
        if let Some(slot) = proposed_slots.iter().find(|slot| slot.start >= slot.end) {
            return Err(DomainError::InvariantViolation(format!(
                "proposed slot starting {} must end after it starts",
                slot.start.to_rfc3339()
            )));
        }

        Ok(Self {
            id,
            proposer_id,
            recipient_id,
            proposed_slots,
            status: ProposalStatus::Pending,
            accepted_slot: None,
            created_at: now,
            expires_at: now + Duration::hours(PROPOSAL_TTL_HOURS),
            responded_at: None,
        })
    }

    pub fn can_transition_to(&self, next: ProposalStatus) -> bool {
        matches!(
            (self.status, next),
            (ProposalStatus::Pending, ProposalStatus::Accepted)
                | (ProposalStatus::Pending, ProposalStatus::Declined)
                | (ProposalStatus::Pending, ProposalStatus::Expired)
        )
    }

    pub fn transition_to(
        &mut self,
        next: ProposalStatus,
        now: DateTime<Utc>,
    ) -> Result<(), DomainError> {
        if !self.can_transition_to(next) {
            return Err(DomainError::InvalidProposalTransition { from: self.status, to: next });
        }
        self.status = next;
        self.responded_at = Some(now);
        Ok(())
    }

    pub fn accept(&mut self, slot_index: usize, now: DateTime<Utc>) -> Result<(), DomainError> {
        let slot = self.proposed_slots.get(slot_index).copied().ok_or_else(|| {
            DomainError::InvariantViolation(format!(
                "slot index {slot_index} is out of range for {} proposed slots",
                self.proposed_slots.len()
            ))
        })?;
        self.transition_to(ProposalStatus::Accepted, now)?;
        self.accepted_slot = Some(slot);
        Ok(())
    }

    pub fn is_past_expiry(&self, now: DateTime<Utc>) -> bool {
        self.status == ProposalStatus::Pending && self.expires_at <= now
    }
}
