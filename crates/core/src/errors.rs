use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::{domain::proposal::ProposalStatus, flows::FlowTransitionError, surface::SurfaceError};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("range start {start} is after range end {end}")]
    InvalidDateRange { start: DateTime<Utc>, end: DateTime<Utc> },
    #[error("invalid working hours: {0}")]
    InvalidWorkingHours(String),
    #[error("unknown timezone `{0}`")]
    UnknownTimezone(String),
    #[error("a proposal needs between 1 and 5 slots, got {0}")]
    InvalidProposalSlotCount(usize),
    #[error("invalid proposal transition from {from:?} to {to:?}")]
    InvalidProposalTransition { from: ProposalStatus, to: ProposalStatus },
    #[error("invalid answer for `{field}`: {reason}")]
    InvalidFormField { field: String, reason: String },
    #[error(transparent)]
    FlowTransition(#[from] FlowTransitionError),
    #[error(transparent)]
    Surface(#[from] SurfaceError),
    #[error("domain invariant violation: {0}")]
    InvariantViolation(String),
}
