//! Scheduling tools: availability lookup, booking and slot proposals.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use tandem_core::domain::appointment::{
    Appointment, AppointmentId, AppointmentStatus, BookingOutcome,
};
use tandem_core::domain::calendar::{DateRange, TimeSlot};
use tandem_core::domain::identity::UserId;
use tandem_core::domain::proposal::{
    ProposalId, ProposalStatus, SlotProposal,
};
use tandem_db::repositories::{AppointmentRepository, ProposalRepository, RepositoryError};

use super::{
    business_failure, parse_args, parse_instant, Tool, ToolContext, ToolError, ToolRegistry,
};
use crate::calendar::CalendarService;
use crate::notify::{Notification, NotificationKind, Notifier};

const MIN_DURATION_MINUTES: i64 = 15;
const MAX_DURATION_MINUTES: i64 = 240;

pub fn booking_tools(
    calendar: Arc<CalendarService>,
    appointments: Arc<dyn AppointmentRepository>,
    proposals: Arc<dyn ProposalRepository>,
    notifier: Arc<dyn Notifier>,
) -> ToolRegistry {
    let mut registry = ToolRegistry::default();
    registry.register(CheckTherapistAvailability { calendar });
    registry.register(CreateAppointment { appointments, notifier });
    registry.register(ProposeTimeSlots { proposals: proposals.clone() });
    registry.register(RespondToProposal { proposals });
    registry
}

fn duration_schema() -> Value {
    json!({
        "type": "integer",
        "minimum": MIN_DURATION_MINUTES,
        "maximum": MAX_DURATION_MINUTES,
        "description": "Session length in minutes"
    })
}

pub struct CheckTherapistAvailability {
    calendar: Arc<CalendarService>,
}

#[derive(Deserialize)]
struct AvailabilityArgs {
    therapist_id: String,
    start_date: String,
    end_date: String,
    duration_minutes: i64,
}

#[async_trait]
impl Tool for CheckTherapistAvailability {
    fn name(&self) -> &'static str {
        "check_therapist_availability"
    }

    fn description(&self) -> &'static str {
        "Find open appointment slots for a therapist between two dates."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "therapist_id": { "type": "string", "minLength": 1 },
                "start_date": { "type": "string", "description": "YYYY-MM-DD or RFC 3339" },
                "end_date": {
                    "type": "string",
                    "description": "YYYY-MM-DD (inclusive) or RFC 3339"
                },
                "duration_minutes": duration_schema()
            },
            "required": ["therapist_id", "start_date", "end_date", "duration_minutes"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<Value, ToolError> {
        let args: AvailabilityArgs = parse_args(self.name(), args)?;
        let start = parse_instant(self.name(), "start_date", &args.start_date, false)?;
        let end = parse_instant(self.name(), "end_date", &args.end_date, true)?;
        let range = match DateRange::new(start, end) {
            Ok(range) => range,
            Err(error) => return Ok(business_failure(error)),
        };

        let therapist_id = UserId(args.therapist_id);
        let slots =
            self.calendar.check_availability(&therapist_id, &range, args.duration_minutes).await?;
        Ok(json!({
            "success": true,
            "therapist_id": therapist_id,
            "count": slots.len(),
            "slots": slots,
        }))
    }
}

pub struct CreateAppointment {
    appointments: Arc<dyn AppointmentRepository>,
    notifier: Arc<dyn Notifier>,
}

#[derive(Deserialize)]
struct CreateAppointmentArgs {
    therapist_id: String,
    patient_id: String,
    start_time: String,
    duration_minutes: i64,
    #[serde(default)]
    notes: Option<String>,
}

#[async_trait]
impl Tool for CreateAppointment {
    fn name(&self) -> &'static str {
        "create_appointment"
    }

    fn description(&self) -> &'static str {
        "Book an appointment between a therapist and a patient if the time is free."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "therapist_id": { "type": "string", "minLength": 1 },
                "patient_id": { "type": "string", "minLength": 1 },
                "start_time": { "type": "string", "description": "RFC 3339 start instant" },
                "duration_minutes": duration_schema(),
                "notes": { "type": "string" }
            },
            "required": ["therapist_id", "patient_id", "start_time", "duration_minutes"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let args: CreateAppointmentArgs = parse_args(self.name(), args)?;
        let start = parse_instant(self.name(), "start_time", &args.start_time, false)?;
        let appointment = Appointment {
            id: AppointmentId(Uuid::new_v4().to_string()),
            therapist_id: UserId(args.therapist_id),
            patient_id: UserId(args.patient_id),
            start,
            end: start + Duration::minutes(args.duration_minutes),
            status: AppointmentStatus::Confirmed,
            notes: args.notes.filter(|notes| !notes.trim().is_empty()),
            created_at: ctx.now,
        };

        let appointment = match self.appointments.book(appointment).await? {
            BookingOutcome::Booked(appointment) => appointment,
            BookingOutcome::Conflict { conflict_count } => {
                info!(
                    event_name = "appointment.conflict",
                    conflict_count,
                    "requested time overlaps existing appointments"
                );
                return Ok(json!({
                    "success": false,
                    "error": "The requested time conflicts with an existing appointment.",
                    "conflict_count": conflict_count,
                }));
            }
        };

        info!(event_name = "appointment.booked", appointment_id = %appointment.id.0);
        let notification = Notification {
            recipient_id: appointment.patient_id.clone(),
            kind: NotificationKind::AppointmentBooked,
            subject: "Appointment confirmed".to_string(),
            body: format!("Your session starts at {}.", appointment.start.to_rfc3339()),
        };
        let notification_status = match self.notifier.notify(notification).await {
            Ok(()) => "sent",
            Err(error) => {
                warn!(event_name = "appointment.notify_failed", error = %error);
                "failed"
            }
        };

        Ok(json!({
            "success": true,
            "appointment": appointment,
            "notification": notification_status,
        }))
    }
}

pub struct ProposeTimeSlots {
    proposals: Arc<dyn ProposalRepository>,
}

#[derive(Deserialize)]
struct SlotArgs {
    start: String,
    end: String,
}

#[derive(Deserialize)]
struct ProposeArgs {
    recipient_id: String,
    slots: Vec<SlotArgs>,
}

#[async_trait]
impl Tool for ProposeTimeSlots {
    fn name(&self) -> &'static str {
        "propose_time_slots"
    }

    fn description(&self) -> &'static str {
        "Offer one to five candidate times to a patient. The offer expires after 48 hours."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "recipient_id": { "type": "string", "minLength": 1 },
                "slots": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "start": { "type": "string" },
                            "end": { "type": "string" }
                        },
                        "required": ["start", "end"],
                        "additionalProperties": false
                    }
                }
            },
            "required": ["recipient_id", "slots"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let args: ProposeArgs = parse_args(self.name(), args)?;
        let mut slots = Vec::with_capacity(args.slots.len());
        for slot in &args.slots {
            slots.push(TimeSlot {
                start: parse_instant(self.name(), "slots.start", &slot.start, false)?,
                end: parse_instant(self.name(), "slots.end", &slot.end, false)?,
                confidence: 1.0,
            });
        }

        let proposal = match SlotProposal::new(
            ProposalId(Uuid::new_v4().to_string()),
            ctx.user_id.clone(),
            UserId(args.recipient_id),
            slots,
            ctx.now,
        ) {
            Ok(proposal) => proposal,
            Err(error) => return Ok(business_failure(error)),
        };

        self.proposals.insert(proposal.clone()).await?;
        info!(
            event_name = "proposal.created",
            proposal_id = %proposal.id.0,
            slots = proposal.proposed_slots.len(),
        );
        Ok(json!({ "success": true, "proposal": proposal }))
    }
}

pub struct RespondToProposal {
    proposals: Arc<dyn ProposalRepository>,
}

#[derive(Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
enum Decision {
    Accept,
    Decline,
}

#[derive(Deserialize)]
struct RespondArgs {
    proposal_id: String,
    decision: Decision,
    #[serde(default)]
    slot_index: Option<usize>,
}

#[async_trait]
impl Tool for RespondToProposal {
    fn name(&self) -> &'static str {
        "respond_to_proposal"
    }

    fn description(&self) -> &'static str {
        "Accept one of the proposed slots or decline the proposal. Only the recipient can respond."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "proposal_id": { "type": "string", "minLength": 1 },
                "decision": { "type": "string", "enum": ["accept", "decline"] },
                "slot_index": { "type": "integer", "minimum": 0 }
            },
            "required": ["proposal_id", "decision"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let args: RespondArgs = parse_args(self.name(), args)?;
        let Some(mut proposal) = self.proposals.find_by_id(&ProposalId(args.proposal_id)).await?
        else {
            return Ok(business_failure("Proposal not found."));
        };

        if proposal.recipient_id != ctx.user_id {
            return Ok(business_failure("Only the recipient can respond to this proposal."));
        }
        if proposal.status != ProposalStatus::Pending {
            return Ok(json!({
                "success": false,
                "error": format!("Proposal is already {}.", proposal.status.as_str()),
                "status": proposal.status,
            }));
        }

        if proposal.is_past_expiry(ctx.now) {
            if proposal.transition_to(ProposalStatus::Expired, ctx.now).is_ok() {
                self.persist_response(proposal).await?;
            }
            return Ok(json!({
                "success": false,
                "error": "Proposal has expired.",
                "status": ProposalStatus::Expired,
            }));
        }

        let outcome = match args.decision {
            Decision::Accept => match args.slot_index {
                Some(index) => proposal.accept(index, ctx.now),
                None => return Ok(business_failure("slot_index is required to accept.")),
            },
            Decision::Decline => proposal.transition_to(ProposalStatus::Declined, ctx.now),
        };
        if let Err(error) = outcome {
            return Ok(business_failure(error));
        }

        match self.persist_response(proposal.clone()).await {
            Ok(()) => {}
            Err(RepositoryError::Conflict(_)) => {
                return Ok(business_failure("Proposal was answered in the meantime."));
            }
            Err(error) => return Err(error.into()),
        }
        info!(
            event_name = "proposal.responded",
            proposal_id = %proposal.id.0,
            status = proposal.status.as_str(),
        );
        Ok(json!({ "success": true, "proposal": proposal }))
    }
}

impl RespondToProposal {
    async fn persist_response(&self, proposal: SlotProposal) -> Result<(), RepositoryError> {
        self.proposals.record_response(proposal).await
    }
}
