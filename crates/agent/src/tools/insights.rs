//! Practice insights. The analysis functions back both the tool-calling mode
//! and the direct dashboard.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use serde_json::{json, Value};

use tandem_core::domain::appointment::AppointmentStatus;
use tandem_core::domain::calendar::DateRange;
use tandem_core::domain::clinical::RiskSeverity;
use tandem_core::domain::identity::UserId;
use tandem_db::repositories::{AppointmentRepository, ClinicalRepository};

use super::{parse_args, Tool, ToolContext, ToolError, ToolRegistry};

pub const DEFAULT_STATISTICS_DAYS: u32 = 30;

pub fn insights_tools(
    appointments: Arc<dyn AppointmentRepository>,
    clinical: Arc<dyn ClinicalRepository>,
) -> ToolRegistry {
    let mut registry = ToolRegistry::default();
    registry.register(SessionStatistics { appointments });
    registry.register(RiskOverview { clinical: clinical.clone() });
    registry.register(GoalProgress { clinical });
    registry
}

/// Appointment counts by status and completed hours over the last `days`.
pub async fn session_statistics(
    appointments: &dyn AppointmentRepository,
    user_id: &UserId,
    days: u32,
    now: DateTime<Utc>,
) -> Result<Value, ToolError> {
    let range = DateRange { start: now - Duration::days(i64::from(days)), end: now };
    let listed = appointments.list_for_participant(user_id, &range).await?;

    let count = |status: AppointmentStatus| {
        listed.iter().filter(|appointment| appointment.status == status).count()
    };
    let completed_minutes: i64 = listed
        .iter()
        .filter(|appointment| appointment.status == AppointmentStatus::Completed)
        .map(|appointment| (appointment.end - appointment.start).num_minutes())
        .sum();
    let completed_hours = (completed_minutes as f64 / 60.0 * 100.0).round() / 100.0;

    Ok(json!({
        "success": true,
        "user_id": user_id,
        "days": days,
        "total": listed.len(),
        "by_status": {
            "pending": count(AppointmentStatus::Pending),
            "confirmed": count(AppointmentStatus::Confirmed),
            "cancelled": count(AppointmentStatus::Cancelled),
            "completed": count(AppointmentStatus::Completed),
        },
        "completed_hours": completed_hours,
    }))
}

/// Flag counts per severity plus the most recent flag.
pub async fn risk_overview(
    clinical: &dyn ClinicalRepository,
    patient_id: &UserId,
) -> Result<Value, ToolError> {
    let flags = clinical.list_risk_flags(patient_id).await?;
    let count =
        |severity: RiskSeverity| flags.iter().filter(|flag| flag.severity == severity).count();
    let most_recent = flags.iter().max_by_key(|flag| flag.flagged_at);

    Ok(json!({
        "success": true,
        "patient_id": patient_id,
        "total": flags.len(),
        "by_severity": {
            "low": count(RiskSeverity::Low),
            "medium": count(RiskSeverity::Medium),
            "high": count(RiskSeverity::High),
            "critical": count(RiskSeverity::Critical),
        },
        "most_recent": most_recent,
    }))
}

pub async fn goal_progress(
    clinical: &dyn ClinicalRepository,
    patient_id: &UserId,
) -> Result<Value, ToolError> {
    let goals = clinical.list_goals(patient_id).await?;
    let average_progress = if goals.is_empty() {
        0.0
    } else {
        let total: u32 = goals.iter().map(|goal| u32::from(goal.progress)).sum();
        (f64::from(total) / goals.len() as f64 * 10.0).round() / 10.0
    };

    Ok(json!({
        "success": true,
        "patient_id": patient_id,
        "goals": goals,
        "average_progress": average_progress,
    }))
}

fn patient_schema() -> Value {
    json!({
        "type": "object",
        "properties": { "patient_id": { "type": "string", "minLength": 1 } },
        "required": ["patient_id"],
        "additionalProperties": false
    })
}

#[derive(Deserialize)]
struct PatientArgs {
    patient_id: String,
}

pub struct SessionStatistics {
    appointments: Arc<dyn AppointmentRepository>,
}

#[derive(Deserialize)]
struct StatisticsArgs {
    user_id: String,
    days: u32,
}

#[async_trait]
impl Tool for SessionStatistics {
    fn name(&self) -> &'static str {
        "session_statistics"
    }

    fn description(&self) -> &'static str {
        "Count appointments by status and completed session hours over recent days."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "user_id": { "type": "string", "minLength": 1 },
                "days": { "type": "integer", "minimum": 1, "maximum": 365 }
            },
            "required": ["user_id", "days"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let args: StatisticsArgs = parse_args(self.name(), args)?;
        session_statistics(self.appointments.as_ref(), &UserId(args.user_id), args.days, ctx.now)
            .await
    }
}

pub struct RiskOverview {
    clinical: Arc<dyn ClinicalRepository>,
}

#[async_trait]
impl Tool for RiskOverview {
    fn name(&self) -> &'static str {
        "risk_overview"
    }

    fn description(&self) -> &'static str {
        "Summarise a patient's risk flags by severity."
    }

    fn parameters_schema(&self) -> Value {
        patient_schema()
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<Value, ToolError> {
        let args: PatientArgs = parse_args(self.name(), args)?;
        risk_overview(self.clinical.as_ref(), &UserId(args.patient_id)).await
    }
}

pub struct GoalProgress {
    clinical: Arc<dyn ClinicalRepository>,
}

#[async_trait]
impl Tool for GoalProgress {
    fn name(&self) -> &'static str {
        "goal_progress"
    }

    fn description(&self) -> &'static str {
        "List a patient's treatment goals with their average progress."
    }

    fn parameters_schema(&self) -> Value {
        patient_schema()
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<Value, ToolError> {
        let args: PatientArgs = parse_args(self.name(), args)?;
        goal_progress(self.clinical.as_ref(), &UserId(args.patient_id)).await
    }
}
