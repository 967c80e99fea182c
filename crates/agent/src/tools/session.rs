//! In-session clinical tools: risk flags, escalations and patient memory.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use tandem_core::domain::clinical::{
    Escalation, EscalationId, NotificationStatus, PatientMemory, RiskFlag, RiskFlagId,
    RiskSeverity,
};
use tandem_core::domain::identity::UserId;
use tandem_db::repositories::ClinicalRepository;

use super::{parse_args, Tool, ToolContext, ToolError, ToolRegistry};
use crate::notify::{Notification, NotificationKind, Notifier};

pub fn session_tools(
    clinical: Arc<dyn ClinicalRepository>,
    notifier: Arc<dyn Notifier>,
) -> ToolRegistry {
    let mut registry = ToolRegistry::default();
    registry.register(FlagRisk { clinical: clinical.clone(), notifier: notifier.clone() });
    registry.register(EscalateToTherapist { clinical: clinical.clone(), notifier });
    registry.register(RecordPatientMemory { clinical });
    registry
}

pub struct FlagRisk {
    clinical: Arc<dyn ClinicalRepository>,
    notifier: Arc<dyn Notifier>,
}

#[derive(Deserialize)]
struct FlagRiskArgs {
    patient_id: String,
    risk_type: String,
    severity: RiskSeverity,
    evidence: String,
    #[serde(default)]
    session_id: Option<String>,
}

#[async_trait]
impl Tool for FlagRisk {
    fn name(&self) -> &'static str {
        "flag_risk"
    }

    fn description(&self) -> &'static str {
        "Record a clinical risk observed in the conversation. Critical risks notify the care team."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "patient_id": { "type": "string", "minLength": 1 },
                "risk_type": { "type": "string", "minLength": 1 },
                "severity": { "type": "string", "enum": ["low", "medium", "high", "critical"] },
                "evidence": { "type": "string", "minLength": 1 },
                "session_id": { "type": "string" }
            },
            "required": ["patient_id", "risk_type", "severity", "evidence"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let args: FlagRiskArgs = parse_args(self.name(), args)?;
        let flag = RiskFlag {
            id: RiskFlagId(Uuid::new_v4().to_string()),
            patient_id: UserId(args.patient_id),
            risk_type: args.risk_type,
            severity: args.severity,
            evidence: args.evidence,
            session_id: args.session_id,
            flagged_at: ctx.now,
        };
        self.clinical.append_risk_flag(flag.clone()).await?;
        info!(
            event_name = "risk.flagged",
            flag_id = %flag.id.0,
            severity = flag.severity.as_str(),
        );

        if !flag.severity.requires_notification() {
            return Ok(json!({ "success": true, "flag": flag, "notification": "not_required" }));
        }

        let notification = Notification {
            recipient_id: ctx.user_id.clone(),
            kind: NotificationKind::CriticalRisk,
            subject: format!("Critical risk flagged: {}", flag.risk_type),
            body: flag.evidence.clone(),
        };
        match self.notifier.notify(notification).await {
            Ok(()) => Ok(json!({ "success": true, "flag": flag, "notification": "sent" })),
            Err(error) => {
                warn!(event_name = "risk.notify_failed", flag_id = %flag.id.0, error = %error);
                Ok(json!({
                    "success": true,
                    "flag": flag,
                    "notification": "failed",
                    "notification_error": error.to_string(),
                }))
            }
        }
    }
}

pub struct EscalateToTherapist {
    clinical: Arc<dyn ClinicalRepository>,
    notifier: Arc<dyn Notifier>,
}

#[derive(Deserialize)]
struct EscalateArgs {
    patient_id: String,
    therapist_id: String,
    reason: String,
    urgency: String,
}

#[async_trait]
impl Tool for EscalateToTherapist {
    fn name(&self) -> &'static str {
        "escalate_to_therapist"
    }

    fn description(&self) -> &'static str {
        "Hand the conversation to the patient's therapist with a reason and urgency."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "patient_id": { "type": "string", "minLength": 1 },
                "therapist_id": { "type": "string", "minLength": 1 },
                "reason": { "type": "string", "minLength": 1 },
                "urgency": { "type": "string", "enum": ["low", "medium", "high", "immediate"] }
            },
            "required": ["patient_id", "therapist_id", "reason", "urgency"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let args: EscalateArgs = parse_args(self.name(), args)?;
        let escalation = Escalation {
            id: EscalationId(Uuid::new_v4().to_string()),
            patient_id: UserId(args.patient_id),
            therapist_id: UserId(args.therapist_id),
            reason: args.reason,
            urgency: args.urgency,
            notification_status: NotificationStatus::Pending,
            created_at: ctx.now,
        };
        self.clinical.insert_escalation(escalation.clone()).await?;

        let notification = Notification {
            recipient_id: escalation.therapist_id.clone(),
            kind: NotificationKind::Escalation,
            subject: format!("Escalation ({})", escalation.urgency),
            body: escalation.reason.clone(),
        };
        let (status, notification_error) = match self.notifier.notify(notification).await {
            Ok(()) => (NotificationStatus::Sent, None),
            Err(error) => (NotificationStatus::Failed, Some(error.to_string())),
        };

        if let Err(error) = self.clinical.update_escalation_status(&escalation.id, status).await {
            warn!(
                event_name = "escalation.status_update_failed",
                escalation_id = %escalation.id.0,
                error = %error,
            );
        }
        info!(
            event_name = "escalation.created",
            escalation_id = %escalation.id.0,
            notification_status = status.as_str(),
        );

        let mut result = json!({
            "success": true,
            "escalation_id": escalation.id.0,
            "notification_status": status,
        });
        if let Some(error) = notification_error {
            result["notification_error"] = Value::String(error);
        }
        Ok(result)
    }
}

pub struct RecordPatientMemory {
    clinical: Arc<dyn ClinicalRepository>,
}

#[derive(Deserialize)]
struct MemoryArgs {
    patient_id: String,
    content: String,
}

#[async_trait]
impl Tool for RecordPatientMemory {
    fn name(&self) -> &'static str {
        "record_patient_memory"
    }

    fn description(&self) -> &'static str {
        "Remember a fact the patient shared so later sessions can refer to it."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "patient_id": { "type": "string", "minLength": 1 },
                "content": { "type": "string", "minLength": 1 }
            },
            "required": ["patient_id", "content"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let args: MemoryArgs = parse_args(self.name(), args)?;
        let memory = PatientMemory {
            id: Uuid::new_v4().to_string(),
            patient_id: UserId(args.patient_id),
            content: args.content.trim().to_string(),
            created_at: ctx.now,
        };
        self.clinical.insert_memory(memory.clone()).await?;
        Ok(json!({ "success": true, "memory_id": memory.id }))
    }
}
