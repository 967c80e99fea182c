use sqlx::Row;

use tandem_core::domain::clinical::{
    Escalation, EscalationId, Goal, NotificationStatus, PatientMemory, RiskFlag, RiskFlagId,
    RiskSeverity,
};
use tandem_core::domain::identity::UserId;

use super::{
    decode_error, encode_timestamp, parse_timestamp, unknown_value, ClinicalRepository,
    RepositoryError,
};
use crate::DbPool;

pub struct SqlClinicalRepository {
    pool: DbPool,
}

impl SqlClinicalRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn risk_flag_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<RiskFlag, RepositoryError> {
    let severity: String = row.try_get("severity").map_err(decode_error)?;
    Ok(RiskFlag {
        id: RiskFlagId(row.try_get("id").map_err(decode_error)?),
        patient_id: UserId(row.try_get("patient_id").map_err(decode_error)?),
        risk_type: row.try_get("risk_type").map_err(decode_error)?,
        severity: RiskSeverity::parse(&severity)
            .ok_or_else(|| unknown_value("severity", &severity))?,
        evidence: row.try_get("evidence").map_err(decode_error)?,
        session_id: row.try_get("session_id").map_err(decode_error)?,
        flagged_at: parse_timestamp(
            "flagged_at",
            row.try_get("flagged_at").map_err(decode_error)?,
        )?,
    })
}

fn escalation_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Escalation, RepositoryError> {
    let status: String = row.try_get("notification_status").map_err(decode_error)?;
    Ok(Escalation {
        id: EscalationId(row.try_get("id").map_err(decode_error)?),
        patient_id: UserId(row.try_get("patient_id").map_err(decode_error)?),
        therapist_id: UserId(row.try_get("therapist_id").map_err(decode_error)?),
        reason: row.try_get("reason").map_err(decode_error)?,
        urgency: row.try_get("urgency").map_err(decode_error)?,
        notification_status: NotificationStatus::parse(&status)
            .ok_or_else(|| unknown_value("notification_status", &status))?,
        created_at: parse_timestamp(
            "created_at",
            row.try_get("created_at").map_err(decode_error)?,
        )?,
    })
}

fn memory_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<PatientMemory, RepositoryError> {
    Ok(PatientMemory {
        id: row.try_get("id").map_err(decode_error)?,
        patient_id: UserId(row.try_get("patient_id").map_err(decode_error)?),
        content: row.try_get("content").map_err(decode_error)?,
        created_at: parse_timestamp(
            "created_at",
            row.try_get("created_at").map_err(decode_error)?,
        )?,
    })
}

fn goal_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Goal, RepositoryError> {
    let progress: i64 = row.try_get("progress").map_err(decode_error)?;
    Ok(Goal {
        id: row.try_get("id").map_err(decode_error)?,
        patient_id: UserId(row.try_get("patient_id").map_err(decode_error)?),
        title: row.try_get("title").map_err(decode_error)?,
        progress: u8::try_from(progress)
            .ok()
            .filter(|value| *value <= 100)
            .ok_or_else(|| RepositoryError::Decode(format!("invalid `progress`: {progress}")))?,
        status: row.try_get("status").map_err(decode_error)?,
        updated_at: parse_timestamp(
            "updated_at",
            row.try_get("updated_at").map_err(decode_error)?,
        )?,
    })
}

#[async_trait::async_trait]
impl ClinicalRepository for SqlClinicalRepository {
    async fn append_risk_flag(&self, flag: RiskFlag) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO risk_flag
                (id, patient_id, risk_type, severity, evidence, session_id, flagged_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&flag.id.0)
        .bind(flag.patient_id.as_str())
        .bind(&flag.risk_type)
        .bind(flag.severity.as_str())
        .bind(&flag.evidence)
        .bind(&flag.session_id)
        .bind(encode_timestamp(flag.flagged_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_risk_flags(&self, patient_id: &UserId) -> Result<Vec<RiskFlag>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, patient_id, risk_type, severity, evidence, session_id, flagged_at
             FROM risk_flag WHERE patient_id = ? ORDER BY flagged_at DESC, id",
        )
        .bind(patient_id.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(risk_flag_from_row).collect()
    }

    async fn insert_escalation(&self, escalation: Escalation) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO escalation
                (id, patient_id, therapist_id, reason, urgency, notification_status, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&escalation.id.0)
        .bind(escalation.patient_id.as_str())
        .bind(escalation.therapist_id.as_str())
        .bind(&escalation.reason)
        .bind(&escalation.urgency)
        .bind(escalation.notification_status.as_str())
        .bind(encode_timestamp(escalation.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_escalation_status(
        &self,
        id: &EscalationId,
        status: NotificationStatus,
    ) -> Result<(), RepositoryError> {
        let updated = sqlx::query("UPDATE escalation SET notification_status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(&id.0)
            .execute(&self.pool)
            .await?;
        if updated.rows_affected() == 0 {
            return Err(RepositoryError::Conflict(format!("escalation `{}` does not exist", id.0)));
        }
        Ok(())
    }

    async fn find_escalation(
        &self,
        id: &EscalationId,
    ) -> Result<Option<Escalation>, RepositoryError> {
        let row = sqlx::query(
            "SELECT id, patient_id, therapist_id, reason, urgency, notification_status, created_at
             FROM escalation WHERE id = ?",
        )
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(escalation_from_row).transpose()
    }

    async fn insert_memory(&self, memory: PatientMemory) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO patient_memory (id, patient_id, content, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&memory.id)
        .bind(memory.patient_id.as_str())
        .bind(&memory.content)
        .bind(encode_timestamp(memory.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_memories(
        &self,
        patient_id: &UserId,
    ) -> Result<Vec<PatientMemory>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, patient_id, content, created_at
             FROM patient_memory WHERE patient_id = ? ORDER BY created_at DESC, id",
        )
        .bind(patient_id.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(memory_from_row).collect()
    }

    async fn save_goal(&self, goal: Goal) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO goal (id, patient_id, title, progress, status, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                title = excluded.title,
                progress = excluded.progress,
                status = excluded.status,
                updated_at = excluded.updated_at",
        )
        .bind(&goal.id)
        .bind(goal.patient_id.as_str())
        .bind(&goal.title)
        .bind(i64::from(goal.progress))
        .bind(&goal.status)
        .bind(encode_timestamp(goal.updated_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_goals(&self, patient_id: &UserId) -> Result<Vec<Goal>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, patient_id, title, progress, status, updated_at
             FROM goal WHERE patient_id = ? ORDER BY updated_at DESC, id",
        )
        .bind(patient_id.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(goal_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration, Utc};

    use tandem_core::domain::clinical::{
        Escalation, EscalationId, Goal, NotificationStatus, RiskFlag, RiskFlagId, RiskSeverity,
    };
    use tandem_core::domain::identity::UserId;

    use super::SqlClinicalRepository;
    use crate::repositories::{ClinicalRepository, RepositoryError};
    use crate::{connect_with_settings, migrations};

    fn parse_ts(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value).expect("timestamp").with_timezone(&Utc)
    }

    async fn repo() -> SqlClinicalRepository {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("run migrations");
        SqlClinicalRepository::new(pool)
    }

    #[tokio::test]
    async fn risk_flags_are_listed_newest_first() {
        let repo = repo().await;
        let patient = UserId::from("patient-1");
        let base = parse_ts("2026-03-02T09:00:00Z");
        for (index, severity) in [RiskSeverity::Low, RiskSeverity::Critical].into_iter().enumerate()
        {
            repo.append_risk_flag(RiskFlag {
                id: RiskFlagId(format!("risk-{index}")),
                patient_id: patient.clone(),
                risk_type: "self_harm".into(),
                severity,
                evidence: "session transcript excerpt".into(),
                session_id: Some("session-7".into()),
                flagged_at: base + Duration::hours(index as i64),
            })
            .await
            .expect("append");
        }

        let flags = repo.list_risk_flags(&patient).await.expect("list");
        assert_eq!(flags.len(), 2);
        assert_eq!(flags[0].severity, RiskSeverity::Critical);
        assert_eq!(flags[1].id, RiskFlagId("risk-0".into()));
    }

    #[tokio::test]
    async fn escalation_status_updates_in_place() {
        let repo = repo().await;
        let id = EscalationId("esc-1".into());
        repo.insert_escalation(Escalation {
            id: id.clone(),
            patient_id: UserId::from("patient-1"),
            therapist_id: UserId::from("therapist-1"),
            reason: "critical risk flag".into(),
            urgency: "immediate".into(),
            notification_status: NotificationStatus::Pending,
            created_at: parse_ts("2026-03-02T09:00:00Z"),
        })
        .await
        .expect("insert");

        repo.update_escalation_status(&id, NotificationStatus::Sent).await.expect("update");
        let stored = repo.find_escalation(&id).await.expect("find").expect("exists");
        assert_eq!(stored.notification_status, NotificationStatus::Sent);

        let missing = repo
            .update_escalation_status(&EscalationId("nope".into()), NotificationStatus::Failed)
            .await;
        assert!(matches!(missing, Err(RepositoryError::Conflict(_))));
    }

    #[tokio::test]
    async fn goal_save_upserts_progress() {
        let repo = repo().await;
        let patient = UserId::from("patient-1");
        let mut goal = Goal {
            id: "goal-1".into(),
            patient_id: patient.clone(),
            title: "Sleep eight hours".into(),
            progress: 20,
            status: "active".into(),
            updated_at: parse_ts("2026-03-02T09:00:00Z"),
        };
        repo.save_goal(goal.clone()).await.expect("insert");
        goal.progress = 65;
        goal.updated_at = parse_ts("2026-03-09T09:00:00Z");
        repo.save_goal(goal.clone()).await.expect("update");

        assert_eq!(repo.list_goals(&patient).await.expect("list"), vec![goal]);
    }
}
