use serde_json::{Map, Value};
use sqlx::Row;

use tandem_core::domain::conversation::ConversationId;
use tandem_core::domain::followup::{FollowUpSession, FollowUpSessionId};
use tandem_core::domain::identity::UserId;
use tandem_core::flows::FlowState;
use tandem_core::surface::Surface;

use super::{
    decode_error, encode_json, encode_timestamp, parse_json, parse_timestamp, unknown_value,
    FollowUpRepository, RepositoryError,
};
use crate::DbPool;

pub struct SqlFollowUpRepository {
    pool: DbPool,
}

impl SqlFollowUpRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn session_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<FollowUpSession, RepositoryError> {
    let state: String = row.try_get("state").map_err(decode_error)?;
    let responses_json: String = row.try_get("responses_json").map_err(decode_error)?;
    let surface_json: String = row.try_get("surface_json").map_err(decode_error)?;

    Ok(FollowUpSession {
        id: FollowUpSessionId(row.try_get("id").map_err(decode_error)?),
        owner_id: UserId(row.try_get("owner_id").map_err(decode_error)?),
        conversation_id: ConversationId(row.try_get("conversation_id").map_err(decode_error)?),
        template: row.try_get("template").map_err(decode_error)?,
        state: FlowState::parse(&state).ok_or_else(|| unknown_value("state", &state))?,
        responses: parse_json::<Map<String, Value>>("responses_json", &responses_json)?,
        surface: parse_json::<Surface>("surface_json", &surface_json)?,
        created_at: parse_timestamp(
            "created_at",
            row.try_get("created_at").map_err(decode_error)?,
        )?,
        updated_at: parse_timestamp(
            "updated_at",
            row.try_get("updated_at").map_err(decode_error)?,
        )?,
    })
}

const UPSERT_SESSION: &str = "INSERT INTO follow_up_session
        (id, owner_id, conversation_id, template, state, responses_json, surface_json,
         created_at, updated_at)
     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
     ON CONFLICT(id) DO UPDATE SET
        state = excluded.state,
        responses_json = excluded.responses_json,
        surface_json = excluded.surface_json,
        updated_at = excluded.updated_at";

#[async_trait::async_trait]
impl FollowUpRepository for SqlFollowUpRepository {
    async fn save_session(&self, session: &FollowUpSession) -> Result<(), RepositoryError> {
        sqlx::query(UPSERT_SESSION)
            .bind(&session.id.0)
            .bind(session.owner_id.as_str())
            .bind(&session.conversation_id.0)
            .bind(&session.template)
            .bind(session.state.as_str())
            .bind(encode_json("responses_json", &session.responses)?)
            .bind(encode_json("surface_json", &session.surface)?)
            .bind(encode_timestamp(session.created_at))
            .bind(encode_timestamp(session.updated_at))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn latest_for_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Option<FollowUpSession>, RepositoryError> {
        let row = sqlx::query(
            "SELECT id, owner_id, conversation_id, template, state, responses_json, surface_json,
                    created_at, updated_at
             FROM follow_up_session
             WHERE conversation_id = ?
             ORDER BY created_at DESC, id DESC
             LIMIT 1",
        )
        .bind(&conversation_id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(session_from_row).transpose()
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
        let responses_json = encode_json("responses_json", &session.responses)?;

        let mut tx = self.pool.begin().await?;
        let previous: Option<String> =
            sqlx::query_scalar("SELECT state FROM follow_up_session WHERE id = ?")
                .bind(&session.id.0)
                .fetch_optional(&mut *tx)
                .await?;
        if previous.as_deref() == Some(FlowState::Completed.as_str()) {
            tx.rollback().await?;
            return Err(RepositoryError::Conflict(format!(
                "follow-up session `{}` was already submitted",
                session.id.0
            )));
        }

        sqlx::query(UPSERT_SESSION)
            .bind(&session.id.0)
            .bind(session.owner_id.as_str())
            .bind(&session.conversation_id.0)
            .bind(&session.template)
            .bind(session.state.as_str())
            .bind(&responses_json)
            .bind(encode_json("surface_json", &session.surface)?)
            .bind(encode_timestamp(session.created_at))
            .bind(encode_timestamp(session.updated_at))
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "INSERT INTO follow_up_response
                (id, session_id, owner_id, template, responses_json, submitted_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(response_id)
        .bind(&session.id.0)
        .bind(session.owner_id.as_str())
        .bind(&session.template)
        .bind(&responses_json)
        .bind(encode_timestamp(session.updated_at))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration, Utc};
    use serde_json::json;

    use tandem_core::domain::conversation::ConversationId;
    use tandem_core::domain::followup::{FollowUpSession, FollowUpSessionId, FollowUpTemplate};
    use tandem_core::domain::identity::UserId;
    use tandem_core::flows::{FlowContext, FlowEngine, FlowEvent, FlowState};

    use super::SqlFollowUpRepository;
    use crate::repositories::{FollowUpRepository, RepositoryError};
    use crate::{connect_with_settings, migrations, DbPool};

    fn parse_ts(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value).expect("timestamp").with_timezone(&Utc)
    }

    async fn pool() -> DbPool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("run migrations");
        pool
    }

    fn start(id: &str, at: DateTime<Utc>) -> (FollowUpSession, FollowUpTemplate) {
        let template = FollowUpTemplate::named("post_session").expect("template");
        let session = FollowUpSession::start(
            FollowUpSessionId(id.to_owned()),
            UserId::from("patient-1"),
            ConversationId("conv-1".to_owned()),
            &template,
            at,
        )
        .expect("session");
        (session, template)
    }

    #[tokio::test]
    async fn latest_session_wins_for_conversation() {
        let repo = SqlFollowUpRepository::new(pool().await);
        let base = parse_ts("2026-03-02T09:00:00Z");
        let (older, _) = start("fu-1", base);
        let (newer, _) = start("fu-2", base + Duration::days(7));
        repo.save_session(&older).await.expect("save older");
        repo.save_session(&newer).await.expect("save newer");

        let latest = repo
            .latest_for_conversation(&ConversationId("conv-1".into()))
            .await
            .expect("latest")
            .expect("exists");
        assert_eq!(latest, newer);
    }

    #[tokio::test]
    async fn completing_writes_session_and_response_together() {
        let pool = pool().await;
        let repo = SqlFollowUpRepository::new(pool.clone());
        let now = parse_ts("2026-03-02T09:00:00Z");
        let (mut session, template) = start("fu-1", now);
        repo.save_session(&session).await.expect("save");

        let engine = FlowEngine::default();
        for (field, value) in
            [("session_helpfulness", json!(4)), ("key_takeaway", json!("breathe"))]
        {
            let outcome = engine
                .apply(
                    &session.state,
                    &FlowEvent::FieldChanged { field: field.to_owned() },
                    &FlowContext::default(),
                )
                .expect("field change");
            session.apply_outcome(&outcome, &template, &value, now).expect("merge");
        }
        let submit = engine
            .apply(&session.state, &FlowEvent::Submitted, &session.submit_context(&template))
            .expect("submit");
        session
            .apply_outcome(&submit, &template, &json!(null), now + Duration::minutes(3))
            .expect("complete");
        assert_eq!(session.state, FlowState::Completed);

        repo.complete_session(&session, "resp-1").await.expect("complete");
        let stored: (String, String) = sqlx::query_as(
            "SELECT session_id, responses_json FROM follow_up_response WHERE id = 'resp-1'",
        )
        .fetch_one(&pool)
        .await
        .expect("response row");
        assert_eq!(stored.0, "fu-1");
        assert!(stored.1.contains("breathe"));

        let again = repo.complete_session(&session, "resp-2").await;
        assert!(matches!(again, Err(RepositoryError::Conflict(_))));
    }
}
