use serde_json::{Map, Value};
use sqlx::Row;

use tandem_core::domain::conversation::{Conversation, ConversationId, ConversationMessage};
use tandem_core::domain::identity::UserId;
use tandem_core::domain::intent::AgentIntent;

use super::{
    decode_error, encode_json, encode_timestamp, parse_json, parse_timestamp, parse_u32,
    unknown_value, ConversationRepository, RepositoryError,
};
use crate::DbPool;

pub struct SqlConversationRepository {
    pool: DbPool,
}

impl SqlConversationRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn conversation_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Conversation, RepositoryError> {
    let agent_type: String = row.try_get("agent_type").map_err(decode_error)?;
    let messages_json: String = row.try_get("messages_json").map_err(decode_error)?;
    let context_json: String = row.try_get("context_json").map_err(decode_error)?;

    Ok(Conversation {
        id: ConversationId(row.try_get("id").map_err(decode_error)?),
        owner_id: UserId(row.try_get("owner_id").map_err(decode_error)?),
        agent_type: AgentIntent::parse(&agent_type)
            .ok_or_else(|| unknown_value("agent_type", &agent_type))?,
        messages: parse_json::<Vec<ConversationMessage>>("messages_json", &messages_json)?,
        context: parse_json::<Map<String, Value>>("context_json", &context_json)?,
        version: parse_u32("version", row.try_get("version").map_err(decode_error)?)?,
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

#[async_trait::async_trait]
impl ConversationRepository for SqlConversationRepository {
    async fn find_by_id(
        &self,
        id: &ConversationId,
    ) -> Result<Option<Conversation>, RepositoryError> {
        let row = sqlx::query(
            "SELECT id, owner_id, agent_type, messages_json, context_json, version,
                    created_at, updated_at
             FROM conversation WHERE id = ?",
        )
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(conversation_from_row).transpose()
    }

    async fn save(&self, conversation: &Conversation) -> Result<u32, RepositoryError> {
        let next_version = conversation.version.checked_add(1).ok_or_else(|| {
            RepositoryError::Conflict(format!(
                "conversation `{}` exhausted its version counter",
                conversation.id.0
            ))
        })?;
        let messages_json = encode_json("messages_json", &conversation.messages)?;
        let context_json = encode_json("context_json", &conversation.context)?;

        let affected = if conversation.version == 0 {
            sqlx::query(
                "INSERT INTO conversation
                    (id, owner_id, agent_type, messages_json, context_json, version,
                     created_at, updated_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(id) DO NOTHING",
            )
            .bind(&conversation.id.0)
            .bind(conversation.owner_id.as_str())
            .bind(conversation.agent_type.as_str())
            .bind(&messages_json)
            .bind(&context_json)
            .bind(i64::from(next_version))
            .bind(encode_timestamp(conversation.created_at))
            .bind(encode_timestamp(conversation.updated_at))
            .execute(&self.pool)
            .await?
            .rows_affected()
        } else {
            sqlx::query(
                "UPDATE conversation
                 SET agent_type = ?, messages_json = ?, context_json = ?, version = ?,
                     updated_at = ?
                 WHERE id = ? AND version = ?",
            )
            .bind(conversation.agent_type.as_str())
            .bind(&messages_json)
            .bind(&context_json)
            .bind(i64::from(next_version))
            .bind(encode_timestamp(conversation.updated_at))
            .bind(&conversation.id.0)
            .bind(i64::from(conversation.version))
            .execute(&self.pool)
            .await?
            .rows_affected()
        };

        if affected == 0 {
            return Err(RepositoryError::Conflict(format!(
                "conversation `{}` was modified since version {}",
                conversation.id.0, conversation.version
            )));
        }
        Ok(next_version)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration, Utc};
    use serde_json::json;

    use tandem_core::domain::conversation::{Conversation, ConversationId};
    use tandem_core::domain::identity::UserId;
    use tandem_core::domain::intent::AgentIntent;

    use super::SqlConversationRepository;
    use crate::repositories::{ConversationRepository, RepositoryError};
    use crate::{connect_with_settings, migrations};

    fn parse_ts(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value).expect("timestamp").with_timezone(&Utc)
    }

    async fn repo() -> SqlConversationRepository {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("run migrations");
        SqlConversationRepository::new(pool)
    }

    #[tokio::test]
    async fn turns_and_context_survive_reload() {
        let repo = repo().await;
        let now = parse_ts("2026-03-02T09:00:00Z");
        let mut conversation =
            Conversation::start(ConversationId("conv-1".into()), UserId::from("patient-1"), now);
        conversation.record_turn(
            "find me a slot",
            "Here are three options",
            AgentIntent::Booking,
            now,
        );
        conversation.context.insert("timezone".into(), json!("Europe/Berlin"));

        conversation.version = repo.save(&conversation).await.expect("insert");
        assert_eq!(conversation.version, 1);

        conversation.record_turn(
            "how was my week",
            "Mood is trending up",
            AgentIntent::Insights,
            now + Duration::minutes(2),
        );
        conversation.version = repo.save(&conversation).await.expect("update");

        let stored = repo.find_by_id(&conversation.id).await.expect("find").expect("exists");
        assert_eq!(stored, conversation);
        assert_eq!(stored.version, 2);
        assert_eq!(stored.agent_type, AgentIntent::Insights);
    }

    #[tokio::test]
    async fn stale_version_is_rejected() {
        let repo = repo().await;
        let now = parse_ts("2026-03-02T09:00:00Z");
        let mut first =
            Conversation::start(ConversationId("conv-2".into()), UserId::from("patient-1"), now);
        first.version = repo.save(&first).await.expect("insert");
        let mut second = first.clone();

        first.record_turn("hi", "hello", AgentIntent::General, now);
        first.version = repo.save(&first).await.expect("first writer wins");

        second.record_turn("hey", "hello again", AgentIntent::General, now);
        let result = repo.save(&second).await;
        assert!(matches!(result, Err(RepositoryError::Conflict(_))));

        let duplicate =
            Conversation::start(ConversationId("conv-2".into()), UserId::from("patient-1"), now);
        assert!(matches!(repo.save(&duplicate).await, Err(RepositoryError::Conflict(_))));
    }
}
