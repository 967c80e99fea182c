use std::str::FromStr;

use rust_decimal::Decimal;
use serde_json::Value;
use sqlx::Row;

use tandem_core::domain::conversation::ConversationId;
use tandem_core::domain::execution::{AgentExecution, ExecutionId, ExecutionStatus};
use tandem_core::domain::intent::AgentIntent;

use super::{
    decode_error, encode_json, encode_timestamp, parse_json, parse_timestamp, parse_u32,
    unknown_value, ExecutionRepository, RepositoryError,
};
use crate::DbPool;

pub struct SqlExecutionRepository {
    pool: DbPool,
}

impl SqlExecutionRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn execution_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<AgentExecution, RepositoryError> {
    let agent_type: String = row.try_get("agent_type").map_err(decode_error)?;
    let status: String = row.try_get("status").map_err(decode_error)?;
    let cost: String = row.try_get("cost_usd").map_err(decode_error)?;
    let duration_ms: i64 = row.try_get("duration_ms").map_err(decode_error)?;
    let tool_calls_json: String = row.try_get("tool_calls_json").map_err(decode_error)?;
    let metadata_json: String = row.try_get("metadata_json").map_err(decode_error)?;

    Ok(AgentExecution {
        id: ExecutionId(row.try_get("id").map_err(decode_error)?),
        conversation_id: ConversationId(row.try_get("conversation_id").map_err(decode_error)?),
        agent_type: AgentIntent::parse(&agent_type)
            .ok_or_else(|| unknown_value("agent_type", &agent_type))?,
        tool_calls: parse_json::<Value>("tool_calls_json", &tool_calls_json)?,
        tokens_used: parse_u32("tokens_used", row.try_get("tokens_used").map_err(decode_error)?)?,
        cost_usd: Decimal::from_str(&cost).map_err(|error| {
            RepositoryError::Decode(format!("invalid decimal in `cost_usd`: `{cost}` ({error})"))
        })?,
        duration_ms: u64::try_from(duration_ms).map_err(|_| {
            RepositoryError::Decode(format!("negative `duration_ms`: {duration_ms}"))
        })?,
        status: ExecutionStatus::parse(&status).ok_or_else(|| unknown_value("status", &status))?,
        metadata: parse_json::<Value>("metadata_json", &metadata_json)?,
        created_at: parse_timestamp(
            "created_at",
            row.try_get("created_at").map_err(decode_error)?,
        )?,
    })
}

#[async_trait::async_trait]
impl ExecutionRepository for SqlExecutionRepository {
    async fn append(&self, execution: AgentExecution) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO agent_execution
                (id, conversation_id, agent_type, tool_calls_json, tokens_used, cost_usd,
                 duration_ms, status, metadata_json, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&execution.id.0)
        .bind(&execution.conversation_id.0)
        .bind(execution.agent_type.as_str())
        .bind(encode_json("tool_calls_json", &execution.tool_calls)?)
        .bind(i64::from(execution.tokens_used))
        .bind(execution.cost_usd.to_string())
        .bind(i64::try_from(execution.duration_ms).unwrap_or(i64::MAX))
        .bind(execution.status.as_str())
        .bind(encode_json("metadata_json", &execution.metadata)?)
        .bind(encode_timestamp(execution.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_for_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<AgentExecution>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, conversation_id, agent_type, tool_calls_json, tokens_used, cost_usd,
                    duration_ms, status, metadata_json, created_at
             FROM agent_execution
             WHERE conversation_id = ?
             ORDER BY created_at, id",
        )
        .bind(&conversation_id.0)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(execution_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration, Utc};
    use rust_decimal::Decimal;
    use serde_json::json;

    use tandem_core::domain::conversation::ConversationId;
    use tandem_core::domain::execution::{AgentExecution, ExecutionId, ExecutionStatus};
    use tandem_core::domain::intent::AgentIntent;

    use super::SqlExecutionRepository;
    use crate::repositories::ExecutionRepository;
    use crate::{connect_with_settings, migrations};

    #[tokio::test]
    async fn executions_are_listed_in_append_order() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("run migrations");
        let repo = SqlExecutionRepository::new(pool);

        let base: DateTime<Utc> = DateTime::parse_from_rfc3339("2026-03-02T09:00:00Z")
            .expect("timestamp")
            .with_timezone(&Utc);
        let conversation_id = ConversationId("conv-1".into());
        let failed = AgentExecution {
            id: ExecutionId("exec-2".into()),
            conversation_id: conversation_id.clone(),
            agent_type: AgentIntent::Booking,
            tool_calls: json!([]),
            tokens_used: 0,
            cost_usd: Decimal::ZERO,
            duration_ms: 3_501,
            status: ExecutionStatus::Failed,
            metadata: json!({"error": "llm timed out"}),
            created_at: base + Duration::seconds(10),
        };
        let succeeded = AgentExecution {
            id: ExecutionId("exec-1".into()),
            conversation_id: conversation_id.clone(),
            agent_type: AgentIntent::Booking,
            tool_calls: json!([{"name": "check_availability", "status": "success"}]),
            tokens_used: 1_240,
            cost_usd: Decimal::new(4_125, 6),
            duration_ms: 812,
            status: ExecutionStatus::Success,
            metadata: json!({"intent_confidence": 92}),
            created_at: base,
        };
        repo.append(failed.clone()).await.expect("append failed");
        repo.append(succeeded.clone()).await.expect("append succeeded");

        let listed = repo.list_for_conversation(&conversation_id).await.expect("list");
        assert_eq!(listed, vec![succeeded, failed]);
        assert!(repo
            .list_for_conversation(&ConversationId("other".into()))
            .await
            .expect("list other")
            .is_empty());
    }
}
