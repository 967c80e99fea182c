use chrono::Utc;
use sqlx::Row;

use tandem_core::domain::identity::{AuthSession, UserId};

use super::{
    decode_error, encode_timestamp, parse_optional_timestamp, AuthRepository, RepositoryError,
};
use crate::DbPool;

pub struct SqlAuthRepository {
    pool: DbPool,
}

impl SqlAuthRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl AuthRepository for SqlAuthRepository {
    async fn find_session(
        &self,
        token_sha256: &str,
    ) -> Result<Option<AuthSession>, RepositoryError> {
        let row = sqlx::query(
            "SELECT token_sha256, user_id, expires_at FROM auth_session WHERE token_sha256 = ?",
        )
        .bind(token_sha256)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(AuthSession {
            token_sha256: row.try_get("token_sha256").map_err(decode_error)?,
            user_id: UserId(row.try_get("user_id").map_err(decode_error)?),
            expires_at: parse_optional_timestamp(
                "expires_at",
                row.try_get("expires_at").map_err(decode_error)?,
            )?,
        }))
    }

    async fn save_session(&self, session: AuthSession) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO auth_session (token_sha256, user_id, expires_at, created_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(token_sha256) DO UPDATE SET
                 user_id = excluded.user_id,
                 expires_at = excluded.expires_at",
        )
        .bind(&session.token_sha256)
        .bind(session.user_id.as_str())
        .bind(session.expires_at.map(encode_timestamp))
        .bind(encode_timestamp(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
