use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use sqlx::Row;

use tandem_core::domain::calendar::{
    AvailabilityPreferences, CalendarEvent, CalendarIntegration, CalendarSource, DateRange,
    TeamVisibility,
};
use tandem_core::domain::identity::UserId;

use super::{
    decode_error, encode_timestamp, parse_optional_timestamp, parse_timestamp, parse_u32,
    unknown_value, CalendarRepository, RepositoryError,
};
use crate::DbPool;

pub struct SqlCalendarRepository {
    pool: DbPool,
}

impl SqlCalendarRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn parse_source(column: &str, value: &str) -> Result<CalendarSource, RepositoryError> {
    CalendarSource::parse(value).ok_or_else(|| unknown_value(column, value))
}

fn integration_from_row(
    row: &sqlx::sqlite::SqliteRow,
) -> Result<CalendarIntegration, RepositoryError> {
    let provider: String = row.try_get("provider").map_err(decode_error)?;
    let access_token: String = row.try_get("access_token").map_err(decode_error)?;
    let refresh_token: String = row.try_get("refresh_token").map_err(decode_error)?;

    Ok(CalendarIntegration {
        owner_id: UserId(row.try_get("owner_id").map_err(decode_error)?),
        provider: parse_source("provider", &provider)?,
        access_token: SecretString::from(access_token),
        refresh_token: SecretString::from(refresh_token),
        is_connected: row.try_get("is_connected").map_err(decode_error)?,
        last_synced_at: parse_optional_timestamp(
            "last_synced_at",
            row.try_get("last_synced_at").map_err(decode_error)?,
        )?,
    })
}

fn event_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<CalendarEvent, RepositoryError> {
    let source: String = row.try_get("source").map_err(decode_error)?;
    Ok(CalendarEvent {
        id: row.try_get("id").map_err(decode_error)?,
        owner_id: UserId(row.try_get("owner_id").map_err(decode_error)?),
        title: row.try_get("title").map_err(decode_error)?,
        start: parse_timestamp("start_at", row.try_get("start_at").map_err(decode_error)?)?,
        end: parse_timestamp("end_at", row.try_get("end_at").map_err(decode_error)?)?,
        is_busy: row.try_get("is_busy").map_err(decode_error)?,
        source: parse_source("source", &source)?,
    })
}

fn visibility_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<TeamVisibility, RepositoryError> {
    Ok(TeamVisibility {
        owner_id: UserId(row.try_get("owner_id").map_err(decode_error)?),
        practice_id: row.try_get("practice_id").map_err(decode_error)?,
        share_with_team: row.try_get("share_with_team").map_err(decode_error)?,
        show_busy_only: row.try_get("show_busy_only").map_err(decode_error)?,
    })
}

const INTEGRATION_COLUMNS: &str =
    "owner_id, provider, access_token, refresh_token, is_connected, last_synced_at";

#[async_trait::async_trait]
impl CalendarRepository for SqlCalendarRepository {
    async fn find_integration(
        &self,
        owner_id: &UserId,
        provider: CalendarSource,
    ) -> Result<Option<CalendarIntegration>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {INTEGRATION_COLUMNS} FROM calendar_integration
             WHERE owner_id = ? AND provider = ?"
        ))
        .bind(owner_id.as_str())
        .bind(provider.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(integration_from_row).transpose()
    }

    async fn save_integration(
        &self,
        integration: CalendarIntegration,
    ) -> Result<(), RepositoryError> {
        let now = encode_timestamp(Utc::now());
        sqlx::query(
            "INSERT INTO calendar_integration
                (owner_id, provider, access_token, refresh_token, is_connected,
                 last_synced_at, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(owner_id, provider) DO UPDATE SET
                 access_token = excluded.access_token,
                 refresh_token = excluded.refresh_token,
                 is_connected = excluded.is_connected,
                 last_synced_at = excluded.last_synced_at,
                 updated_at = excluded.updated_at",
        )
        .bind(integration.owner_id.as_str())
        .bind(integration.provider.as_str())
        .bind(integration.access_token.expose_secret())
        .bind(integration.refresh_token.expose_secret())
        .bind(integration.is_connected)
        .bind(integration.last_synced_at.map(encode_timestamp))
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_connected_integrations(
        &self,
        owner_id: Option<&UserId>,
    ) -> Result<Vec<CalendarIntegration>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {INTEGRATION_COLUMNS} FROM calendar_integration
             WHERE is_connected = 1 AND (? IS NULL OR owner_id = ?)
             ORDER BY owner_id, provider"
        ))
        .bind(owner_id.map(UserId::as_str))
        .bind(owner_id.map(UserId::as_str))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(integration_from_row).collect()
    }

    async fn disconnect(
        &self,
        owner_id: &UserId,
        provider: CalendarSource,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query(
            "UPDATE calendar_integration SET is_connected = 0, updated_at = ?
             WHERE owner_id = ? AND provider = ?",
        )
        .bind(encode_timestamp(now))
        .bind(owner_id.as_str())
        .bind(provider.as_str())
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM calendar_event_cache WHERE owner_id = ? AND source = ?")
            .bind(owner_id.as_str())
            .bind(provider.as_str())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(updated.rows_affected() > 0)
    }

    async fn mark_synced(
        &self,
        owner_id: &UserId,
        provider: CalendarSource,
        synced_at: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let synced_at = encode_timestamp(synced_at);
        sqlx::query(
            "UPDATE calendar_integration SET last_synced_at = ?, updated_at = ?
             WHERE owner_id = ? AND provider = ?",
        )
        .bind(&synced_at)
        .bind(&synced_at)
        .bind(owner_id.as_str())
        .bind(provider.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn replace_events(
        &self,
        owner_id: &UserId,
        source: CalendarSource,
        events: Vec<CalendarEvent>,
        synced_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let synced_at = encode_timestamp(synced_at);
        let expires_at = encode_timestamp(expires_at);

        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM calendar_event_cache WHERE owner_id = ? AND source = ?")
            .bind(owner_id.as_str())
            .bind(source.as_str())
            .execute(&mut *tx)
            .await?;

        for event in &events {
            sqlx::query(
                "INSERT INTO calendar_event_cache
                    (id, owner_id, source, title, start_at, end_at, is_busy, synced_at, expires_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(owner_id, source, id) DO UPDATE SET
                     title = excluded.title,
                     start_at = excluded.start_at,
                     end_at = excluded.end_at,
                     is_busy = excluded.is_busy",
            )
            .bind(&event.id)
            .bind(owner_id.as_str())
            .bind(source.as_str())
            .bind(&event.title)
            .bind(encode_timestamp(event.start))
            .bind(encode_timestamp(event.end))
            .bind(event.is_busy)
            .bind(&synced_at)
            .bind(&expires_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn list_events(
        &self,
        owner_id: &UserId,
        range: &DateRange,
        now: DateTime<Utc>,
    ) -> Result<Vec<CalendarEvent>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, owner_id, source, title, start_at, end_at, is_busy
             FROM calendar_event_cache
             WHERE owner_id = ? AND expires_at > ? AND start_at < ? AND end_at > ?
             ORDER BY start_at, end_at, id",
        )
        .bind(owner_id.as_str())
        .bind(encode_timestamp(now))
        .bind(encode_timestamp(range.end))
        .bind(encode_timestamp(range.start))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(event_from_row).collect()
    }

    async fn find_preferences(
        &self,
        owner_id: &UserId,
    ) -> Result<Option<AvailabilityPreferences>, RepositoryError> {
        let row = sqlx::query(
            "SELECT working_hours_start, working_hours_end, buffer_minutes, timezone
             FROM availability_preferences WHERE owner_id = ?",
        )
        .bind(owner_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let start: String = row.try_get("working_hours_start").map_err(decode_error)?;
        let end: String = row.try_get("working_hours_end").map_err(decode_error)?;
        let buffer =
            parse_u32("buffer_minutes", row.try_get("buffer_minutes").map_err(decode_error)?)?;
        let timezone: String = row.try_get("timezone").map_err(decode_error)?;

        AvailabilityPreferences::parse(&start, &end, buffer, &timezone)
            .map(Some)
            .map_err(|error| RepositoryError::Decode(error.to_string()))
    }

    async fn save_preferences(
        &self,
        owner_id: &UserId,
        preferences: AvailabilityPreferences,
        now: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO availability_preferences
                (owner_id, working_hours_start, working_hours_end, buffer_minutes, timezone,
                 updated_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(owner_id) DO UPDATE SET
                 working_hours_start = excluded.working_hours_start,
                 working_hours_end = excluded.working_hours_end,
                 buffer_minutes = excluded.buffer_minutes,
                 timezone = excluded.timezone,
                 updated_at = excluded.updated_at",
        )
        .bind(owner_id.as_str())
        .bind(preferences.working_hours.start_label())
        .bind(preferences.working_hours.end_label())
        .bind(i64::from(preferences.buffer_minutes))
        .bind(preferences.timezone.name())
        .bind(encode_timestamp(now))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_team_visibility(
        &self,
        owner_id: &UserId,
    ) -> Result<Option<TeamVisibility>, RepositoryError> {
        let row = sqlx::query(
            "SELECT owner_id, practice_id, share_with_team, show_busy_only
             FROM team_visibility WHERE owner_id = ?",
        )
        .bind(owner_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(visibility_from_row).transpose()
    }

    async fn list_practice_members(
        &self,
        practice_id: &str,
    ) -> Result<Vec<TeamVisibility>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT owner_id, practice_id, share_with_team, show_busy_only
             FROM team_visibility WHERE practice_id = ? ORDER BY owner_id",
        )
        .bind(practice_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(visibility_from_row).collect()
    }

    async fn save_team_visibility(
        &self,
        visibility: TeamVisibility,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO team_visibility (owner_id, practice_id, share_with_team, show_busy_only)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(owner_id) DO UPDATE SET
                 practice_id = excluded.practice_id,
                 share_with_team = excluded.share_with_team,
                 show_busy_only = excluded.show_busy_only",
        )
        .bind(visibility.owner_id.as_str())
        .bind(&visibility.practice_id)
        .bind(visibility.share_with_team)
        .bind(visibility.show_busy_only)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration, Utc};
    use secrecy::{ExposeSecret, SecretString};

    use tandem_core::domain::calendar::{
        AvailabilityPreferences, CalendarEvent, CalendarIntegration, CalendarSource, DateRange,
    };
    use tandem_core::domain::identity::UserId;

    use super::SqlCalendarRepository;
    use crate::repositories::CalendarRepository;
    use crate::{connect_with_settings, migrations, DbPool};

    async fn setup_pool() -> DbPool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("run migrations");
        pool
    }

    fn parse_ts(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value).expect("timestamp").with_timezone(&Utc)
    }

    fn march_second() -> DateRange {
        DateRange::new(parse_ts("2026-03-02T00:00:00Z"), parse_ts("2026-03-03T00:00:00Z"))
            .expect("range")
    }

    fn event(id: &str, start: &str, end: &str, source: CalendarSource) -> CalendarEvent {
        CalendarEvent {
            id: id.to_string(),
            owner_id: UserId::from("therapist-1"),
            title: format!("event {id}"),
            start: parse_ts(start),
            end: parse_ts(end),
            is_busy: true,
            source,
        }
    }

    fn integration(provider: CalendarSource) -> CalendarIntegration {
        CalendarIntegration {
            owner_id: UserId::from("therapist-1"),
            provider,
            access_token: SecretString::from("access-1".to_string()),
            refresh_token: SecretString::from("refresh-1".to_string()),
            is_connected: true,
            last_synced_at: None,
        }
    }

    #[tokio::test]
    async fn replace_events_swaps_only_the_given_source() {
        let repo = SqlCalendarRepository::new(setup_pool().await);
        let owner = UserId::from("therapist-1");
        let now = parse_ts("2026-03-02T08:00:00Z");
        let expires = now + Duration::hours(24);
        let range = march_second();

        repo.replace_events(
            &owner,
            CalendarSource::Google,
            vec![event(
                "g1",
                "2026-03-02T10:00:00Z",
                "2026-03-02T11:00:00Z",
                CalendarSource::Google,
            )],
            now,
            expires,
        )
        .await
        .expect("google sync");
        repo.replace_events(
            &owner,
            CalendarSource::Outlook,
            vec![event(
                "o1",
                "2026-03-02T09:00:00Z",
                "2026-03-02T09:30:00Z",
                CalendarSource::Outlook,
            )],
            now,
            expires,
        )
        .await
        .expect("outlook sync");
        repo.replace_events(
            &owner,
            CalendarSource::Google,
            vec![event(
                "g2",
                "2026-03-02T14:00:00Z",
                "2026-03-02T15:00:00Z",
                CalendarSource::Google,
            )],
            now,
            expires,
        )
        .await
        .expect("google resync");

        let events = repo.list_events(&owner, &range, now).await.expect("list");
        let ids: Vec<&str> = events.iter().map(|event| event.id.as_str()).collect();
        assert_eq!(ids, vec!["o1", "g2"]);
    }

    #[tokio::test]
    async fn expired_cache_rows_are_ignored() {
        let repo = SqlCalendarRepository::new(setup_pool().await);
        let owner = UserId::from("therapist-1");
        let synced = parse_ts("2026-03-01T08:00:00Z");
        let range = march_second();

        repo.replace_events(
            &owner,
            CalendarSource::Google,
            vec![event(
                "g1",
                "2026-03-02T10:00:00Z",
                "2026-03-02T11:00:00Z",
                CalendarSource::Google,
            )],
            synced,
            synced + Duration::hours(24),
        )
        .await
        .expect("sync");

        let fresh =
            repo.list_events(&owner, &range, synced + Duration::hours(1)).await.expect("list");
        let stale =
            repo.list_events(&owner, &range, synced + Duration::hours(25)).await.expect("list");
        assert_eq!(fresh.len(), 1);
        assert!(stale.is_empty());
    }

    #[tokio::test]
    async fn disconnect_keeps_tokens_and_clears_cache() {
        let repo = SqlCalendarRepository::new(setup_pool().await);
        let owner = UserId::from("therapist-1");
        let now = parse_ts("2026-03-02T08:00:00Z");
        let range = march_second();

        repo.save_integration(integration(CalendarSource::Google)).await.expect("save");
        repo.replace_events(
            &owner,
            CalendarSource::Google,
            vec![event(
                "g1",
                "2026-03-02T10:00:00Z",
                "2026-03-02T11:00:00Z",
                CalendarSource::Google,
            )],
            now,
            now + Duration::hours(24),
        )
        .await
        .expect("sync");

        assert!(repo.disconnect(&owner, CalendarSource::Google, now).await.expect("disconnect"));
        assert!(repo.disconnect(&owner, CalendarSource::Google, now).await.expect("again"));
        assert!(!repo.disconnect(&owner, CalendarSource::Outlook, now).await.expect("missing"));

        let stored = repo
            .find_integration(&owner, CalendarSource::Google)
            .await
            .expect("find")
            .expect("row kept");
        assert!(!stored.is_connected);
        assert_eq!(stored.access_token.expose_secret(), "access-1");
        assert!(repo.list_events(&owner, &range, now).await.expect("list").is_empty());
        assert!(repo.list_connected_integrations(None).await.expect("connected").is_empty());
    }

    #[tokio::test]
    async fn preferences_round_trip_with_timezone() {
        let repo = SqlCalendarRepository::new(setup_pool().await);
        let owner = UserId::from("therapist-1");
        let prefs =
            AvailabilityPreferences::parse("08:30", "16:00", 10, "Europe/Berlin").expect("prefs");

        assert_eq!(repo.find_preferences(&owner).await.expect("empty"), None);
        repo.save_preferences(&owner, prefs.clone(), Utc::now()).await.expect("save");
        assert_eq!(repo.find_preferences(&owner).await.expect("find"), Some(prefs));
    }
}
