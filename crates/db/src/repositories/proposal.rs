use chrono::{DateTime, Utc};
use sqlx::Row;

use tandem_core::domain::calendar::TimeSlot;
use tandem_core::domain::identity::UserId;
use tandem_core::domain::proposal::{ProposalId, ProposalStatus, SlotProposal};

use super::{
    decode_error, encode_json, encode_timestamp, parse_json, parse_optional_timestamp,
    parse_timestamp, unknown_value, ProposalRepository, RepositoryError,
};
use crate::DbPool;

pub struct SqlProposalRepository {
    pool: DbPool,
}

impl SqlProposalRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn proposal_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<SlotProposal, RepositoryError> {
    let status: String = row.try_get("status").map_err(decode_error)?;
    let slots_json: String = row.try_get("proposed_slots_json").map_err(decode_error)?;
    let accepted_json: Option<String> = row.try_get("accepted_slot_json").map_err(decode_error)?;

    Ok(SlotProposal {
        id: ProposalId(row.try_get("id").map_err(decode_error)?),
        proposer_id: UserId(row.try_get("proposer_id").map_err(decode_error)?),
        recipient_id: UserId(row.try_get("recipient_id").map_err(decode_error)?),
        proposed_slots: parse_json::<Vec<TimeSlot>>("proposed_slots_json", &slots_json)?,
        status: ProposalStatus::parse(&status).ok_or_else(|| unknown_value("status", &status))?,
        accepted_slot: accepted_json
            .map(|json| parse_json::<TimeSlot>("accepted_slot_json", &json))
            .transpose()?,
        created_at: parse_timestamp(
            "created_at",
            row.try_get("created_at").map_err(decode_error)?,
        )?,
        expires_at: parse_timestamp(
            "expires_at",
            row.try_get("expires_at").map_err(decode_error)?,
        )?,
        responded_at: parse_optional_timestamp(
            "responded_at",
            row.try_get("responded_at").map_err(decode_error)?,
        )?,
    })
}

#[async_trait::async_trait]
impl ProposalRepository for SqlProposalRepository {
    async fn insert(&self, proposal: SlotProposal) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO slot_proposal
                (id, proposer_id, recipient_id, proposed_slots_json, status,
                 accepted_slot_json, created_at, expires_at, responded_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&proposal.id.0)
        .bind(proposal.proposer_id.as_str())
        .bind(proposal.recipient_id.as_str())
        .bind(encode_json("proposed_slots_json", &proposal.proposed_slots)?)
        .bind(proposal.status.as_str())
        .bind(
            proposal
                .accepted_slot
                .as_ref()
                .map(|slot| encode_json("accepted_slot_json", slot))
                .transpose()?,
        )
        .bind(encode_timestamp(proposal.created_at))
        .bind(encode_timestamp(proposal.expires_at))
        .bind(proposal.responded_at.map(encode_timestamp))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_by_id(&self, id: &ProposalId) -> Result<Option<SlotProposal>, RepositoryError> {
        let row = sqlx::query(
            "SELECT id, proposer_id, recipient_id, proposed_slots_json, status,
                    accepted_slot_json, created_at, expires_at, responded_at
             FROM slot_proposal WHERE id = ?",
        )
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(proposal_from_row).transpose()
    }

    async fn record_response(&self, proposal: SlotProposal) -> Result<(), RepositoryError> {
        let updated = sqlx::query(
            "UPDATE slot_proposal
             SET status = ?, accepted_slot_json = ?, responded_at = ?
             WHERE id = ? AND status = 'pending'",
        )
        .bind(proposal.status.as_str())
        .bind(
            proposal
                .accepted_slot
                .as_ref()
                .map(|slot| encode_json("accepted_slot_json", slot))
                .transpose()?,
        )
        .bind(proposal.responded_at.map(encode_timestamp))
        .bind(&proposal.id.0)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(RepositoryError::Conflict(format!(
                "proposal `{}` is no longer pending",
                proposal.id.0
            )));
        }
        Ok(())
    }

    async fn expire_due(&self, now: DateTime<Utc>) -> Result<u64, RepositoryError> {
        let now = encode_timestamp(now);
        let updated = sqlx::query(
            "UPDATE slot_proposal SET status = 'expired', responded_at = ?
             WHERE status = 'pending' AND expires_at <= ?",
        )
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(updated.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration, Utc};

    use tandem_core::domain::calendar::TimeSlot;
    use tandem_core::domain::identity::UserId;
    use tandem_core::domain::proposal::{ProposalId, ProposalStatus, SlotProposal};

    use super::SqlProposalRepository;
    use crate::repositories::{ProposalRepository, RepositoryError};
    use crate::{connect_with_settings, migrations};

    fn parse_ts(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value).expect("timestamp").with_timezone(&Utc)
    }

    fn proposal(id: &str, created_at: DateTime<Utc>) -> SlotProposal {
        let start = parse_ts("2026-03-05T10:00:00Z");
        let slots = (0..3)
            .map(|offset| TimeSlot {
                start: start + Duration::hours(offset),
                end: start + Duration::hours(offset) + Duration::minutes(50),
                confidence: 1.0,
            })
            .collect();
        SlotProposal::new(
            ProposalId(id.to_string()),
            UserId::from("therapist-1"),
            UserId::from("patient-1"),
            slots,
            created_at,
        )
        .expect("proposal")
    }

    async fn repo() -> SqlProposalRepository {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("run migrations");
        SqlProposalRepository::new(pool)
    }

    #[tokio::test]
    async fn accepted_response_is_persisted_once() {
        let repo = repo().await;
        let created_at = parse_ts("2026-03-02T09:00:00Z");
        let mut stored = proposal("p1", created_at);
        repo.insert(stored.clone()).await.expect("insert");

        stored.accept(1, created_at + Duration::hours(1)).expect("accept");
        repo.record_response(stored.clone()).await.expect("respond");

        let found = repo.find_by_id(&stored.id).await.expect("find").expect("exists");
        assert_eq!(found.status, ProposalStatus::Accepted);
        assert_eq!(found.accepted_slot, Some(stored.proposed_slots[1]));

        let replay = repo.record_response(stored).await;
        assert!(matches!(replay, Err(RepositoryError::Conflict(_))));
    }

    #[tokio::test]
    async fn sweep_expires_only_overdue_pending_proposals() {
        let repo = repo().await;
        let now = parse_ts("2026-03-05T12:00:00Z");
        repo.insert(proposal("old", now - Duration::hours(49))).await.expect("old");
        repo.insert(proposal("fresh", now - Duration::hours(2))).await.expect("fresh");

        assert_eq!(repo.expire_due(now).await.expect("sweep"), 1);
        assert_eq!(repo.expire_due(now).await.expect("second sweep"), 0);

        let old = repo.find_by_id(&ProposalId("old".into())).await.expect("find").expect("old");
        let fresh =
            repo.find_by_id(&ProposalId("fresh".into())).await.expect("find").expect("fresh");
        assert_eq!(old.status, ProposalStatus::Expired);
        assert_eq!(fresh.status, ProposalStatus::Pending);
        assert_eq!(old.expires_at, old.created_at + Duration::hours(48));
    }
}
