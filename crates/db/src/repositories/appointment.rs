use sqlx::Row;

use tandem_core::domain::appointment::{
    Appointment, AppointmentId, AppointmentStatus, BookingOutcome,
};
use tandem_core::domain::calendar::DateRange;
use tandem_core::domain::identity::UserId;

use super::{
    decode_error, encode_timestamp, parse_timestamp, unknown_value, AppointmentRepository,
    RepositoryError,
};
use crate::DbPool;

pub struct SqlAppointmentRepository {
    pool: DbPool,
}

impl SqlAppointmentRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn appointment_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Appointment, RepositoryError> {
    let status: String = row.try_get("status").map_err(decode_error)?;
    Ok(Appointment {
        id: AppointmentId(row.try_get("id").map_err(decode_error)?),
        therapist_id: UserId(row.try_get("therapist_id").map_err(decode_error)?),
        patient_id: UserId(row.try_get("patient_id").map_err(decode_error)?),
        start: parse_timestamp("start_at", row.try_get("start_at").map_err(decode_error)?)?,
        end: parse_timestamp("end_at", row.try_get("end_at").map_err(decode_error)?)?,
        status: AppointmentStatus::parse(&status).ok_or_else(|| unknown_value("status", &status))?,
        notes: row.try_get("notes").map_err(decode_error)?,
        created_at: parse_timestamp(
            "created_at",
            row.try_get("created_at").map_err(decode_error)?,
        )?,
    })
}

const APPOINTMENT_COLUMNS: &str =
    "id, therapist_id, patient_id, start_at, end_at, status, notes, created_at";

#[async_trait::async_trait]
impl AppointmentRepository for SqlAppointmentRepository {
    async fn book(&self, appointment: Appointment) -> Result<BookingOutcome, RepositoryError> {
        let start_at = encode_timestamp(appointment.start);
        let end_at = encode_timestamp(appointment.end);

        let mut tx = self.pool.begin().await?;
        let conflicts: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM appointment
             WHERE therapist_id = ?
               AND status IN ('pending', 'confirmed')
               AND start_at < ?
               AND end_at > ?",
        )
        .bind(appointment.therapist_id.as_str())
        .bind(&end_at)
        .bind(&start_at)
        .fetch_one(&mut *tx)
        .await?;

        if conflicts > 0 {
            tx.rollback().await?;
            return Ok(BookingOutcome::Conflict {
                conflict_count: usize::try_from(conflicts).unwrap_or(usize::MAX),
            });
        }

        sqlx::query(
            "INSERT INTO appointment
                (id, therapist_id, patient_id, start_at, end_at, status, notes, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&appointment.id.0)
        .bind(appointment.therapist_id.as_str())
        .bind(appointment.patient_id.as_str())
        .bind(&start_at)
        .bind(&end_at)
        .bind(appointment.status.as_str())
        .bind(&appointment.notes)
        .bind(encode_timestamp(appointment.created_at))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(BookingOutcome::Booked(appointment))
    }

    async fn find_by_id(
        &self,
        id: &AppointmentId,
    ) -> Result<Option<Appointment>, RepositoryError> {
        let sql = format!("SELECT {APPOINTMENT_COLUMNS} FROM appointment WHERE id = ?");
        let row = sqlx::query(&sql)
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(appointment_from_row).transpose()
    }

    async fn list_for_participant(
        &self,
        user_id: &UserId,
        range: &DateRange,
    ) -> Result<Vec<Appointment>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {APPOINTMENT_COLUMNS} FROM appointment
             WHERE (therapist_id = ? OR patient_id = ?) AND start_at >= ? AND start_at < ?
             ORDER BY start_at"
        ))
        .bind(user_id.as_str())
        .bind(user_id.as_str())
        .bind(encode_timestamp(range.start))
        .bind(encode_timestamp(range.end))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(appointment_from_row).collect()
    }

    async fn list_blocking(
        &self,
        therapist_id: &UserId,
        range: &DateRange,
    ) -> Result<Vec<Appointment>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {APPOINTMENT_COLUMNS} FROM appointment
             WHERE therapist_id = ?
               AND status IN ('pending', 'confirmed')
               AND start_at < ? AND end_at > ?
             ORDER BY start_at"
        ))
        .bind(therapist_id.as_str())
        .bind(encode_timestamp(range.end))
        .bind(encode_timestamp(range.start))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(appointment_from_row).collect()
    }
}
