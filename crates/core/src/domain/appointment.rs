use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::calendar::intervals_overlap;
use crate::domain::identity::UserId;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AppointmentId(pub String);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppointmentStatus {
    Pending,
    Confirmed,
    Cancelled,
    Completed,
}

impl AppointmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Cancelled => "cancelled",
            Self::Completed => "completed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "confirmed" => Some(Self::Confirmed),
            "cancelled" => Some(Self::Cancelled),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }

    /// Statuses that hold the therapist's time and therefore block new bookings.
    pub fn blocks_calendar(&self) -> bool {
        matches!(self, Self::Pending | Self::Confirmed)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: AppointmentId,
    pub therapist_id: UserId,
    pub patient_id: UserId,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub status: AppointmentStatus,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Appointment {
    pub fn conflicts_with(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        self.status.blocks_calendar() && intervals_overlap(self.start, self.end, start, end)
    }
}

/// Result of an attempted booking. A conflict is an expected business outcome.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BookingOutcome {
    Booked(Appointment),
    Conflict { conflict_count: usize },
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};

    use super::{Appointment, AppointmentId, AppointmentStatus};
    use crate::domain::identity::UserId;

    fn appointment(status: AppointmentStatus) -> Appointment {
        let start = Utc.with_ymd_and_hms(2026, 4, 1, 10, 0, 0).single().expect("timestamp");
        Appointment {
            id: AppointmentId("apt-1".to_string()),
            therapist_id: UserId::from("therapist-1"),
            patient_id: UserId::from("patient-1"),
            start,
            end: start + Duration::minutes(50),
            status,
            notes: None,
            created_at: start,
        }
    }

    #[test]
    fn cancelled_appointments_never_conflict() {
        let existing = appointment(AppointmentStatus::Cancelled);
        assert!(!existing.conflicts_with(existing.start, existing.end));
    }

    #[test]
    fn adjacent_booking_does_not_conflict() {
        let existing = appointment(AppointmentStatus::Confirmed);
        assert!(!existing.conflicts_with(existing.end, existing.end + Duration::minutes(50)));
        assert!(existing.conflicts_with(existing.end - Duration::minutes(1), existing.end));
    }

    #[test]
    fn status_storage_encoding_round_trips() {
        for status in [
            AppointmentStatus::Pending,
            AppointmentStatus::Confirmed,
            AppointmentStatus::Cancelled,
            AppointmentStatus::Completed,
        ] {
            assert_eq!(AppointmentStatus::parse(status.as_str()), Some(status));
        }
    }
}
