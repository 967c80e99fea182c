use chrono::{DateTime, NaiveTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use secrecy::SecretString;

use crate::domain::identity::UserId;
use crate::errors::DomainError;

pub const DEFAULT_WORKING_HOURS_START: &str = "09:00";
pub const DEFAULT_WORKING_HOURS_END: &str = "17:00";
pub const DEFAULT_BUFFER_MINUTES: u32 = 15;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalendarSource {
    Google,
    Outlook,
    Internal,
}

impl CalendarSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Google => "google",
            Self::Outlook => "outlook",
            Self::Internal => "internal",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "google" => Some(Self::Google),
            "outlook" => Some(Self::Outlook),
            "internal" => Some(Self::Internal),
            _ => None,
        }
    }

    /// Internal events are written by the platform itself and never synced.
    pub fn is_external(&self) -> bool {
        !matches!(self, Self::Internal)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarEvent {
    pub id: String,
    pub owner_id: UserId,
    pub title: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub is_busy: bool,
    pub source: CalendarSource,
}

impl CalendarEvent {
    pub fn overlaps(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        intervals_overlap(self.start, self.end, start, end)
    }
}

/// Half-open interval test: `[a_start, a_end)` and `[b_start, b_end)` share at least one instant.
pub fn intervals_overlap(
    a_start: DateTime<Utc>,
    a_end: DateTime<Utc>,
    b_start: DateTime<Utc>,
    b_end: DateTime<Utc>,
) -> bool {
    a_start < b_end && a_end > b_start
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl DateRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, DomainError> {
        if start > end {
            return Err(DomainError::InvalidDateRange { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TimeSlot {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub confidence: f32,
}

impl TimeSlot {
    pub fn duration_minutes(&self) -> i64 {
        (self.end - self.start).num_minutes()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorkingHours {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl WorkingHours {
    pub fn parse(start: &str, end: &str) -> Result<Self, DomainError> {
        let start = parse_clock(start)?;
        let end = parse_clock(end)?;
        if start >= end {
            return Err(DomainError::InvalidWorkingHours(format!(
                "working hours start {start} must be before end {end}"
            )));
        }
        Ok(Self { start, end })
    }

    pub fn start_label(&self) -> String {
        self.start.format("%H:%M").to_string()
    }

    pub fn end_label(&self) -> String {
        self.end.format("%H:%M").to_string()
    }
}

fn parse_clock(raw: &str) -> Result<NaiveTime, DomainError> {
    NaiveTime::parse_from_str(raw.trim(), "%H:%M").map_err(|_| {
        DomainError::InvalidWorkingHours(format!("`{raw}` is not a valid HH:MM clock time"))
    })
}

#[derive(Clone, Debug, PartialEq)]
pub struct AvailabilityPreferences {
    pub working_hours: WorkingHours,
    pub buffer_minutes: u32,
    pub timezone: Tz,
}

impl Default for AvailabilityPreferences {
    fn default() -> Self {
        Self {
            working_hours: WorkingHours {
                start: NaiveTime::from_hms_opt(9, 0, 0).unwrap_or_default(),
                end: NaiveTime::from_hms_opt(17, 0, 0).unwrap_or_default(),
            },
            buffer_minutes: DEFAULT_BUFFER_MINUTES,
            timezone: Tz::UTC,
        }
    }
}

impl AvailabilityPreferences {
    pub fn parse(
        working_hours_start: &str,
        working_hours_end: &str,
        buffer_minutes: u32,
        timezone: &str,
    ) -> Result<Self, DomainError> {
        let timezone = timezone
            .trim()
            .parse::<Tz>()
            .map_err(|_| DomainError::UnknownTimezone(timezone.to_string()))?;
        Ok(Self {
            working_hours: WorkingHours::parse(working_hours_start, working_hours_end)?,
            buffer_minutes,
            timezone,
        })
    }
}

/// OAuth-backed link between a therapist and an external calendar provider.
///
/// Disconnecting only flips `is_connected`; tokens stay on the row so the
/// integration can be re-authorised and audited later.
#[derive(Clone, Debug)]
pub struct CalendarIntegration {
    pub owner_id: UserId,
    pub provider: CalendarSource,
    pub access_token: SecretString,
    pub refresh_token: SecretString,
    pub is_connected: bool,
    pub last_synced_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TeamVisibility {
    pub owner_id: UserId,
    pub practice_id: String,
    pub share_with_team: bool,
    pub show_busy_only: bool,
}
