//! Free-slot search over merged calendar events.
//!
//! Working hours are evaluated per local day in the owner's timezone and then
//! converted to UTC, so daylight-saving shifts move the window rather than
//! stretching it.

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;

use crate::domain::calendar::{AvailabilityPreferences, CalendarEvent, DateRange, TimeSlot};

pub const SLOT_CONFIDENCE: f32 = 1.0;
const MAX_DST_GAP_MINUTES: i64 = 180;

/// Returns bookable slots of exactly `duration`, ordered by start.
///
/// Every slot keeps `buffer_minutes` of clearance from busy events on both
/// sides. Slots never cross the end of a working-hours window.
pub fn find_free_slots(
    events: &[CalendarEvent],
    range: &DateRange,
    duration: Duration,
    prefs: &AvailabilityPreferences,
) -> Vec<TimeSlot> {
    if duration <= Duration::zero() || range.is_empty() {
        return Vec::new();
    }

    let buffer = Duration::minutes(i64::from(prefs.buffer_minutes));
    let mut busy: Vec<&CalendarEvent> = events.iter().filter(|event| event.is_busy).collect();
    busy.sort_by_key(|event| (event.start, event.end));

    let mut slots = Vec::new();
    for day in local_days(range, prefs.timezone) {
        let Some((window_start, window_end)) = working_window(day, range, prefs) else {
            continue;
        };

        let mut cursor = window_start;
        for event in busy.iter().filter(|event| {
            event.end + buffer > window_start && event.start - buffer < window_end
        }) {
            pack_gap(&mut slots, &mut cursor, event.start, window_end, duration, buffer);
            cursor = cursor.max(event.end + buffer);
        }
        pack_gap(&mut slots, &mut cursor, window_end, window_end, duration, buffer);
    }
    slots
}

fn pack_gap(
    slots: &mut Vec<TimeSlot>,
    cursor: &mut DateTime<Utc>,
    boundary: DateTime<Utc>,
    window_end: DateTime<Utc>,
    duration: Duration,
    buffer: Duration,
) {
    let step = duration + buffer;
    while boundary - *cursor >= step && *cursor + duration <= window_end {
        slots.push(TimeSlot {
            start: *cursor,
            end: *cursor + duration,
            confidence: SLOT_CONFIDENCE,
        });
        *cursor = *cursor + step;
    }
}

fn local_days(range: &DateRange, tz: Tz) -> impl Iterator<Item = NaiveDate> {
    let first = range.start.with_timezone(&tz).date_naive();
    let last = range.end.with_timezone(&tz).date_naive();
    first.iter_days().take_while(move |day| *day <= last)
}

fn working_window(
    day: NaiveDate,
    range: &DateRange,
    prefs: &AvailabilityPreferences,
) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let start = local_instant(day, prefs.working_hours.start, prefs.timezone)?;
    let end = local_instant(day, prefs.working_hours.end, prefs.timezone)?;
    let start = start.max(range.start);
    let end = end.min(range.end);
    (start < end).then_some((start, end))
}

/// A wall-clock time skipped by a daylight-saving jump resolves to the first
/// valid instant after the jump.
fn local_instant(day: NaiveDate, time: NaiveTime, tz: Tz) -> Option<DateTime<Utc>> {
    let wall = day.and_time(time);
    (0..=MAX_DST_GAP_MINUTES)
        .find_map(|minutes| tz.from_local_datetime(&(wall + Duration::minutes(minutes))).earliest())
        .map(|local| local.with_timezone(&Utc))
}
