use chrono::Datelike;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::EngineError;
use super::availability::{SlotGrid, is_slot_free};

pub(crate) fn current_year() -> i32 {
    chrono::Local::now().year()
}

pub(crate) fn check_within_hours(grid: &SlotGrid, time: TimeOfDay) -> Result<(), EngineError> {
    if grid.within_hours(time) {
        Ok(())
    } else {
        Err(EngineError::OutsideBusinessHours(time))
    }
}

/// Write-time re-check. Runs the same predicate the availability listing
/// uses, against the day as it stands under the write lock.
pub(crate) fn check_no_conflict(
    day: &DayBook,
    time: TimeOfDay,
    duration: Minutes,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    if is_slot_free(time, duration, &day.spans_excluding(exclude)) {
        return Ok(());
    }
    let candidate = Span::starting_at(time, duration);
    match day
        .overlapping(&candidate)
        .find(|o| Some(o.appointment_id) != exclude)
    {
        Some(hit) => Err(EngineError::SlotUnavailable {
            date: day.date,
            time,
            conflicting: hit.appointment_id,
        }),
        None => Ok(()),
    }
}

/// A move within the same day never adds an occupant.
pub(crate) fn check_day_capacity(day: &DayBook, moving: Option<Ulid>) -> Result<(), EngineError> {
    let already_here = moving.is_some_and(|id| day.slots.iter().any(|o| o.appointment_id == id));
    if !already_here && day.slots.len() >= MAX_APPOINTMENTS_PER_DAY {
        return Err(EngineError::LimitExceeded("too many appointments on one day"));
    }
    Ok(())
}

/// Eight Crockford base32 characters from the random half of a fresh ULID.
pub(crate) fn generate_code() -> String {
    let ulid = Ulid::new().to_string();
    ulid[ulid.len() - CONFIRMATION_CODE_LEN..].to_string()
}
