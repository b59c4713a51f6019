//! Weekly schedule evaluation: does a zone need water right now?

use chrono::{DateTime, Datelike, Duration, Local, NaiveDateTime, NaiveTime};

use crate::config::{TimeWindow, ZoneEntry};
use crate::error::ScheduleError;

/// Weekday index for a three-letter day code, Mon = 0 .. Sun = 6.
pub(crate) fn parse_day(day: &str) -> Result<i64, ScheduleError> {
    match day {
        "Mon" => Ok(0),
        "Tue" => Ok(1),
        "Wed" => Ok(2),
        "Thu" => Ok(3),
        "Fri" => Ok(4),
        "Sat" => Ok(5),
        "Sun" => Ok(6),
        other => Err(ScheduleError::InvalidDay(other.to_string())),
    }
}

pub(crate) fn parse_start_time(time: &str) -> Result<NaiveTime, ScheduleError> {
    NaiveTime::parse_from_str(time, "%H:%M")
        .map_err(|_| ScheduleError::InvalidTime(time.to_string()))
}

/// Whether `now` falls inside this week's occurrence of the window.
///
/// The occurrence starts on the next calendar date matching `window.day`
/// (today included) and spans `[start, start + duration]`, both ends
/// inclusive. A zero-duration window collapses to the single instant of its
/// start.
fn window_contains(window: &TimeWindow, now: DateTime<Local>) -> Result<bool, ScheduleError> {
    let target_weekday = parse_day(&window.day)?;
    let start_time = parse_start_time(&window.time)?;

    let today_weekday = now.weekday().num_days_from_monday() as i64;
    let days_difference = (target_weekday - today_weekday).rem_euclid(7);
    let start_date = now.date_naive() + Duration::days(days_difference);

    let interval_start = NaiveDateTime::new(start_date, start_time);
    let interval_end = interval_start + Duration::minutes(window.duration);

    let now = now.naive_local();
    Ok(interval_start <= now && now <= interval_end)
}

/// True when any of the zone's windows is currently open.
pub(crate) fn needs_water(zone: &ZoneEntry, now: DateTime<Local>) -> Result<bool, ScheduleError> {
    for window in &zone.schedule {
        if window_contains(window, now)? {
            return Ok(true);
        }
    }
    Ok(false)
}

// ===========================================================================
// Tests
// ===========================================================================
