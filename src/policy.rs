//! Cancellation refund policy.
//!
//! A cancellation is refunded iff it happens strictly before
//! `cutoff - window`, where the cutoff is the event's end time, or its start
//! time when the end is missing or unreadable. Everything here is pure.

use crate::money::Money;
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, Utc};
use serde::Deserialize;

pub const REFUND_WINDOW_DAYS: i64 = 14;

/// Event timing as stored by the catalog, unparsed.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct EventSchedule {
    pub starts_at: Option<String>,
    pub ends_at: Option<String>,
}

impl EventSchedule {
    pub fn new(starts_at: Option<&str>, ends_at: Option<&str>) -> Self {
        EventSchedule {
            starts_at: starts_at.map(str::to_string),
            ends_at: ends_at.map(str::to_string),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefundDecision {
    /// Free event, nothing to refund.
    NotApplicable,
    Eligible { deadline: DateTime<Utc> },
    WindowClosed { deadline: DateTime<Utc> },
    /// Neither end nor start time could be read, or the deadline falls
    /// outside the calendar. Never refunded.
    UnparsableCutoff,
}

impl RefundDecision {
    pub fn is_eligible(self) -> bool {
        matches!(self, RefundDecision::Eligible { .. })
    }
}

/// Accepts RFC 3339, `YYYY-MM-DDTHH:MM:SS[.f]` / `YYYY-MM-DD HH:MM:SS`
/// (read as UTC) and bare `YYYY-MM-DD` (midnight UTC).
pub fn parse_event_time(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(at) = DateTime::parse_from_rfc3339(raw) {
        return Some(at.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(at) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(at.and_utc());
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|at| at.and_utc())
}

pub fn event_cutoff(schedule: &EventSchedule) -> Option<DateTime<Utc>> {
    schedule
        .ends_at
        .as_deref()
        .and_then(parse_event_time)
        .or_else(|| schedule.starts_at.as_deref().and_then(parse_event_time))
}

pub fn evaluate(
    schedule: &EventSchedule,
    price: Money,
    now: DateTime<Utc>,
    window: Duration,
) -> RefundDecision {
    if !price.is_positive() {
        return RefundDecision::NotApplicable;
    }
    let Some(cutoff) = event_cutoff(schedule) else {
        return RefundDecision::UnparsableCutoff;
    };
    // A cutoff at the edge of the calendar has no representable deadline.
    let Some(deadline) = cutoff.checked_sub_signed(window) else {
        return RefundDecision::UnparsableCutoff;
    };
    if now < deadline {
        RefundDecision::Eligible { deadline }
    } else {
        RefundDecision::WindowClosed { deadline }
    }
}

pub fn is_refund_eligible(schedule: &EventSchedule, price: Money, now: DateTime<Utc>) -> bool {
    evaluate(schedule, price, now, Duration::days(REFUND_WINDOW_DAYS)).is_eligible()
}
