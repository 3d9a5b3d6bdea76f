use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Minutes since local midnight. The only time-of-day unit.
pub type Minutes = u32;

const MINUTES_PER_DAY: Minutes = 24 * 60;

/// Wall-clock time of day on the shop's local clock.
///
/// Dates and times travel as separate fields and are never merged into a
/// zoned timestamp, so a booking can never drift to a neighbouring day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TimeOfDay(Minutes);

impl TimeOfDay {
    pub const fn hm(hour: u32, minute: u32) -> Self {
        Self(hour * 60 + minute)
    }

    pub fn from_minutes(minutes: Minutes) -> Option<Self> {
        (minutes < MINUTES_PER_DAY).then_some(Self(minutes))
    }

    pub fn minutes(self) -> Minutes {
        self.0
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.0 / 60, self.0 % 60)
    }
}

impl FromStr for TimeOfDay {
    type Err = TimeParseError;

    /// Accepts `HH:MM` and the `HH:MM:SS` form Postgres `time` columns print.
    /// Seconds, when present, must be zero.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || TimeParseError(s.to_string());
        let mut parts = s.trim().split(':');
        let hour = parse_clock_field(parts.next(), 23).ok_or_else(err)?;
        let minute = parse_clock_field(parts.next(), 59).ok_or_else(err)?;
        if let Some(seconds) = parts.next()
            && parse_clock_field(Some(seconds), 59) != Some(0)
        {
            return Err(err());
        }
        if parts.next().is_some() {
            return Err(err());
        }
        Ok(Self(hour * 60 + minute))
    }
}

fn parse_clock_field(part: Option<&str>, max: u32) -> Option<u32> {
    let part = part?;
    if part.is_empty() || part.len() > 2 || !part.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    part.parse().ok().filter(|v| *v <= max)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeParseError(pub String);

impl fmt::Display for TimeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid time of day {:?} (expected HH:MM)", self.0)
    }
}

impl std::error::Error for TimeParseError {}

/// Half-open interval `[start, end)` in minutes since midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Minutes,
    pub end: Minutes,
}

impl Span {
    pub fn new(start: Minutes, end: Minutes) -> Self {
        debug_assert!(start <= end, "Span start must not be after end");
        Self { start, end }
    }

    pub fn starting_at(start: TimeOfDay, duration: Minutes) -> Self {
        Self::new(start.minutes(), start.minutes() + duration)
    }

    pub fn duration(&self) -> Minutes {
        self.end - self.start
    }

    /// Strict overlap. Touching endpoints do not count.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && self.end > other.start
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub id: Ulid,
    pub name: String,
    pub duration_minutes: Minutes,
    pub active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppointmentStatus {
    Pending,
    InProgress,
    Complete,
    Cancelled,
}

impl AppointmentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AppointmentStatus::Pending => "pending",
            AppointmentStatus::InProgress => "in_progress",
            AppointmentStatus::Complete => "complete",
            AppointmentStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, AppointmentStatus::Complete | AppointmentStatus::Cancelled)
    }

    /// Cancelled appointments free their interval; everything else holds it.
    pub fn occupies_slot(self) -> bool {
        self != AppointmentStatus::Cancelled
    }

    pub fn can_transition_to(self, next: AppointmentStatus) -> bool {
        use AppointmentStatus::*;
        matches!(
            (self, next),
            (Pending, InProgress) | (InProgress, Complete) | (Pending | InProgress, Cancelled)
        )
    }
}

impl fmt::Display for AppointmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AppointmentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pending" => Ok(AppointmentStatus::Pending),
            "in_progress" => Ok(AppointmentStatus::InProgress),
            "complete" => Ok(AppointmentStatus::Complete),
            "cancelled" => Ok(AppointmentStatus::Cancelled),
            other => Err(format!("unknown appointment status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Customer {
    pub name: String,
    pub email: String,
    pub phone: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vehicle {
    pub make: String,
    pub model: String,
    pub year: i32,
}

impl fmt::Display for Vehicle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.year, self.make, self.model)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Ulid,
    pub confirmation_code: String,
    pub customer: Customer,
    pub vehicle: Vehicle,
    pub date: NaiveDate,
    pub time: TimeOfDay,
    pub service_ids: Vec<Ulid>,
    /// Sum of the booked services' durations, fixed at booking time.
    pub duration_minutes: Minutes,
    pub notes: Option<String>,
    pub status: AppointmentStatus,
}

impl Appointment {
    pub fn span(&self) -> Span {
        Span::starting_at(self.time, self.duration_minutes)
    }
}

/// How a customer proves they own a confirmation code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Contact {
    Email(String),
    Phone(String),
}

impl Contact {
    pub fn matches(&self, customer: &Customer) -> bool {
        match self {
            Contact::Email(email) => customer.email == email.trim(),
            Contact::Phone(phone) => customer.phone == phone.trim(),
        }
    }
}

/// Occupied interval of one non-cancelled appointment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Occupancy {
    pub appointment_id: Ulid,
    pub span: Span,
}

/// Everything that blocks time on one calendar day, sorted by `span.start`.
#[derive(Debug, Clone)]
pub struct DayBook {
    pub date: NaiveDate,
    pub slots: Vec<Occupancy>,
}

impl DayBook {
    pub fn new(date: NaiveDate) -> Self {
        Self {
            date,
            slots: Vec::new(),
        }
    }

    /// Insert keeping the start order.
    pub fn insert(&mut self, occupancy: Occupancy) {
        let pos = self
            .slots
            .binary_search_by_key(&occupancy.span.start, |o| o.span.start)
            .unwrap_or_else(|e| e);
        self.slots.insert(pos, occupancy);
    }

    pub fn remove(&mut self, appointment_id: Ulid) -> Option<Occupancy> {
        let pos = self
            .slots
            .iter()
            .position(|o| o.appointment_id == appointment_id)?;
        Some(self.slots.remove(pos))
    }

    /// Occupied spans, optionally leaving one appointment out (the one being moved).
    pub fn spans_excluding(&self, exclude: Option<Ulid>) -> Vec<Span> {
        self.slots
            .iter()
            .filter(|o| Some(o.appointment_id) != exclude)
            .map(|o| o.span)
            .collect()
    }

    /// Entries whose span overlaps `query`. Entries starting at or after
    /// `query.end` are skipped by binary search.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Occupancy> {
        let right_bound = self.slots.partition_point(|o| o.span.start < query.end);
        self.slots[..right_bound]
            .iter()
            .filter(move |o| o.span.end > query.start)
    }
}

/// WAL record format. Flat, one variant per state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ServiceAdded {
        service: Service,
    },
    ServiceDeactivated {
        id: Ulid,
    },
    AppointmentBooked {
        appointment: Appointment,
    },
    AppointmentRescheduled {
        id: Ulid,
        date: NaiveDate,
        time: TimeOfDay,
    },
    StatusChanged {
        id: Ulid,
        status: AppointmentStatus,
    },
}
