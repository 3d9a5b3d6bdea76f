use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::{AppointmentStatus, TimeOfDay};

#[derive(Debug)]
pub enum EngineError {
    /// Malformed input, rejected before any state is read. Carries the first violated rule.
    Validation(String),
    UnknownService(Ulid),
    InactiveService(Ulid),
    OutsideBusinessHours(TimeOfDay),
    /// The requested interval overlaps a booked appointment.
    SlotUnavailable {
        date: NaiveDate,
        time: TimeOfDay,
        conflicting: Ulid,
    },
    /// Rescheduling an appointment that is already complete or cancelled.
    Terminal {
        id: Ulid,
        status: AppointmentStatus,
    },
    InvalidTransition {
        from: AppointmentStatus,
        to: AppointmentStatus,
    },
    NotFound(Ulid),
    /// No live appointment carries this confirmation code and contact.
    NoMatchingBooking,
    AlreadyExists(Ulid),
    CodeSpaceExhausted,
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    /// Errors the caller can fix by changing the request, as opposed to server-side failures.
    pub fn is_rejection(&self) -> bool {
        !matches!(self, EngineError::WalError(_) | EngineError::CodeSpaceExhausted)
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Validation(msg) => write!(f, "validation error: {msg}"),
            EngineError::UnknownService(id) => write!(f, "unknown service: {id}"),
            EngineError::InactiveService(id) => write!(f, "service {id} is no longer offered"),
            EngineError::OutsideBusinessHours(time) => {
                write!(f, "{time} is outside business hours")
            }
            EngineError::SlotUnavailable { date, time, conflicting } => write!(
                f,
                "slot no longer available: {date} {time} conflicts with appointment {conflicting}"
            ),
            EngineError::Terminal { id, status } => {
                write!(f, "appointment {id} is {status} and cannot be rescheduled")
            }
            EngineError::InvalidTransition { from, to } => {
                write!(f, "invalid status transition: {from} -> {to}")
            }
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::NoMatchingBooking => {
                write!(f, "no appointment matches that confirmation number and contact")
            }
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::CodeSpaceExhausted => {
                write!(f, "could not allocate a unique confirmation code")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
