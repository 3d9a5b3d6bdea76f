use chrono::NaiveDate;
use dashmap::mapref::entry::Entry;
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::notify::{Notification, NotificationKind};
use crate::observability::{BOOKINGS_TOTAL, CODE_COLLISIONS_TOTAL};

use super::conflict::{
    check_day_capacity, check_no_conflict, check_within_hours, current_year, generate_code,
};
use super::validation::normalize_booking;
use super::{Engine, EngineError};

/// A customer's booking form, before trimming and validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRequest {
    pub customer: Customer,
    pub vehicle: Vehicle,
    pub date: NaiveDate,
    pub time: TimeOfDay,
    pub service_ids: Vec<Ulid>,
    pub notes: Option<String>,
}

impl Engine {
    /// Book a new appointment.
    ///
    /// Input checks and the service lookup run first and touch no shared
    /// state. The overlap re-check, code allocation and WAL append then run
    /// under the day's write lock, so two requests for the same slot cannot
    /// both succeed. The confirmation email is queued after the lock drops.
    pub async fn submit_booking(&self, req: BookingRequest) -> Result<Appointment, EngineError> {
        let result = self.book(req).await;
        let outcome = match &result {
            Ok(_) => "booked",
            Err(EngineError::SlotUnavailable { .. }) => "conflict",
            Err(e) if e.is_rejection() => "rejected",
            Err(_) => "failed",
        };
        metrics::counter!(BOOKINGS_TOTAL, "outcome" => outcome).increment(1);
        result
    }

    async fn book(&self, req: BookingRequest) -> Result<Appointment, EngineError> {
        let req = normalize_booking(req, current_year())?;
        let (duration, service_names) = self.resolve_services(&req.service_ids, false)?;
        check_within_hours(&self.grid, req.time)?;

        let _gate = self.snapshot_gate.read().await;
        let mut days = self.lock_days(&[req.date]).await;
        for day in days.iter() {
            check_day_capacity(day, None)?;
            check_no_conflict(day, req.time, duration, None)?;
        }

        let id = Ulid::new();
        let confirmation_code = self.reserve_code(id, generate_code)?;
        let appointment = Appointment {
            id,
            confirmation_code: confirmation_code.clone(),
            customer: req.customer,
            vehicle: req.vehicle,
            date: req.date,
            time: req.time,
            service_ids: req.service_ids,
            duration_minutes: duration,
            notes: req.notes,
            status: AppointmentStatus::Pending,
        };
        let event = Event::AppointmentBooked {
            appointment: appointment.clone(),
        };
        if let Err(e) = self.persist_and_apply(&event, &mut days).await {
            self.codes.remove(&confirmation_code);
            return Err(e);
        }
        drop(days);

        info!(
            %id,
            code = %confirmation_code,
            date = %appointment.date,
            time = %appointment.time,
            duration,
            "appointment booked"
        );
        self.notifier.enqueue(Notification::for_appointment(
            NotificationKind::Booking,
            &appointment,
            service_names,
        ));
        Ok(appointment)
    }

    /// Claim a code no other appointment has ever used. The claim is atomic;
    /// on a collision a fresh code is drawn.
    pub(super) fn reserve_code(
        &self,
        id: Ulid,
        mut draw: impl FnMut() -> String,
    ) -> Result<String, EngineError> {
        for _ in 0..MAX_CODE_ATTEMPTS {
            let code = draw();
            match self.codes.entry(code.clone()) {
                Entry::Vacant(slot) => {
                    slot.insert(id);
                    return Ok(code);
                }
                Entry::Occupied(_) => {
                    metrics::counter!(CODE_COLLISIONS_TOTAL).increment(1);
                }
            }
        }
        Err(EngineError::CodeSpaceExhausted)
    }

    /// Find a live appointment by confirmation code, proven by the email or
    /// phone it was booked with.
    pub fn lookup_appointment(
        &self,
        code: &str,
        contact: &Contact,
    ) -> Result<Appointment, EngineError> {
        let code = code.trim().to_uppercase();
        let id = self
            .codes
            .get(&code)
            .map(|e| *e.value())
            .ok_or(EngineError::NoMatchingBooking)?;
        let appointment = self
            .appointments
            .get(&id)
            .map(|a| a.value().clone())
            .ok_or(EngineError::NoMatchingBooking)?;
        if appointment.status == AppointmentStatus::Cancelled || !contact.matches(&appointment.customer)
        {
            return Err(EngineError::NoMatchingBooking);
        }
        Ok(appointment)
    }

    /// Customer self-service cancellation. Only pending appointments qualify.
    pub async fn cancel_by_customer(
        &self,
        code: &str,
        contact: &Contact,
    ) -> Result<Appointment, EngineError> {
        let appointment = self.lookup_appointment(code, contact)?;
        self.transition(appointment.id, AppointmentStatus::Cancelled, None, true)
            .await
    }
}
