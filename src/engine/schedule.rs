use chrono::NaiveDate;
use tracing::info;
use ulid::Ulid;

use crate::model::*;
use crate::notify::{Invoice, Notification, NotificationKind};
use crate::observability::{RESCHEDULES_TOTAL, STATUS_CHANGES_TOTAL};

use super::conflict::{check_day_capacity, check_no_conflict, check_within_hours};
use super::{Engine, EngineError, LockedDays};

impl Engine {
    /// Move an appointment to a new date and time.
    ///
    /// Complete and cancelled appointments are refused before any availability
    /// work. Otherwise both the old and the new day are locked, and the new
    /// interval is checked against the new day with the appointment itself left
    /// out, so shifting within its own interval is allowed.
    pub async fn reschedule_appointment(
        &self,
        id: Ulid,
        date: NaiveDate,
        time: TimeOfDay,
    ) -> Result<Appointment, EngineError> {
        let result = self.reschedule(id, date, time).await;
        let outcome = match &result {
            Ok(_) => "moved",
            Err(EngineError::SlotUnavailable { .. }) => "conflict",
            Err(e) if e.is_rejection() => "rejected",
            Err(_) => "failed",
        };
        metrics::counter!(RESCHEDULES_TOTAL, "outcome" => outcome).increment(1);
        result
    }

    async fn reschedule(
        &self,
        id: Ulid,
        date: NaiveDate,
        time: TimeOfDay,
    ) -> Result<Appointment, EngineError> {
        let existing = self.get_appointment(id)?;
        if existing.status.is_terminal() {
            return Err(EngineError::Terminal {
                id,
                status: existing.status,
            });
        }
        check_within_hours(&self.grid, time)?;

        let _gate = self.snapshot_gate.read().await;
        let (mut days, current) = loop {
            let from = self.get_appointment(id)?.date;
            let days = self.lock_days(&[from, date]).await;
            let current = self.get_appointment(id)?;
            // Moved by someone else while we waited for the locks.
            if current.date == from {
                break (days, current);
            }
        };
        if current.status.is_terminal() {
            return Err(EngineError::Terminal {
                id,
                status: current.status,
            });
        }
        for day in days.iter().filter(|d| d.date == date) {
            check_day_capacity(day, Some(id))?;
            check_no_conflict(day, time, current.duration_minutes, Some(id))?;
        }

        let event = Event::AppointmentRescheduled { id, date, time };
        self.persist_and_apply(&event, &mut days).await?;
        drop(days);

        let moved = Appointment {
            date,
            time,
            ..current
        };
        info!(%id, from = %existing.date, to = %date, %time, "appointment rescheduled");
        self.notifier.enqueue(Notification::for_appointment(
            NotificationKind::Update,
            &moved,
            self.service_names(&moved.service_ids),
        ));
        Ok(moved)
    }

    /// Staff status change: start work, finish it, or cancel.
    pub async fn set_status(
        &self,
        id: Ulid,
        status: AppointmentStatus,
    ) -> Result<Appointment, EngineError> {
        self.transition(id, status, None, false).await
    }

    /// Mark work complete and send the customer the invoice as given.
    pub async fn complete_appointment(
        &self,
        id: Ulid,
        invoice: Option<Invoice>,
    ) -> Result<Appointment, EngineError> {
        self.transition(id, AppointmentStatus::Complete, invoice, false)
            .await
    }

    /// Lock the day an appointment currently sits on.
    async fn lock_appointment_day(&self, id: Ulid) -> Result<(LockedDays, Appointment), EngineError> {
        loop {
            let date = self.get_appointment(id)?.date;
            let days = self.lock_days(&[date]).await;
            let current = self.get_appointment(id)?;
            if current.date == date {
                return Ok((days, current));
            }
        }
    }

    pub(super) async fn transition(
        &self,
        id: Ulid,
        to: AppointmentStatus,
        invoice: Option<Invoice>,
        pending_only: bool,
    ) -> Result<Appointment, EngineError> {
        let _gate = self.snapshot_gate.read().await;
        let (mut days, current) = self.lock_appointment_day(id).await?;
        let from = current.status;
        if !from.can_transition_to(to) || (pending_only && from != AppointmentStatus::Pending) {
            return Err(EngineError::InvalidTransition { from, to });
        }

        let event = Event::StatusChanged { id, status: to };
        self.persist_and_apply(&event, &mut days).await?;
        drop(days);

        metrics::counter!(STATUS_CHANGES_TOTAL, "status" => to.as_str()).increment(1);
        info!(%id, %from, %to, "appointment status changed");

        let updated = Appointment {
            status: to,
            ..current
        };
        let kind = match to {
            AppointmentStatus::InProgress => Some(NotificationKind::InProgress),
            AppointmentStatus::Complete => Some(NotificationKind::Complete),
            AppointmentStatus::Cancelled => Some(NotificationKind::Cancel),
            AppointmentStatus::Pending => None,
        };
        if let Some(kind) = kind {
            let mut notification = Notification::for_appointment(
                kind,
                &updated,
                self.service_names(&updated.service_ids),
            );
            notification.invoice = invoice;
            self.notifier.enqueue(notification);
        }
        Ok(updated)
    }
}
