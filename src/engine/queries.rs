use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

use super::availability::compute_available_slots;
use super::{Engine, EngineError};

impl Engine {
    /// Grid start times on `date` at which `duration` minutes fit.
    ///
    /// `exclude` leaves one appointment out of the occupied set, for
    /// offering new times to an appointment that is being moved.
    pub async fn available_slots_for(
        &self,
        date: NaiveDate,
        duration: Minutes,
        exclude: Option<Ulid>,
    ) -> Vec<TimeOfDay> {
        let occupied = match self.days.get(&date).map(|e| e.value().clone()) {
            Some(day) => day.read().await.spans_excluding(exclude),
            None => Vec::new(),
        };
        compute_available_slots(self.grid.slots(), duration, &occupied)
    }

    /// Available start times for a set of services. Inactive services still
    /// count, so staff can re-offer times to existing appointments.
    pub async fn available_slots(
        &self,
        date: NaiveDate,
        service_ids: &[Ulid],
        exclude: Option<Ulid>,
    ) -> Result<Vec<TimeOfDay>, EngineError> {
        let (duration, _) = self.resolve_services(service_ids, true)?;
        Ok(self.available_slots_for(date, duration, exclude).await)
    }

    /// Occupied intervals on `date`, in start order.
    pub async fn occupied_spans(&self, date: NaiveDate) -> Vec<Span> {
        match self.days.get(&date).map(|e| e.value().clone()) {
            Some(day) => day.read().await.spans_excluding(None),
            None => Vec::new(),
        }
    }

    /// Every appointment on `date`, cancelled ones included, ordered by time.
    pub fn appointments_on(&self, date: NaiveDate) -> Vec<Appointment> {
        let mut list: Vec<Appointment> = self
            .appointments
            .iter()
            .filter(|a| a.date == date)
            .map(|a| a.value().clone())
            .collect();
        list.sort_by_key(|a| (a.time, a.id));
        list
    }

    pub fn get_appointment(&self, id: Ulid) -> Result<Appointment, EngineError> {
        self.appointments
            .get(&id)
            .map(|a| a.value().clone())
            .ok_or(EngineError::NotFound(id))
    }
}
