mod availability;
mod booking;
mod catalog;
mod conflict;
mod error;
mod queries;
mod schedule;
mod validation;
#[cfg(test)]
mod tests;

pub use availability::{SlotGrid, compute_available_slots, is_slot_free};
pub use booking::BookingRequest;
pub use error::EngineError;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::NaiveDate;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedRwLockWriteGuard, RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::model::*;
use crate::notify::Notifier;
use crate::wal::Wal;

pub type SharedDayBook = Arc<RwLock<DayBook>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut pending = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            pending = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                commit_batch(&mut wal, &mut batch);
                if let Some(other) = pending {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so half-buffered bytes don't ride
    // along with the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            let mut batch = vec![(event, response)];
            commit_batch(wal, &mut batch);
        }
    }
}

// ── Day locks ────────────────────────────────────────────

/// Write guards on the day books an operation touches, acquired in date order.
pub(super) struct LockedDays(Vec<OwnedRwLockWriteGuard<DayBook>>);

impl LockedDays {
    pub(super) fn none() -> Self {
        Self(Vec::new())
    }

    pub(super) fn iter(&self) -> impl Iterator<Item = &DayBook> {
        self.0.iter().map(|g| &**g)
    }

    fn get_mut(&mut self, date: NaiveDate) -> Option<&mut DayBook> {
        self.0.iter_mut().map(|g| &mut **g).find(|b| b.date == date)
    }
}

pub struct Engine {
    pub(super) services: DashMap<Ulid, Service>,
    pub(super) appointments: DashMap<Ulid, Appointment>,
    /// Confirmation code → appointment id. Codes are never reused, even after cancellation.
    pub(super) codes: DashMap<String, Ulid>,
    pub(super) days: DashMap<NaiveDate, SharedDayBook>,
    /// Serializes catalog writes so id and count checks hold until the event is applied.
    pub(super) catalog_lock: Mutex<()>,
    /// Mutations hold this for reading; compaction takes it for writing so the
    /// snapshot never misses an event that is durable but not yet applied.
    pub(super) snapshot_gate: RwLock<()>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub(super) notifier: Notifier,
    pub(super) grid: SlotGrid,
}

impl Engine {
    pub fn new(wal_path: PathBuf, notifier: Notifier) -> io::Result<Self> {
        Self::with_grid(wal_path, notifier, SlotGrid::default())
    }

    pub fn with_grid(wal_path: PathBuf, notifier: Notifier, grid: SlotGrid) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            services: DashMap::new(),
            appointments: DashMap::new(),
            codes: DashMap::new(),
            days: DashMap::new(),
            catalog_lock: Mutex::new(()),
            snapshot_gate: RwLock::new(()),
            wal_tx,
            notifier,
            grid,
        };

        // Nothing else holds these locks yet, so try_write always succeeds.
        // blocking_write would panic inside the runtime.
        for event in &events {
            let mut guards = Vec::new();
            for date in engine.days_touched(event) {
                let guard = engine
                    .day(date)
                    .try_write_owned()
                    .map_err(|_| io::Error::other("replay: day book already locked"))?;
                guards.push(guard);
            }
            engine.apply(event, &mut LockedDays(guards));
        }

        tracing::info!(
            events = events.len(),
            services = engine.services.len(),
            appointments = engine.appointments.len(),
            "engine state restored from {}",
            wal_path.display()
        );
        Ok(engine)
    }

    pub fn grid(&self) -> &SlotGrid {
        &self.grid
    }

    /// Day book for `date`, created empty on first use.
    pub(super) fn day(&self, date: NaiveDate) -> SharedDayBook {
        self.days
            .entry(date)
            .or_insert_with(|| Arc::new(RwLock::new(DayBook::new(date))))
            .value()
            .clone()
    }

    /// Write-lock every listed day, in ascending date order.
    pub(super) async fn lock_days(&self, dates: &[NaiveDate]) -> LockedDays {
        let mut dates = dates.to_vec();
        dates.sort_unstable();
        dates.dedup();
        let mut guards = Vec::with_capacity(dates.len());
        for date in dates {
            guards.push(self.day(date).write_owned().await);
        }
        LockedDays(guards)
    }

    fn days_touched(&self, event: &Event) -> Vec<NaiveDate> {
        let mut dates = match event {
            Event::ServiceAdded { .. } | Event::ServiceDeactivated { .. } => Vec::new(),
            Event::AppointmentBooked { appointment } => vec![appointment.date],
            Event::AppointmentRescheduled { id, date, .. } => self
                .appointments
                .get(id)
                .map(|a| vec![a.date, *date])
                .unwrap_or_default(),
            Event::StatusChanged { id, .. } => self
                .appointments
                .get(id)
                .map(|a| vec![a.date])
                .unwrap_or_default(),
        };
        dates.sort_unstable();
        dates.dedup();
        dates
    }

    /// Apply an event to memory. `days` must hold every day the event touches.
    fn apply(&self, event: &Event, days: &mut LockedDays) {
        match event {
            Event::ServiceAdded { service } => {
                self.services.insert(service.id, service.clone());
            }
            Event::ServiceDeactivated { id } => {
                if let Some(mut service) = self.services.get_mut(id) {
                    service.active = false;
                }
            }
            Event::AppointmentBooked { appointment } => {
                self.codes
                    .insert(appointment.confirmation_code.clone(), appointment.id);
                if appointment.status.occupies_slot()
                    && let Some(book) = days.get_mut(appointment.date)
                {
                    book.insert(Occupancy {
                        appointment_id: appointment.id,
                        span: appointment.span(),
                    });
                }
                self.appointments.insert(appointment.id, appointment.clone());
            }
            Event::AppointmentRescheduled { id, date, time } => {
                let Some(mut appointment) = self.appointments.get_mut(id) else {
                    return;
                };
                if let Some(book) = days.get_mut(appointment.date) {
                    book.remove(*id);
                }
                appointment.date = *date;
                appointment.time = *time;
                if appointment.status.occupies_slot()
                    && let Some(book) = days.get_mut(*date)
                {
                    book.insert(Occupancy {
                        appointment_id: *id,
                        span: appointment.span(),
                    });
                }
            }
            Event::StatusChanged { id, status } => {
                let Some(mut appointment) = self.appointments.get_mut(id) else {
                    return;
                };
                appointment.status = *status;
                if !status.occupies_slot()
                    && let Some(book) = days.get_mut(appointment.date)
                {
                    book.remove(*id);
                }
            }
        }
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// WAL-append then apply. Nothing changes in memory unless the append was durable.
    pub(super) async fn persist_and_apply(
        &self,
        event: &Event,
        days: &mut LockedDays,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.apply(event, days);
        Ok(())
    }

    /// Rewrite the WAL with only the events needed to recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.snapshot_gate.write().await;

        let mut services: Vec<Service> = self.services.iter().map(|e| e.value().clone()).collect();
        services.sort_by_key(|s| s.id);
        let mut appointments: Vec<Appointment> =
            self.appointments.iter().map(|e| e.value().clone()).collect();
        appointments.sort_by_key(|a| a.id);

        let events: Vec<Event> = services
            .into_iter()
            .map(|service| Event::ServiceAdded { service })
            .chain(
                appointments
                    .into_iter()
                    .map(|appointment| Event::AppointmentBooked { appointment }),
            )
            .collect();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
