use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use crate::mailer::{Branding, Email, MailError, Mailer, render};
use crate::model::*;
use crate::observability::NOTIFICATIONS_TOTAL;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    Booking,
    Update,
    Cancel,
    InProgress,
    Complete,
}

impl NotificationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            NotificationKind::Booking => "booking",
            NotificationKind::Update => "update",
            NotificationKind::Cancel => "cancel",
            NotificationKind::InProgress => "in_progress",
            NotificationKind::Complete => "complete",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceLine {
    pub service: String,
    pub cost_cents: i64,
}

/// Invoice breakdown computed by the back office and forwarded as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invoice {
    pub lines: Vec<InvoiceLine>,
    pub items_purchased: Option<String>,
    pub subtotal_cents: i64,
    pub taxes_cents: i64,
    pub total_cents: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub kind: NotificationKind,
    pub to: String,
    pub customer_name: String,
    pub confirmation_code: String,
    pub date: NaiveDate,
    pub time: TimeOfDay,
    pub services: Vec<String>,
    pub vehicle: Vehicle,
    pub notes: Option<String>,
    pub invoice: Option<Invoice>,
}

impl Notification {
    pub fn for_appointment(
        kind: NotificationKind,
        appointment: &Appointment,
        services: Vec<String>,
    ) -> Self {
        Self {
            kind,
            to: appointment.customer.email.clone(),
            customer_name: appointment.customer.name.clone(),
            confirmation_code: appointment.confirmation_code.clone(),
            date: appointment.date,
            time: appointment.time,
            services,
            vehicle: appointment.vehicle.clone(),
            notes: appointment.notes.clone(),
            invoice: None,
        }
    }
}

/// Delivery retries apply to rate limiting only.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    /// Wait before retry `n` is `base_delay * n`.
    pub base_delay: Duration,
    /// Pause between the customer email and the admin copy.
    pub admin_gap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(800),
            admin_gap: Duration::from_millis(600),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OutboxSettings {
    pub capacity: usize,
    pub admin_email: Option<String>,
    pub branding: Branding,
    pub retry: RetryPolicy,
}

impl Default for OutboxSettings {
    fn default() -> Self {
        Self {
            capacity: 1024,
            admin_email: None,
            branding: Branding::default(),
            retry: RetryPolicy::default(),
        }
    }
}

/// Sending half of the notification outbox.
///
/// Engine operations enqueue after their state change is durable and return
/// without waiting; one background task renders and delivers each message.
#[derive(Clone)]
pub struct Notifier {
    tx: mpsc::Sender<Notification>,
}

impl Notifier {
    /// Start the dispatcher task. Must be called inside a tokio runtime.
    pub fn spawn(mailer: Arc<dyn Mailer>, settings: OutboxSettings) -> Self {
        let (tx, rx) = mpsc::channel(settings.capacity.max(1));
        tokio::spawn(dispatch_loop(mailer, settings, rx));
        Self { tx }
    }

    /// Queue a notification. A full or closed outbox drops it with a warning.
    pub fn enqueue(&self, notification: Notification) {
        let kind = notification.kind.as_str();
        let outcome = match self.tx.try_send(notification) {
            Ok(()) => "queued",
            Err(TrySendError::Full(n)) => {
                warn!(kind, to = %n.to, code = %n.confirmation_code, "notification outbox full, dropping");
                "dropped"
            }
            Err(TrySendError::Closed(n)) => {
                warn!(kind, to = %n.to, code = %n.confirmation_code, "notification dispatcher gone, dropping");
                "dropped"
            }
        };
        metrics::counter!(NOTIFICATIONS_TOTAL, "kind" => kind, "outcome" => outcome).increment(1);
    }
}

async fn dispatch_loop(
    mailer: Arc<dyn Mailer>,
    settings: OutboxSettings,
    mut rx: mpsc::Receiver<Notification>,
) {
    while let Some(notification) = rx.recv().await {
        let kind = notification.kind.as_str();
        let email = render(&notification, &settings.branding);
        record(kind, &email, deliver(mailer.as_ref(), &email, &settings.retry).await);

        if let Some(admin) = &settings.admin_email {
            tokio::time::sleep(settings.retry.admin_gap).await;
            let copy = email.admin_copy(admin);
            record(kind, &copy, deliver(mailer.as_ref(), &copy, &settings.retry).await);
        }
    }
    debug!("notification outbox closed");
}

fn record(kind: &'static str, email: &Email, result: Result<(), MailError>) {
    let outcome = match result {
        Ok(()) => {
            debug!(kind, to = %email.to, "notification sent");
            "sent"
        }
        Err(e) => {
            warn!(kind, to = %email.to, "notification failed: {e}");
            "failed"
        }
    };
    metrics::counter!(NOTIFICATIONS_TOTAL, "kind" => kind, "outcome" => outcome).increment(1);
}

pub(crate) async fn deliver(
    mailer: &dyn Mailer,
    email: &Email,
    policy: &RetryPolicy,
) -> Result<(), MailError> {
    let mut attempt = 0;
    loop {
        match mailer.send(email).await {
            Err(MailError::RateLimited) if attempt < policy.max_retries => {
                attempt += 1;
                debug!(to = %email.to, attempt, "rate limited, retrying");
                tokio::time::sleep(policy.base_delay * attempt).await;
            }
            result => return result,
        }
    }
}
