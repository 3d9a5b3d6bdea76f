//! Email rendering and delivery backends for appointment notifications.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::notify::{Invoice, Notification, NotificationKind};

const RESEND_ENDPOINT: &str = "https://api.resend.com/emails";
const RESEND_TIMEOUT_SECS: u64 = 15;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Email {
    pub to: String,
    pub subject: String,
    pub html: String,
}

impl Email {
    /// Same message wrapped for the shop's own inbox.
    pub fn admin_copy(&self, admin: &str) -> Email {
        Email {
            to: admin.to_string(),
            subject: format!("[Admin] {}", self.subject),
            html: format!(
                "<div style=\"font-family: system-ui; padding: 20px; background: #f3f4f6;\">\
                 <p style=\"color:#6b7280; font-size:14px;\">Admin notification copy</p>\
                 <div style=\"background: white; padding: 20px; border-radius: 8px;\">{}</div></div>",
                self.html
            ),
        }
    }
}

#[derive(Debug)]
pub enum MailError {
    /// The provider asked us to slow down. The only retryable failure.
    RateLimited,
    Rejected(String),
    Transport(String),
}

impl std::fmt::Display for MailError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MailError::RateLimited => write!(f, "rate limited by mail provider"),
            MailError::Rejected(msg) => write!(f, "mail provider rejected message: {msg}"),
            MailError::Transport(msg) => write!(f, "mail transport error: {msg}"),
        }
    }
}

impl std::error::Error for MailError {}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, email: &Email) -> Result<(), MailError>;
}

/// Writes emails to the log instead of sending them. Used when no API key is configured.
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, email: &Email) -> Result<(), MailError> {
        info!(to = %email.to, subject = %email.subject, "email not sent (log-only mailer)");
        Ok(())
    }
}

/// Resend HTTP API.
pub struct ResendMailer {
    client: reqwest::Client,
    api_key: String,
    from: String,
}

impl ResendMailer {
    pub fn new(api_key: String, from: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(RESEND_TIMEOUT_SECS))
            .build()
            .unwrap_or_else(|e| {
                warn!("falling back to default HTTP client: {e}");
                reqwest::Client::new()
            });
        Self {
            client,
            api_key,
            from,
        }
    }
}

#[async_trait]
impl Mailer for ResendMailer {
    async fn send(&self, email: &Email) -> Result<(), MailError> {
        let body = serde_json::json!({
            "from": self.from,
            "to": [email.to],
            "subject": email.subject,
            "html": email.html,
        });
        let response = self
            .client
            .post(RESEND_ENDPOINT)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| MailError::Transport(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(MailError::RateLimited);
        }
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(MailError::Rejected(format!("{status}: {detail}")));
        }
        Ok(())
    }
}

// ── Templates ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Branding {
    pub shop_name: String,
    pub address: Option<String>,
}

impl Default for Branding {
    fn default() -> Self {
        Self {
            shop_name: "Auto Repair Shop".into(),
            address: None,
        }
    }
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

fn dollars(cents: i64) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let cents = cents.unsigned_abs();
    format!("{sign}${}.{:02}", cents / 100, cents % 100)
}

fn invoice_html(invoice: &Invoice) -> String {
    let rows: String = invoice
        .lines
        .iter()
        .map(|line| {
            format!(
                "<tr><td>{}</td><td style=\"text-align: right;\">{}</td></tr>",
                escape(&line.service),
                dollars(line.cost_cents)
            )
        })
        .collect();
    let items = invoice
        .items_purchased
        .as_deref()
        .map(|items| format!("<p><strong>Items/Parts Purchased:</strong><br>{}</p>", escape(items)))
        .unwrap_or_default();
    format!(
        "<h2>Invoice Details</h2><table style=\"width: 100%;\">\
         <thead><tr><th style=\"text-align: left;\">Service</th><th style=\"text-align: right;\">Cost</th></tr></thead>\
         <tbody>{rows}</tbody></table>{items}\
         <p><strong>Subtotal:</strong> {}</p><p><strong>Taxes:</strong> {}</p><p><strong>Total:</strong> {}</p>",
        dollars(invoice.subtotal_cents),
        dollars(invoice.taxes_cents),
        dollars(invoice.total_cents),
    )
}

/// Subject and HTML body for one notification.
pub fn render(n: &Notification, brand: &Branding) -> Email {
    let shop = escape(&brand.shop_name);
    let name = escape(&n.customer_name);
    let code = escape(&n.confirmation_code);
    let date = n.date.format("%A, %B %-d, %Y").to_string();
    let time = n.time.to_string();
    let services = escape(&n.services.join(", "));
    let notes = n
        .notes
        .as_deref()
        .map(|notes| format!("<li><strong>Notes:</strong> {}</li>", escape(notes)))
        .unwrap_or_default();
    let location = brand
        .address
        .as_deref()
        .map(|a| format!("<p><strong>Location:</strong> {}</p>", escape(a)))
        .unwrap_or_default();
    let vehicle = escape(&n.vehicle.to_string());

    let (subject, body) = match n.kind {
        NotificationKind::Booking => (
            "Appointment Confirmation",
            format!(
                "<h1>Thank you for your booking, {name}!</h1>\
                 <p>Your appointment has been confirmed with the following details:</p>\
                 <ul><li><strong>Confirmation Number:</strong> {code}</li>\
                 <li><strong>Date:</strong> {date}</li><li><strong>Time:</strong> {time}</li>\
                 <li><strong>Services:</strong> {services}</li><li><strong>Vehicle:</strong> {vehicle}</li>{notes}</ul>\
                 <p>Please keep your confirmation number. You can use it to look up or cancel your appointment.</p>{location}"
            ),
        ),
        NotificationKind::Update => (
            "Appointment Updated",
            format!(
                "<h1>Your appointment has been updated, {name}</h1>\
                 <ul><li><strong>Confirmation Number:</strong> {code}</li>\
                 <li><strong>New Date:</strong> {date}</li><li><strong>New Time:</strong> {time}</li>\
                 <li><strong>Services:</strong> {services}</li>{notes}</ul>{location}"
            ),
        ),
        NotificationKind::Cancel => (
            "Appointment Cancelled",
            format!(
                "<h1>Appointment Cancelled</h1><p>Dear {name},</p>\
                 <p>Your appointment ({code}) scheduled for {date} at {time} has been cancelled.</p>\
                 <p>You are welcome to book a new appointment at any time.</p>"
            ),
        ),
        NotificationKind::InProgress => (
            "Service In Progress",
            format!(
                "<h1>Your service has started!</h1><p>Dear {name},</p>\
                 <p>We've started working on your {vehicle}.</p>\
                 <ul><li><strong>Confirmation Number:</strong> {code}</li>\
                 <li><strong>Services:</strong> {services}</li></ul>\
                 <p>We'll let you know when the work is complete.</p>"
            ),
        ),
        NotificationKind::Complete => (
            "Service Complete",
            format!(
                "<h1>Your vehicle is ready!</h1><p>Dear {name},</p>\
                 <p>We've completed the service on your {vehicle}.</p>\
                 <ul><li><strong>Confirmation Number:</strong> {code}</li>\
                 <li><strong>Services:</strong> {services}</li>{notes}</ul>{}{location}",
                n.invoice.as_ref().map(invoice_html).unwrap_or_default()
            ),
        ),
    };

    Email {
        to: n.to.clone(),
        subject: format!("{subject} - {}", brand.shop_name),
        html: format!("{body}<p>Best regards,<br>{shop} Team</p>"),
    }
}
