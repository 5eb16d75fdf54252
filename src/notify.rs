use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::model::{Appointment, ReminderLead};

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Recipient {
    Customer,
    Author,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NoticeKind {
    Confirmed,
    Rescheduled { previous: Appointment },
    Cancelled { reason: Option<String> },
    Reminder { lead: ReminderLead },
}

impl NoticeKind {
    pub fn label(&self) -> &'static str {
        match self {
            NoticeKind::Confirmed => "confirmed",
            NoticeKind::Rescheduled { .. } => "rescheduled",
            NoticeKind::Cancelled { .. } => "cancelled",
            NoticeKind::Reminder { .. } => "reminder",
        }
    }
}

/// A message for one party about one appointment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notice {
    pub recipient: Recipient,
    pub address: String,
    #[serde(flatten)]
    pub kind: NoticeKind,
    pub appointment: Appointment,
}

impl Notice {
    /// One notice for the customer, plus one for the author if they have an
    /// email on file.
    pub fn for_parties(kind: NoticeKind, appointment: &Appointment, author_email: Option<&str>) -> Vec<Notice> {
        let mut out = vec![Notice {
            recipient: Recipient::Customer,
            address: appointment.customer_email.clone(),
            kind: kind.clone(),
            appointment: appointment.clone(),
        }];
        if let Some(email) = author_email {
            out.push(Notice {
                recipient: Recipient::Author,
                address: email.to_string(),
                kind,
                appointment: appointment.clone(),
            });
        }
        out
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("failed to encode notice: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("delivery to {address} failed: {reason}")]
    Delivery { address: String, reason: String },
}

/// Outbound delivery collaborator. Called only after a commit.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn deliver(&self, notice: Notice) -> Result<(), NotifyError>;
}

/// Fan out notices on independent tasks. Failures are logged and counted,
/// never returned.
pub fn dispatch(notifier: Arc<dyn Notifier>, notices: Vec<Notice>) {
    for notice in notices {
        let notifier = notifier.clone();
        tokio::spawn(async move {
            let kind = notice.kind.label();
            let address = notice.address.clone();
            match notifier.deliver(notice).await {
                Ok(()) => metrics::counter!(crate::observability::NOTIFICATIONS_SENT_TOTAL, "kind" => kind).increment(1),
                Err(e) => {
                    tracing::warn!(%address, kind, "notification failed: {e}");
                    metrics::counter!(crate::observability::NOTIFICATIONS_FAILED_TOTAL, "kind" => kind).increment(1);
                }
            }
        });
    }
}

/// In-process broadcast hub keyed by recipient address.
///
/// Stands in for mail delivery: every notice is logged as JSON and handed to
/// whoever subscribed to that address.
pub struct NotifyHub {
    channels: DashMap<String, broadcast::Sender<Notice>>,
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to notices for an address. Creates the channel if needed.
    pub fn subscribe(&self, address: &str) -> broadcast::Receiver<Notice> {
        let sender = self
            .channels
            .entry(address.to_ascii_lowercase())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Notifier for NotifyHub {
    async fn deliver(&self, notice: Notice) -> Result<(), NotifyError> {
        let payload = serde_json::to_string(&notice)?;
        tracing::debug!(address = %notice.address, "notice: {payload}");
        if let Some(sender) = self.channels.get(&notice.address.to_ascii_lowercase()) {
            // No receivers left is not a delivery failure.
            let _ = sender.send(notice);
        }
        Ok(())
    }
}
