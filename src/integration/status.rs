//! Begin/end status notifications for the host.

use crate::domain::models::{CardEvent, MessageSeverity, StatusMessage};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Sends [`CardEvent`]s to whoever renders status; a reporter without a
/// channel only logs.
#[derive(Debug, Clone, Default)]
pub struct StatusReporter {
    event_tx: Option<mpsc::UnboundedSender<CardEvent>>,
}

impl StatusReporter {
    pub fn new(event_tx: mpsc::UnboundedSender<CardEvent>) -> Self {
        Self {
            event_tx: Some(event_tx),
        }
    }

    /// Announce an operation. The returned guard announces its end when
    /// dropped, error paths included.
    #[must_use = "the operation ends when the guard is dropped"]
    pub fn begin(&self, label: impl Into<String>) -> StatusGuard {
        let label = label.into();
        info!("{}", label);
        self.send(CardEvent::OperationStarted(label.clone()));
        StatusGuard {
            reporter: self.clone(),
            label,
        }
    }

    pub fn message(&self, message: impl Into<String>, severity: MessageSeverity) {
        let message = message.into();
        match severity {
            MessageSeverity::Error => error!("{}", message),
            MessageSeverity::Warning => warn!("{}", message),
            MessageSeverity::Info | MessageSeverity::Success => info!("{}", message),
        }
        self.send(CardEvent::LogMessage(StatusMessage { message, severity }));
    }

    fn send(&self, event: CardEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event);
        }
    }
}

pub struct StatusGuard {
    reporter: StatusReporter,
    label: String,
}

impl StatusGuard {
    pub fn label(&self) -> &str {
        &self.label
    }
}

impl Drop for StatusGuard {
    fn drop(&mut self) {
        self.reporter
            .send(CardEvent::OperationEnded(std::mem::take(&mut self.label)));
    }
}
