use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::CoreError;
use crate::models::{Message, Settings};
use crate::notify::{StatusEvent, StatusReporter, ToastLevel};
use crate::queue::MessageQueueStore;
use crate::settings::load_settings;
use crate::store::DocumentStore;

/// Periodic "a message is waiting" prompt for the operator.
pub struct ReminderService {
    store: Arc<dyn DocumentStore>,
    queue: Arc<MessageQueueStore>,
    reporter: Arc<dyn StatusReporter>,
}

impl ReminderService {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        queue: Arc<MessageQueueStore>,
        reporter: Arc<dyn StatusReporter>,
    ) -> Self {
        Self { store, queue, reporter }
    }

    /// First queued message that is neither snoozed, sent nor filed.
    pub fn next_ready(&self) -> Option<Message> {
        let now = Utc::now();
        self.queue.ordered(now).into_iter().find(|m| {
            !m.is_snoozed_at(now) && !m.status.indicates_sent() && !self.queue.in_history(m.record_index)
        })
    }

    /// Reports the next ready message when notifications are on.
    pub fn check_once(&self) -> Result<Option<Message>, CoreError> {
        let settings = load_settings(self.store.as_ref())?;
        if !settings.notifications_enabled {
            debug!("reminders disabled");
            return Ok(None);
        }
        let next = self.next_ready();
        if let Some(message) = &next {
            self.reporter.report(StatusEvent::toast(
                ToastLevel::Info,
                "Message Ready to Send",
                format!("Ready to send message to {}", message.display_name()),
            ));
        }
        Ok(next)
    }

    /// Checks on every poll interval until `shutdown` flips or its sender
    /// goes away. The interval is re-read each round.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if let Err(err) = self.check_once() {
                warn!("reminder check failed: {}", err);
            }
            let interval = load_settings(self.store.as_ref())
                .unwrap_or_else(|_| Settings::default())
                .poll_interval();
            tokio::select! {
                _ = sleep(interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}
