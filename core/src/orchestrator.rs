//! Sequential send flow.
//!
//! One message at a time goes through open, search, paste, send and a
//! delivery check. Every step persists its status before the hold so a
//! viewer sees live progress. Only messages whose number is verified are
//! sent; the queue is re-read after each pass until nothing is left.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::time::{sleep, timeout};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::automation::MessagingAutomation;
use crate::error::CoreError;
use crate::lease::{lease_ttl, RunLease, SEND_RUN};
use crate::models::{Message, MessageStatus, OpenRequest, VerificationState};
use crate::notify::{StatusEvent, StatusReporter, ToastLevel};
use crate::phone;
use crate::queue::MessageQueueStore;
use crate::settings::{load_settings, SendTimings};
use crate::store::DocumentStore;
use crate::template;
use crate::verification::VerificationRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStep {
    OpeningApp,
    SearchingContact,
    PastingText,
    SendingMessage,
    VerifyingDelivery,
}

impl SendStep {
    /// Steps with nothing to do but hold while the automation types.
    pub const HELD: [SendStep; 3] = [SendStep::SearchingContact, SendStep::PastingText, SendStep::SendingMessage];

    pub fn status(self) -> MessageStatus {
        match self {
            SendStep::OpeningApp => MessageStatus::OpeningApp,
            SendStep::SearchingContact => MessageStatus::SearchingContact,
            SendStep::PastingText => MessageStatus::PastingText,
            SendStep::SendingMessage => MessageStatus::SendingMessage,
            SendStep::VerifyingDelivery => MessageStatus::VerifyingDelivery,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageOutcome {
    /// Delivery confirmed; filed in history as sent.
    Committed,
    /// Delivery check ran but the timestamps disagreed.
    Unverified,
    /// Delivery check failed or timed out.
    Failed,
    /// The client could not be opened.
    Attempted,
    /// Cancelled. `opened` says whether the client had been opened.
    Cancelled { opened: bool },
    /// The message left the queue while it was being sent.
    Vanished,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendSummary {
    pub run_id: String,
    pub committed: usize,
    pub unverified: usize,
    pub failed: usize,
    pub attempted: usize,
    pub skipped: usize,
    pub cancelled: bool,
}

impl SendSummary {
    fn record(&mut self, outcome: &MessageOutcome) {
        match outcome {
            MessageOutcome::Committed => self.committed += 1,
            MessageOutcome::Unverified => self.unverified += 1,
            MessageOutcome::Failed => self.failed += 1,
            MessageOutcome::Attempted => self.attempted += 1,
            MessageOutcome::Cancelled { opened } => {
                self.cancelled = true;
                if *opened {
                    self.attempted += 1;
                }
            }
            MessageOutcome::Vanished => {}
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendRun {
    AlreadyRunning,
    NoTemplate,
    Finished(SendSummary),
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct SendOrchestrator {
    store: Arc<dyn DocumentStore>,
    queue: Arc<MessageQueueStore>,
    registry: Arc<VerificationRegistry>,
    automation: Arc<dyn MessagingAutomation>,
    reporter: Arc<dyn StatusReporter>,
    timings: SendTimings,
    running: AtomicBool,
    cancel_requested: AtomicBool,
}

impl SendOrchestrator {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        queue: Arc<MessageQueueStore>,
        registry: Arc<VerificationRegistry>,
        automation: Arc<dyn MessagingAutomation>,
        reporter: Arc<dyn StatusReporter>,
        timings: SendTimings,
    ) -> Self {
        Self {
            store,
            queue,
            registry,
            automation,
            reporter,
            timings,
            running: AtomicBool::new(false),
            cancel_requested: AtomicBool::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Checked between steps; a call in flight is not interrupted.
    pub fn cancel(&self) {
        if self.is_running() {
            self.cancel_requested.store(true, Ordering::SeqCst);
            info!("send cancel requested");
        }
    }

    fn cancelled(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
    }

    /// Whether the message would be picked up by the next pass.
    pub fn is_eligible(&self, message: &Message) -> bool {
        !message.status.indicates_sent()
            && !message.is_snoozed_at(Utc::now())
            && !self.queue.in_history(message.record_index)
            && self.registry.get_status(&message.bare_number()).is_verified()
    }

    /// Queued messages that would be sent now, in processing order.
    pub fn eligible_messages(&self) -> Vec<Message> {
        self.queue
            .ordered(Utc::now())
            .into_iter()
            .filter(|m| self.is_eligible(m))
            .collect()
    }

    /// Eligible messages not yet handled in this run. Unverified numbers
    /// get a `Skipped - <state>` status once per run.
    fn next_pass(
        &self,
        handled: &HashSet<i64>,
        skipped: &mut HashSet<i64>,
    ) -> Result<Vec<Message>, CoreError> {
        let now = Utc::now();
        let mut pass = Vec::new();
        for message in self.queue.ordered(now) {
            if handled.contains(&message.record_index)
                || message.status.indicates_sent()
                || message.is_snoozed_at(now)
                || self.queue.in_history(message.record_index)
            {
                continue;
            }
            let state = self.registry.get_status(&message.bare_number());
            if state.is_verified() {
                pass.push(message);
                continue;
            }
            if skipped.insert(message.record_index) {
                self.skip(&message, state)?;
            }
        }
        Ok(pass)
    }

    fn skip(&self, message: &Message, state: VerificationState) -> Result<(), CoreError> {
        let status = MessageStatus::skipped(state);
        if message.status != status {
            self.set_status(message.record_index, status)?;
        }
        info!(record_index = message.record_index, state = %state, "message skipped");
        Ok(())
    }

    fn set_status(&self, record_index: i64, status: MessageStatus) -> Result<bool, CoreError> {
        let updated = self.queue.update_status(record_index, status.clone(), Utc::now())?;
        if updated {
            self.reporter
                .report(StatusEvent::MessageStatusChanged { record_index, status });
        }
        Ok(updated)
    }

    fn finish(&self, message: &Message, status: MessageStatus, moved: bool) {
        if !moved {
            warn!(record_index = message.record_index, "message was not in the queue when finishing");
        }
        self.reporter.report(StatusEvent::MessageFinished {
            record_index: message.record_index,
            name: message.display_name(),
            status,
        });
    }

    fn abandon_after_open(&self, message: &Message) -> Result<MessageOutcome, CoreError> {
        let moved = self
            .queue
            .move_to_history(message.record_index, MessageStatus::Attempted, None)?;
        self.finish(message, MessageStatus::Attempted, moved);
        Ok(MessageOutcome::Cancelled { opened: true })
    }

    /// Drives one message to a terminal state.
    pub async fn send_message(&self, message: &Message, template_text: &str) -> Result<MessageOutcome, CoreError> {
        let record_index = message.record_index;
        sleep(self.timings.initial_delay()).await;
        if self.cancelled() {
            self.set_status(record_index, MessageStatus::Pending)?;
            return Ok(MessageOutcome::Cancelled { opened: false });
        }
        if !self.set_status(record_index, SendStep::OpeningApp.status())? {
            return Ok(MessageOutcome::Vanished);
        }

        let request = OpenRequest {
            url: phone::protocol_url(&phone::with_country_code(&message.phone_number)),
            text: template::format(template_text, message),
            simulate_paste: true,
        };
        let open_error = match timeout(
            self.timings.probe_timeout(),
            self.automation.open_messaging_app(&request),
        )
        .await
        {
            Ok(Ok(result)) if result.success => None,
            Ok(Ok(result)) => Some(result.error.unwrap_or_else(|| "open failed".to_string())),
            Ok(Err(err)) => Some(err.to_string()),
            Err(_) => Some(format!("open exceeded {} ms", self.timings.probe_timeout_ms)),
        };
        if let Some(reason) = open_error {
            error!(record_index, "could not open messaging app: {}", reason);
            let moved = self
                .queue
                .move_to_history(record_index, MessageStatus::Attempted, None)?;
            self.finish(message, MessageStatus::Attempted, moved);
            return Ok(MessageOutcome::Attempted);
        }

        for step in SendStep::HELD {
            if self.cancelled() {
                return self.abandon_after_open(message);
            }
            if !self.set_status(record_index, step.status())? {
                return Ok(MessageOutcome::Vanished);
            }
            sleep(self.timings.step_hold()).await;
        }

        sleep(self.timings.settle()).await;
        if self.cancelled() {
            return self.abandon_after_open(message);
        }
        if !self.set_status(record_index, SendStep::VerifyingDelivery.status())? {
            return Ok(MessageOutcome::Vanished);
        }

        let probe = timeout(
            self.timings.probe_timeout(),
            self.automation.verify_screenshot_timestamp(),
        )
        .await;
        match probe {
            Ok(Ok(check)) if check.confirms_delivery() => {
                let status = MessageStatus::SentVerified;
                let moved = self
                    .queue
                    .move_to_history(record_index, status.clone(), Some(check.details()))?;
                self.finish(message, status, moved);
                Ok(MessageOutcome::Committed)
            }
            Ok(Ok(check)) => {
                warn!(
                    record_index,
                    difference = ?check.time_difference_minutes,
                    error = ?check.error,
                    "delivery timestamp did not match"
                );
                self.set_status(record_index, MessageStatus::SentUnverified)?;
                let status = MessageStatus::AttemptedUnverified;
                let moved = self
                    .queue
                    .move_to_history(record_index, status.clone(), Some(check.details()))?;
                self.finish(message, status, moved);
                Ok(MessageOutcome::Unverified)
            }
            Ok(Err(err)) => self.fail_delivery_check(message, err),
            Err(_) => self.fail_delivery_check(
                message,
                CoreError::Timeout(format!("delivery check exceeded {} ms", self.timings.probe_timeout_ms)),
            ),
        }
    }

    fn fail_delivery_check(&self, message: &Message, err: CoreError) -> Result<MessageOutcome, CoreError> {
        error!(record_index = message.record_index, "delivery check failed: {}", err);
        let status = MessageStatus::AttemptedFailed;
        let moved = self
            .queue
            .move_to_history(message.record_index, status.clone(), None)?;
        self.finish(message, status, moved);
        Ok(MessageOutcome::Failed)
    }

    async fn close_app(&self) {
        match timeout(self.timings.probe_timeout(), self.automation.kill_messaging_app()).await {
            Ok(Ok(result)) if result.success => info!("messaging app closed"),
            Ok(Ok(result)) => warn!("messaging app not closed: {}", result.message.unwrap_or_default()),
            Ok(Err(err)) => warn!("closing messaging app failed: {}", err),
            Err(_) => warn!("closing messaging app timed out"),
        }
    }

    /// Sends every eligible message, re-reading the queue after each pass
    /// until a pass comes back empty. Only one run can be active.
    pub async fn process_queue_messages(&self) -> Result<SendRun, CoreError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            info!("queue processing already running");
            return Ok(SendRun::AlreadyRunning);
        }
        let _guard = RunningGuard(&self.running);
        let ttl = lease_ttl(self.timings.probe_timeout() + self.timings.settle());
        let Some(lease) = RunLease::claim(self.store.clone(), SEND_RUN, ttl)? else {
            info!("queue processing already running in another process");
            return Ok(SendRun::AlreadyRunning);
        };
        self.cancel_requested.store(false, Ordering::SeqCst);
        self.queue.repair_interrupted()?;

        let mut summary = SendSummary {
            run_id: Uuid::new_v4().to_string(),
            ..SendSummary::default()
        };
        info!(run_id = %summary.run_id, "queue processing started");
        let mut handled = HashSet::new();
        let mut skipped = HashSet::new();

        'passes: loop {
            let settings = load_settings(self.store.as_ref())?;
            if settings.message_template.trim().is_empty() {
                warn!("no message template configured");
                self.reporter.report(StatusEvent::toast(
                    ToastLevel::Error,
                    "No template",
                    "Set a message template before sending",
                ));
                return Ok(SendRun::NoTemplate);
            }
            let pass = self.next_pass(&handled, &mut skipped)?;
            if pass.is_empty() {
                break;
            }
            for candidate in pass {
                if self.cancelled() {
                    summary.cancelled = true;
                    break 'passes;
                }
                let Some(message) = self.queue.get(candidate.record_index)? else {
                    continue;
                };
                if !self.is_eligible(&message) {
                    continue;
                }
                if !lease.renew()? {
                    warn!(run_id = %summary.run_id, "send lease lost, stopping");
                    summary.cancelled = true;
                    break 'passes;
                }
                handled.insert(message.record_index);
                let outcome = self.send_message(&message, &settings.message_template).await?;
                summary.record(&outcome);
                if summary.cancelled {
                    break 'passes;
                }
            }
            sleep(self.timings.repoll()).await;
        }
        summary.skipped = skipped.len();

        info!(
            run_id = %summary.run_id,
            committed = summary.committed,
            unverified = summary.unverified,
            failed = summary.failed,
            attempted = summary.attempted,
            skipped = summary.skipped,
            cancelled = summary.cancelled,
            "queue processing finished"
        );
        if !summary.cancelled {
            self.close_app().await;
        }
        self.reporter.report(StatusEvent::SendQueueCompleted {
            committed: summary.committed,
            unverified: summary.unverified,
            failed: summary.failed,
            attempted: summary.attempted,
            skipped: summary.skipped,
        });
        Ok(SendRun::Finished(summary))
    }
}
