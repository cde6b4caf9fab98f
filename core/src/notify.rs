use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::diagnostics;
use crate::models::{ImportSummary, MessageStatus, VerificationStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ToastLevel {
    Info,
    Success,
    Warning,
    Error,
}

/// Operator-visible state transitions.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StatusEvent {
    VerificationUpdated {
        number: String,
        status: VerificationStatus,
    },
    VerificationFailed {
        number: String,
        error: String,
    },
    VerificationQueueCompleted {
        verified: usize,
        not_verified: usize,
        errors: usize,
    },
    MessageStatusChanged {
        record_index: i64,
        status: MessageStatus,
    },
    MessageFinished {
        record_index: i64,
        name: String,
        status: MessageStatus,
    },
    SendQueueCompleted {
        committed: usize,
        unverified: usize,
        failed: usize,
        attempted: usize,
        skipped: usize,
    },
    ImportCompleted(ImportSummary),
    Toast {
        level: ToastLevel,
        title: String,
        body: String,
    },
}

impl StatusEvent {
    pub fn toast(level: ToastLevel, title: impl Into<String>, body: impl Into<String>) -> Self {
        StatusEvent::Toast {
            level,
            title: title.into(),
            body: body.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            StatusEvent::VerificationUpdated { .. } => "verification_updated",
            StatusEvent::VerificationFailed { .. } => "verification_failed",
            StatusEvent::VerificationQueueCompleted { .. } => "verification_completed",
            StatusEvent::MessageStatusChanged { .. } => "message_status",
            StatusEvent::MessageFinished { .. } => "message_finished",
            StatusEvent::SendQueueCompleted { .. } => "send_completed",
            StatusEvent::ImportCompleted(_) => "import_completed",
            StatusEvent::Toast { .. } => "toast",
        }
    }

    pub fn is_failure(&self) -> bool {
        match self {
            StatusEvent::VerificationFailed { .. } => true,
            StatusEvent::Toast { level, .. } => *level == ToastLevel::Error,
            _ => false,
        }
    }
}

impl fmt::Display for StatusEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusEvent::VerificationUpdated { number, status } => write!(f, "{} is {}", number, status),
            StatusEvent::VerificationFailed { number, error } => {
                write!(f, "verification of {} failed: {}", number, error)
            }
            StatusEvent::VerificationQueueCompleted {
                verified,
                not_verified,
                errors,
            } => write!(
                f,
                "Verification queue completed: {} verified, {} not verified, {} errors",
                verified, not_verified, errors
            ),
            StatusEvent::MessageStatusChanged { record_index, status } => {
                write!(f, "message {}: {}", record_index, status)
            }
            StatusEvent::MessageFinished {
                record_index,
                name,
                status,
            } => write!(f, "message {} to {}: {}", record_index, name, status),
            StatusEvent::SendQueueCompleted {
                committed,
                unverified,
                failed,
                attempted,
                skipped,
            } => write!(
                f,
                "Queue completed: {} sent, {} unverified, {} failed, {} attempted, {} skipped",
                committed, unverified, failed, attempted, skipped
            ),
            StatusEvent::ImportCompleted(summary) => write!(
                f,
                "Imported {} messages ({} duplicates, {} rows without phone number)",
                summary.created.len(),
                summary.duplicates.len(),
                summary.missing_phone_rows.len()
            ),
            StatusEvent::Toast { title, body, .. } => write!(f, "{}: {}", title, body),
        }
    }
}

pub trait StatusReporter: Send + Sync {
    fn report(&self, event: StatusEvent);
}

/// Writes every event to the `tracing` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReporter;

impl StatusReporter for LogReporter {
    fn report(&self, event: StatusEvent) {
        if event.is_failure() {
            warn!(kind = event.kind(), "{}", event);
        } else {
            info!(kind = event.kind(), "{}", event);
        }
    }
}

/// Appends events to the operator diagnostics log.
#[derive(Debug, Clone)]
pub struct DiagnosticsReporter {
    log_dir: PathBuf,
}

impl DiagnosticsReporter {
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        Self { log_dir: log_dir.into() }
    }
}

impl StatusReporter for DiagnosticsReporter {
    fn report(&self, event: StatusEvent) {
        if let Err(err) = diagnostics::log_event(&self.log_dir, event.kind(), &event.to_string()) {
            warn!("diagnostics log write failed: {}", err);
        }
    }
}

/// Fans events out to live subscribers. Events sent with no subscriber are
/// dropped.
#[derive(Debug, Clone)]
pub struct BroadcastReporter {
    tx: broadcast::Sender<StatusEvent>,
}

impl BroadcastReporter {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.tx.subscribe()
    }
}

impl StatusReporter for BroadcastReporter {
    fn report(&self, event: StatusEvent) {
        let _ = self.tx.send(event);
    }
}

#[derive(Clone, Default)]
pub struct FanoutReporter {
    targets: Vec<Arc<dyn StatusReporter>>,
}

impl FanoutReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, target: Arc<dyn StatusReporter>) -> Self {
        self.targets.push(target);
        self
    }
}

impl StatusReporter for FanoutReporter {
    fn report(&self, event: StatusEvent) {
        for target in &self.targets {
            target.report(event.clone());
        }
    }
}
