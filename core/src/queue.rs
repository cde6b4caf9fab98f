//! Active message queue and its history collection.
//!
//! Not-found is never an error here: the send flow and the operator can both
//! finish or remove the same record, so every mutation reports `false` and
//! logs instead. Reads fall back to the last list that was read successfully;
//! writes have no fallback.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::Value;
use tracing::{info, warn};

use crate::error::CoreError;
use crate::lease::{RunLease, MIN_LEASE_TTL, SEND_RUN};
use crate::models::{Message, MessageStatus, VerificationDetails};
use crate::phone;
use crate::store::{DocumentStore, Edit, MESSAGES, SENT_MESSAGES};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoverySummary {
    pub reset_to_pending: usize,
    pub moved_to_history: usize,
}

pub struct MessageQueueStore {
    store: Arc<dyn DocumentStore>,
    queue_snapshot: Mutex<Vec<Message>>,
    history_snapshot: Mutex<Vec<Message>>,
}

fn key(record_index: i64) -> String {
    record_index.to_string()
}

fn decode_all(collection: &str, docs: Vec<Value>) -> Vec<Message> {
    docs.into_iter()
        .filter_map(|doc| match serde_json::from_value::<Message>(doc) {
            Ok(message) => Some(message),
            Err(err) => {
                warn!(collection, "skipping unreadable message document: {}", err);
                None
            }
        })
        .collect()
}

/// Processing order: snoozed messages last, then ascending record index.
pub fn processing_order(messages: &mut [Message], now: DateTime<Utc>) {
    messages.sort_by_key(|m| (m.is_snoozed_at(now), m.record_index));
}

impl MessageQueueStore {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            store,
            queue_snapshot: Mutex::new(Vec::new()),
            history_snapshot: Mutex::new(Vec::new()),
        }
    }

    fn read(&self, collection: &str, snapshot: &Mutex<Vec<Message>>) -> Vec<Message> {
        match self.store.list(collection) {
            Ok(docs) => {
                let messages = decode_all(collection, docs);
                if let Ok(mut cached) = snapshot.lock() {
                    *cached = messages.clone();
                }
                messages
            }
            Err(err) => {
                warn!(collection, "read failed, using last snapshot: {}", err);
                snapshot.lock().map(|cached| cached.clone()).unwrap_or_default()
            }
        }
    }

    /// Active queue in storage order.
    pub fn messages(&self) -> Vec<Message> {
        self.read(MESSAGES, &self.queue_snapshot)
    }

    /// Active queue in processing order.
    pub fn ordered(&self, now: DateTime<Utc>) -> Vec<Message> {
        let mut messages = self.messages();
        processing_order(&mut messages, now);
        messages
    }

    pub fn history(&self) -> Vec<Message> {
        self.read(SENT_MESSAGES, &self.history_snapshot)
    }

    pub fn get(&self, record_index: i64) -> Result<Option<Message>, CoreError> {
        match self.store.get(MESSAGES, &key(record_index))? {
            Some(doc) => Ok(Some(serde_json::from_value(doc)?)),
            None => Ok(None),
        }
    }

    /// Replaces or inserts each message by record index. An empty slice
    /// clears the queue.
    pub fn upsert_many(&self, messages: &[Message]) -> Result<(), CoreError> {
        if messages.is_empty() {
            let removed = self.store.clear(MESSAGES)?;
            info!(removed, "message queue cleared by empty upsert");
            return Ok(());
        }
        let docs = messages
            .iter()
            .map(|m| Ok((key(m.record_index), serde_json::to_value(m)?)))
            .collect::<Result<Vec<_>, CoreError>>()?;
        self.store.put_many(MESSAGES, &docs)
    }

    /// Applies `change` to the queued message. Returns `false` when absent;
    /// a message deleted or filed concurrently is never written back.
    pub fn update<F>(&self, record_index: i64, change: F) -> Result<bool, CoreError>
    where
        F: FnOnce(&mut Message),
    {
        let mut change = Some(change);
        let updated = self.store.modify(MESSAGES, &key(record_index), &mut |current| {
            let (Some(doc), Some(change)) = (current, change.take()) else {
                return Ok(Edit::Keep);
            };
            let mut message: Message = serde_json::from_value(doc.clone())?;
            change(&mut message);
            Ok(Edit::Put(serde_json::to_value(&message)?))
        })?;
        if !updated {
            warn!(record_index, "message not found in queue");
        }
        Ok(updated)
    }

    pub fn update_status(
        &self,
        record_index: i64,
        status: MessageStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        self.update(record_index, |message| {
            message.status = status;
            message.last_updated = Some(at);
        })
    }

    /// Removes the message from the queue and files it in history with
    /// `status`. A status naming a send stamps `sentTime`; anything else
    /// records an attempt. Returns `false` when the message is no longer
    /// queued, so repeated calls are harmless.
    pub fn move_to_history(
        &self,
        record_index: i64,
        status: MessageStatus,
        details: Option<VerificationDetails>,
    ) -> Result<bool, CoreError> {
        let Some(mut message) = self.get(record_index)? else {
            warn!(record_index, "move to history skipped, message not queued");
            return Ok(false);
        };
        let now = Utc::now();
        message.is_sent = status.indicates_sent();
        if message.is_sent {
            message.sent_time = Some(now);
        } else {
            message.is_attempted = true;
            message.attempt_time = Some(now);
        }
        message.status = status;
        message.last_updated = Some(now);
        message.is_snoozed = false;
        message.snoozed_until = None;
        if details.is_some() {
            message.verification_details = details;
        }
        let moved = self.store.transfer(
            MESSAGES,
            SENT_MESSAGES,
            &key(record_index),
            &serde_json::to_value(&message)?,
        )?;
        if moved {
            info!(record_index, status = %message.status, "message moved to history");
        } else {
            warn!(record_index, "message left the queue before it could be moved");
        }
        Ok(moved)
    }

    pub fn snooze(&self, record_index: i64, minutes: u32) -> Result<bool, CoreError> {
        let until = Utc::now() + ChronoDuration::minutes(i64::from(minutes));
        self.update(record_index, |message| {
            message.is_snoozed = true;
            message.snoozed_until = Some(until);
            message.status = MessageStatus::Snoozed;
            message.last_updated = Some(Utc::now());
        })
    }

    pub fn delete(&self, record_index: i64) -> Result<bool, CoreError> {
        let removed = self.store.delete(MESSAGES, &key(record_index))?;
        if !removed {
            warn!(record_index, "delete skipped, message not queued");
        }
        Ok(removed)
    }

    pub fn clear_queue(&self) -> Result<usize, CoreError> {
        self.store.clear(MESSAGES)
    }

    pub fn clear_history(&self) -> Result<usize, CoreError> {
        self.store.clear(SENT_MESSAGES)
    }

    pub fn in_history(&self, record_index: i64) -> bool {
        match self.store.get(SENT_MESSAGES, &key(record_index)) {
            Ok(doc) => doc.is_some(),
            Err(err) => {
                warn!(record_index, "history lookup failed, using last snapshot: {}", err);
                self.history_snapshot
                    .lock()
                    .map(|cached| cached.iter().any(|m| m.record_index == record_index))
                    .unwrap_or(false)
            }
        }
    }

    /// Bare forms of every phone number in the queue and in history.
    pub fn known_numbers(&self) -> HashSet<String> {
        self.messages()
            .iter()
            .chain(self.history().iter())
            .map(Message::bare_number)
            .filter(|n| !n.is_empty())
            .collect()
    }

    pub fn contains_phone(&self, raw: &str) -> bool {
        let bare = phone::normalize(raw);
        !bare.is_empty() && self.known_numbers().contains(&bare)
    }

    /// Repairs messages left mid-send by a previous process. Messages that
    /// never got past the search step go back to `Pending`; later steps may
    /// have typed and sent text, so those are filed as unverified attempts.
    /// Does nothing while a send run holds its lease.
    pub fn recover_interrupted(&self) -> Result<RecoverySummary, CoreError> {
        let Some(_lease) = RunLease::claim(self.store.clone(), SEND_RUN, MIN_LEASE_TTL)? else {
            info!("send run active, leaving in-flight messages alone");
            return Ok(RecoverySummary::default());
        };
        self.repair_interrupted()
    }

    /// `recover_interrupted` for a caller that already holds the send lease.
    pub(crate) fn repair_interrupted(&self) -> Result<RecoverySummary, CoreError> {
        let mut summary = RecoverySummary::default();
        for message in self.messages() {
            match message.status {
                MessageStatus::OpeningApp | MessageStatus::SearchingContact => {
                    if self.update_status(message.record_index, MessageStatus::Pending, Utc::now())? {
                        summary.reset_to_pending += 1;
                    }
                }
                MessageStatus::PastingText | MessageStatus::SendingMessage | MessageStatus::VerifyingDelivery => {
                    if self.move_to_history(message.record_index, MessageStatus::AttemptedUnverified, None)? {
                        summary.moved_to_history += 1;
                    }
                }
                _ => {}
            }
        }
        if summary != RecoverySummary::default() {
            info!(
                reset = summary.reset_to_pending,
                moved = summary.moved_to_history,
                "recovered interrupted messages"
            );
        }
        Ok(summary)
    }
}
