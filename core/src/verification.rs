//! Per-number presence verification.
//!
//! The store is the only copy of the registry: every read goes to it and
//! every change touches a single item atomically, so several processes can
//! share one registry. The last list read successfully is the read fallback.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde_json::{json, Value};
use tokio::time::{sleep, timeout};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::automation::NumberProbe;
use crate::error::CoreError;
use crate::lease::{lease_ttl, RunLease, MIN_LEASE_TTL, VERIFICATION_RUN};
use crate::models::{
    AddNumberResult, VerificationItem, VerificationState, VerificationStatus, VerifiedExportRow,
};
use crate::notify::{StatusEvent, StatusReporter};
use crate::phone;
use crate::settings::VerificationTimings;
use crate::store::{DocumentStore, Edit, VERIFICATION_QUEUE};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerificationSummary {
    pub run_id: String,
    pub verified: usize,
    pub not_verified: usize,
    pub errors: usize,
    pub cancelled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationRun {
    AlreadyRunning,
    Finished(VerificationSummary),
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

fn decode_items(docs: Vec<Value>) -> Vec<VerificationItem> {
    docs.into_iter()
        .filter_map(|doc| match serde_json::from_value::<VerificationItem>(doc) {
            Ok(item) => Some(item),
            Err(err) => {
                warn!("skipping unreadable verification item: {}", err);
                None
            }
        })
        .collect()
}

fn rejected(number: String, reason: &str) -> AddNumberResult {
    AddNumberResult {
        number,
        success: false,
        error: Some(reason.to_string()),
    }
}

pub struct VerificationRegistry {
    store: Arc<dyn DocumentStore>,
    snapshot: Mutex<Vec<VerificationItem>>,
    running: AtomicBool,
    cancel_requested: AtomicBool,
    timings: VerificationTimings,
    reporter: Arc<dyn StatusReporter>,
}

impl VerificationRegistry {
    pub fn load(
        store: Arc<dyn DocumentStore>,
        reporter: Arc<dyn StatusReporter>,
        timings: VerificationTimings,
    ) -> Result<Self, CoreError> {
        let registry = Self {
            store,
            snapshot: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
            cancel_requested: AtomicBool::new(false),
            timings,
            reporter,
        };
        registry.read_items()?;
        Ok(registry)
    }

    fn read_items(&self) -> Result<Vec<VerificationItem>, CoreError> {
        let items = decode_items(self.store.list(VERIFICATION_QUEUE)?);
        if let Ok(mut cached) = self.snapshot.lock() {
            *cached = items.clone();
        }
        Ok(items)
    }

    fn insert(&self, raw: &str) -> Result<AddNumberResult, CoreError> {
        let number = phone::normalize(raw);
        if !phone::is_valid_length(&number) {
            return Ok(rejected(number, "Invalid phone number length"));
        }
        let body = serde_json::to_value(VerificationItem {
            number: number.clone(),
            status: VerificationStatus::Pending,
            timestamp: Utc::now(),
            result: None,
        })?;
        let added = self.store.modify(VERIFICATION_QUEUE, &number, &mut |current| {
            Ok(match current {
                Some(_) => Edit::Keep,
                None => Edit::Put(body.clone()),
            })
        })?;
        if !added {
            return Ok(rejected(number, "Number already in queue"));
        }
        Ok(AddNumberResult {
            number,
            success: true,
            error: None,
        })
    }

    pub fn add(&self, raw: &str) -> Result<AddNumberResult, CoreError> {
        let result = self.insert(raw)?;
        if result.success {
            info!(number = %result.number, "number queued for verification");
        }
        Ok(result)
    }

    /// Adds each number in turn; a failed write stops the batch.
    pub fn add_bulk<S: AsRef<str>>(&self, numbers: &[S]) -> Result<Vec<AddNumberResult>, CoreError> {
        let results = numbers
            .iter()
            .map(|raw| self.insert(raw.as_ref()))
            .collect::<Result<Vec<_>, CoreError>>()?;
        let added = results.iter().filter(|r| r.success).count();
        info!(added, requested = numbers.len(), "bulk verification enqueue");
        Ok(results)
    }

    /// Removes the item at `index` of the current list. Returns `false` when
    /// out of range.
    pub fn remove(&self, index: usize) -> Result<bool, CoreError> {
        let items = self.read_items()?;
        let Some(item) = items.get(index) else {
            warn!(index, "verification item index out of range");
            return Ok(false);
        };
        self.store.delete(VERIFICATION_QUEUE, &item.number)
    }

    pub fn clear(&self) -> Result<usize, CoreError> {
        self.store.clear(VERIFICATION_QUEUE)
    }

    pub fn items(&self) -> Vec<VerificationItem> {
        match self.read_items() {
            Ok(items) => items,
            Err(err) => {
                warn!("verification read failed, using last snapshot: {}", err);
                self.snapshot.lock().map(|cached| cached.clone()).unwrap_or_default()
            }
        }
    }

    /// Looks the number up by its raw digits, then without a leading country
    /// code, then with one added to a bare 10-digit form.
    pub fn get_status(&self, raw: &str) -> VerificationState {
        for candidate in phone::lookup_candidates(raw) {
            match self.store.get(VERIFICATION_QUEUE, &candidate) {
                Ok(Some(doc)) => match serde_json::from_value::<VerificationItem>(doc) {
                    Ok(item) => return VerificationState::Tracked(item.status),
                    Err(err) => warn!(number = %candidate, "unreadable verification item: {}", err),
                },
                Ok(None) => {}
                Err(err) => {
                    warn!("verification lookup failed, using last snapshot: {}", err);
                    return self.cached_status(raw);
                }
            }
        }
        VerificationState::NotStarted
    }

    fn cached_status(&self, raw: &str) -> VerificationState {
        let Ok(items) = self.snapshot.lock() else {
            return VerificationState::NotStarted;
        };
        phone::lookup_candidates(raw)
            .iter()
            .find_map(|candidate| items.iter().find(|item| &item.number == candidate))
            .map(|item| VerificationState::Tracked(item.status))
            .unwrap_or(VerificationState::NotStarted)
    }

    pub fn verified_export(&self) -> Vec<VerifiedExportRow> {
        self.items()
            .into_iter()
            .filter(|item| item.status == VerificationStatus::Verified)
            .map(|item| VerifiedExportRow {
                ocr_text: item
                    .result
                    .as_ref()
                    .and_then(|r| r.get("ocr_text"))
                    .and_then(|t| t.as_str())
                    .unwrap_or_default()
                    .to_string(),
                number: item.number,
                status: item.status,
                timestamp: item.timestamp,
            })
            .collect()
    }

    /// Items a crashed run left in `verifying` go back to `pending`. Does
    /// nothing while a verification run holds its lease.
    pub fn recover_interrupted(&self) -> Result<usize, CoreError> {
        let Some(_lease) = RunLease::claim(self.store.clone(), VERIFICATION_RUN, MIN_LEASE_TTL)? else {
            info!("verification run active, leaving its items alone");
            return Ok(0);
        };
        self.repair_interrupted()
    }

    fn repair_interrupted(&self) -> Result<usize, CoreError> {
        let mut reset = 0;
        for item in self.read_items()? {
            if item.status != VerificationStatus::Verifying {
                continue;
            }
            let changed = self.edit_item(&item.number, |stored| {
                if stored.status != VerificationStatus::Verifying {
                    return false;
                }
                stored.status = VerificationStatus::Pending;
                stored.timestamp = Utc::now();
                true
            })?;
            if changed {
                reset += 1;
            }
        }
        if reset > 0 {
            info!(reset, "reset interrupted verification items");
        }
        Ok(reset)
    }

    /// Applies `change` to the stored item for `number` when it still
    /// exists and `change` returns true.
    fn edit_item<F>(&self, number: &str, change: F) -> Result<bool, CoreError>
    where
        F: FnOnce(&mut VerificationItem) -> bool,
    {
        let mut change = Some(change);
        self.store.modify(VERIFICATION_QUEUE, number, &mut |current| {
            let (Some(doc), Some(change)) = (current, change.take()) else {
                return Ok(Edit::Keep);
            };
            let mut item: VerificationItem = serde_json::from_value(doc.clone())?;
            if !change(&mut item) {
                return Ok(Edit::Keep);
            }
            Ok(Edit::Put(serde_json::to_value(&item)?))
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stops the current run before its next probe call. A probe already in
    /// flight finishes.
    pub fn cancel(&self) {
        if self.is_running() {
            self.cancel_requested.store(true, Ordering::SeqCst);
            info!("verification cancel requested");
        }
    }

    fn set_status(
        &self,
        number: &str,
        status: VerificationStatus,
        result: Option<Value>,
    ) -> Result<bool, CoreError> {
        let updated = self.edit_item(number, |item| {
            item.status = status;
            item.timestamp = Utc::now();
            if result.is_some() {
                item.result = result;
            }
            true
        })?;
        if updated {
            self.reporter.report(StatusEvent::VerificationUpdated {
                number: number.to_string(),
                status,
            });
        } else {
            warn!(number, "verification item removed during run");
        }
        Ok(updated)
    }

    fn next_pending(&self) -> Result<Option<String>, CoreError> {
        Ok(self
            .read_items()?
            .into_iter()
            .find(|item| item.status == VerificationStatus::Pending)
            .map(|item| item.number))
    }

    fn cancelled(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
    }

    /// Probes every `pending` item in order. Only one run can be active; a
    /// second call returns `AlreadyRunning` without touching anything.
    /// Probe failures mark the item `error` and the run moves on. A failed
    /// write ends the run with that error.
    pub async fn process_queue(&self, probe: &dyn NumberProbe) -> Result<VerificationRun, CoreError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            info!("verification already in progress");
            return Ok(VerificationRun::AlreadyRunning);
        }
        let _guard = RunningGuard(&self.running);
        let ttl = lease_ttl(self.timings.probe_timeout() + self.timings.settle() + self.timings.inter_item());
        let Some(lease) = RunLease::claim(self.store.clone(), VERIFICATION_RUN, ttl)? else {
            info!("verification already in progress in another process");
            return Ok(VerificationRun::AlreadyRunning);
        };
        self.cancel_requested.store(false, Ordering::SeqCst);
        self.repair_interrupted()?;

        let mut summary = VerificationSummary {
            run_id: Uuid::new_v4().to_string(),
            ..VerificationSummary::default()
        };
        info!(run_id = %summary.run_id, "verification run started");

        while let Some(number) = self.next_pending()? {
            if self.cancelled() {
                summary.cancelled = true;
                break;
            }
            if !lease.renew()? {
                warn!(run_id = %summary.run_id, "verification lease lost, stopping");
                summary.cancelled = true;
                break;
            }
            if !self.set_status(&number, VerificationStatus::Verifying, None)? {
                continue;
            }
            sleep(self.timings.settle()).await;
            if self.cancelled() {
                self.set_status(&number, VerificationStatus::Pending, None)?;
                summary.cancelled = true;
                break;
            }

            match timeout(self.timings.probe_timeout(), probe.verify_number_presence(&number)).await {
                Ok(Ok(result)) => {
                    let status = if result.is_verified() {
                        summary.verified += 1;
                        VerificationStatus::Verified
                    } else {
                        summary.not_verified += 1;
                        VerificationStatus::NotVerified
                    };
                    let payload = serde_json::to_value(&result)?;
                    self.set_status(&number, status, Some(payload))?;
                    sleep(self.timings.inter_item()).await;
                }
                Ok(Err(err)) => {
                    summary.errors += 1;
                    self.fail(&number, err.to_string())?;
                }
                Err(_) => {
                    summary.errors += 1;
                    let err = CoreError::Timeout(format!(
                        "number probe exceeded {} ms",
                        self.timings.probe_timeout_ms
                    ));
                    self.fail(&number, err.to_string())?;
                }
            }
        }

        info!(
            run_id = %summary.run_id,
            verified = summary.verified,
            not_verified = summary.not_verified,
            errors = summary.errors,
            cancelled = summary.cancelled,
            "verification run finished"
        );
        self.reporter.report(StatusEvent::VerificationQueueCompleted {
            verified: summary.verified,
            not_verified: summary.not_verified,
            errors: summary.errors,
        });
        Ok(VerificationRun::Finished(summary))
    }

    fn fail(&self, number: &str, message: String) -> Result<(), CoreError> {
        error!(number, "verification probe failed: {}", message);
        self.set_status(number, VerificationStatus::Error, Some(json!({ "error": message })))?;
        self.reporter.report(StatusEvent::VerificationFailed {
            number: number.to_string(),
            error: message,
        });
        Ok(())
    }
}
