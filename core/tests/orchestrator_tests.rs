use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use wa_sender_core::automation::MessagingAutomation;
use wa_sender_core::models::{
    KillResult, Message, MessageStatus, OpenRequest, OpenResult, ScreenshotVerification, Settings, VerificationItem,
    VerificationStatus,
};
use wa_sender_core::notify::{StatusEvent, StatusReporter};
use wa_sender_core::settings::{save_settings, SendTimings, VerificationTimings};
use wa_sender_core::store::VERIFICATION_QUEUE;
use wa_sender_core::{
    open_in_memory, CoreError, DocumentStore, MessageQueueStore, SendOrchestrator, SendRun, SendSummary,
    VerificationRegistry,
};

#[derive(Clone, Copy)]
enum Check {
    Match,
    Mismatch,
    Fail,
    Hang,
}

#[derive(Default)]
struct FakeAutomation {
    refuse_open: HashSet<String>,
    checks: Mutex<VecDeque<Check>>,
    opened: Mutex<Vec<OpenRequest>>,
    check_calls: Mutex<usize>,
    kills: Mutex<usize>,
}

impl FakeAutomation {
    fn with_checks(checks: &[Check]) -> Self {
        Self {
            checks: Mutex::new(checks.iter().copied().collect()),
            ..Self::default()
        }
    }

    fn opened_urls(&self) -> Vec<String> {
        self.opened.lock().expect("opened").iter().map(|r| r.url.clone()).collect()
    }

    fn kills(&self) -> usize {
        *self.kills.lock().expect("kills")
    }

    fn check_calls(&self) -> usize {
        *self.check_calls.lock().expect("checks")
    }
}

#[async_trait]
impl MessagingAutomation for FakeAutomation {
    async fn open_messaging_app(&self, request: &OpenRequest) -> Result<OpenResult, CoreError> {
        self.opened.lock().expect("opened").push(request.clone());
        if self.refuse_open.iter().any(|n| request.url.ends_with(n.as_str())) {
            return Ok(OpenResult {
                success: false,
                error: Some("protocol handler missing".to_string()),
            });
        }
        Ok(OpenResult { success: true, error: None })
    }

    async fn verify_screenshot_timestamp(&self) -> Result<ScreenshotVerification, CoreError> {
        *self.check_calls.lock().expect("checks") += 1;
        let next = self.checks.lock().expect("checks").pop_front().unwrap_or(Check::Match);
        match next {
            Check::Match => Ok(ScreenshotVerification {
                success: true,
                time_matches: true,
                first_chat_timestamp: Some("10:42".to_string()),
                current_time: Some("10:42".to_string()),
                time_difference_minutes: Some(0.0),
                error: None,
            }),
            Check::Mismatch => Ok(ScreenshotVerification {
                success: true,
                time_matches: false,
                first_chat_timestamp: Some("09:10".to_string()),
                current_time: Some("10:42".to_string()),
                time_difference_minutes: Some(92.0),
                error: None,
            }),
            Check::Fail => Err(CoreError::Probe("ocr exited with status 1".to_string())),
            Check::Hang => std::future::pending().await,
        }
    }

    async fn kill_messaging_app(&self) -> Result<KillResult, CoreError> {
        *self.kills.lock().expect("kills") += 1;
        Ok(KillResult { success: true, message: None })
    }
}

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<StatusEvent>>,
}

impl Recorder {
    fn statuses_for(&self, record_index: i64) -> Vec<MessageStatus> {
        self.events
            .lock()
            .expect("events")
            .iter()
            .filter_map(|e| match e {
                StatusEvent::MessageStatusChanged { record_index: idx, status } if *idx == record_index => {
                    Some(status.clone())
                }
                _ => None,
            })
            .collect()
    }
}

impl StatusReporter for Recorder {
    fn report(&self, event: StatusEvent) {
        self.events.lock().expect("events").push(event);
    }
}

struct Harness {
    store: Arc<dyn DocumentStore>,
    queue: Arc<MessageQueueStore>,
    automation: Arc<FakeAutomation>,
    recorder: Arc<Recorder>,
    orchestrator: Arc<SendOrchestrator>,
}

fn message(record_index: i64, phone: &str, name: &str) -> Message {
    let mut fields = BTreeMap::new();
    fields.insert("student_name".to_string(), name.to_string());
    fields.insert("amount".to_string(), "500".to_string());
    Message::new(record_index, phone, fields)
}

fn setup(
    template: &str,
    messages: &[Message],
    verification: &[(&str, VerificationStatus)],
    automation: FakeAutomation,
) -> Harness {
    let store: Arc<dyn DocumentStore> = Arc::new(open_in_memory().expect("store"));
    let settings = Settings {
        message_template: template.to_string(),
        ..Settings::default()
    };
    save_settings(store.as_ref(), &settings).expect("settings");
    let docs: Vec<(String, serde_json::Value)> = verification
        .iter()
        .map(|(number, status)| {
            let item = VerificationItem {
                number: number.to_string(),
                status: *status,
                timestamp: Utc::now(),
                result: None,
            };
            (number.to_string(), serde_json::to_value(&item).expect("encode"))
        })
        .collect();
    store.put_many(VERIFICATION_QUEUE, &docs).expect("verification");

    let queue = Arc::new(MessageQueueStore::new(store.clone()));
    queue.upsert_many(messages).expect("messages");
    let recorder = Arc::new(Recorder::default());
    let registry = Arc::new(
        VerificationRegistry::load(store.clone(), recorder.clone(), VerificationTimings::default())
            .expect("registry"),
    );
    let automation = Arc::new(automation);
    let orchestrator = Arc::new(SendOrchestrator::new(
        store.clone(),
        queue.clone(),
        registry,
        automation.clone(),
        recorder.clone(),
        SendTimings::default(),
    ));
    Harness {
        store,
        queue,
        automation,
        recorder,
        orchestrator,
    }
}

fn finished(run: SendRun) -> SendSummary {
    match run {
        SendRun::Finished(summary) => summary,
        other => panic!("run did not finish: {:?}", other),
    }
}

const TEMPLATE: &str = "Hi {student_name}, pay {amount}";

#[tokio::test(start_paused = true)]
async fn verified_message_is_committed_after_delivery_check() {
    let h = setup(
        TEMPLATE,
        &[message(1, "9876543210", "Ravi")],
        &[("9876543210", VerificationStatus::Verified)],
        FakeAutomation::default(),
    );

    let summary = finished(h.orchestrator.process_queue_messages().await.expect("run"));
    assert_eq!(summary.committed, 1);
    assert!(!h.orchestrator.is_running());

    let opened = h.automation.opened.lock().expect("opened").clone();
    assert_eq!(opened.len(), 1);
    assert_eq!(opened[0].url, "whatsapp://send?phone=919876543210");
    assert_eq!(opened[0].text, "Hi Ravi, pay 500");
    assert!(opened[0].simulate_paste);

    assert_eq!(
        h.recorder.statuses_for(1),
        vec![
            MessageStatus::OpeningApp,
            MessageStatus::SearchingContact,
            MessageStatus::PastingText,
            MessageStatus::SendingMessage,
            MessageStatus::VerifyingDelivery,
        ]
    );

    assert!(h.queue.messages().is_empty());
    let history = h.queue.history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, MessageStatus::SentVerified);
    assert!(history[0].is_sent);
    let details = history[0].verification_details.as_ref().expect("details");
    assert_eq!(details.first_chat_timestamp.as_deref(), Some("10:42"));
    assert_eq!(h.automation.kills(), 1);
}

#[tokio::test(start_paused = true)]
async fn unverified_numbers_are_skipped_on_every_pass() {
    let h = setup(
        TEMPLATE,
        &[
            message(1, "9876543210", "Ravi"),
            message(2, "9876543211", "Asha"),
            message(3, "9876543212", "Kiran"),
        ],
        &[
            ("9876543210", VerificationStatus::NotVerified),
            ("9876543211", VerificationStatus::Pending),
        ],
        FakeAutomation::default(),
    );

    for _ in 0..3 {
        let summary = finished(h.orchestrator.process_queue_messages().await.expect("run"));
        assert_eq!(summary.skipped, 3);
        assert_eq!(summary.committed, 0);
    }
    assert!(h.automation.opened_urls().is_empty());

    let statuses: Vec<String> = h.queue.messages().iter().map(|m| m.status.to_string()).collect();
    assert_eq!(
        statuses,
        vec!["Skipped - not-verified", "Skipped - pending", "Skipped - not-started"]
    );
    assert!(h.queue.history().is_empty());
}

#[tokio::test(start_paused = true)]
async fn timestamp_mismatch_files_an_unverified_attempt() {
    let h = setup(
        TEMPLATE,
        &[message(1, "9876543210", "Ravi")],
        &[("9876543210", VerificationStatus::Verified)],
        FakeAutomation::with_checks(&[Check::Mismatch]),
    );

    let summary = finished(h.orchestrator.process_queue_messages().await.expect("run"));
    assert_eq!(summary.unverified, 1);
    assert!(h.recorder.statuses_for(1).contains(&MessageStatus::SentUnverified));

    let history = h.queue.history();
    assert_eq!(history[0].status, MessageStatus::AttemptedUnverified);
    assert!(!history[0].is_sent);
    assert!(history[0].attempt_time.is_some());
    assert_eq!(
        history[0]
            .verification_details
            .as_ref()
            .map(|d| d.time_difference_minutes),
        Some(92.0)
    );
    assert_eq!(h.automation.check_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn failed_or_hung_delivery_checks_are_terminal() {
    let h = setup(
        TEMPLATE,
        &[message(1, "9876543210", "Ravi"), message(2, "9876543211", "Asha")],
        &[
            ("9876543210", VerificationStatus::Verified),
            ("9876543211", VerificationStatus::Verified),
        ],
        FakeAutomation::with_checks(&[Check::Fail, Check::Hang]),
    );

    let summary = finished(h.orchestrator.process_queue_messages().await.expect("run"));
    assert_eq!(summary.failed, 2);
    assert!(h.queue.messages().is_empty());
    assert!(h
        .queue
        .history()
        .iter()
        .all(|m| m.status == MessageStatus::AttemptedFailed && !m.is_sent));
    assert_eq!(h.automation.check_calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn open_failure_records_an_attempt_and_moves_on() {
    let mut automation = FakeAutomation::default();
    automation.refuse_open.insert("919876543210".to_string());
    let h = setup(
        TEMPLATE,
        &[message(1, "9876543210", "Ravi"), message(2, "9876543211", "Asha")],
        &[
            ("9876543210", VerificationStatus::Verified),
            ("9876543211", VerificationStatus::Verified),
        ],
        automation,
    );

    let summary = finished(h.orchestrator.process_queue_messages().await.expect("run"));
    assert_eq!(summary.attempted, 1);
    assert_eq!(summary.committed, 1);
    assert_eq!(h.automation.check_calls(), 1);

    let history = h.queue.history();
    let first = history.iter().find(|m| m.record_index == 1).expect("first");
    assert_eq!(first.status, MessageStatus::Attempted);
    assert!(first.is_attempted);
}

#[tokio::test(start_paused = true)]
async fn messages_go_in_record_order_with_snoozed_held_back() {
    let h = setup(
        TEMPLATE,
        &[
            message(30, "9876543212", "Kiran"),
            message(10, "9876543210", "Ravi"),
            message(20, "9876543211", "Asha"),
        ],
        &[
            ("9876543210", VerificationStatus::Verified),
            ("9876543211", VerificationStatus::Verified),
            ("9876543212", VerificationStatus::Verified),
        ],
        FakeAutomation::default(),
    );
    h.queue.snooze(20, 60).expect("snooze");

    finished(h.orchestrator.process_queue_messages().await.expect("run"));
    assert_eq!(
        h.automation.opened_urls(),
        vec!["whatsapp://send?phone=919876543210", "whatsapp://send?phone=919876543212"]
    );
    let remaining = h.queue.messages();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].record_index, 20);
}

#[tokio::test(start_paused = true)]
async fn empty_template_aborts_without_touching_the_queue() {
    let h = setup(
        "  ",
        &[message(1, "9876543210", "Ravi")],
        &[("9876543210", VerificationStatus::Verified)],
        FakeAutomation::default(),
    );
    let run = h.orchestrator.process_queue_messages().await.expect("run");
    assert_eq!(run, SendRun::NoTemplate);
    assert!(h.automation.opened_urls().is_empty());
    assert_eq!(h.queue.messages()[0].status, MessageStatus::Pending);
    assert!(!h.orchestrator.is_running());
}

#[tokio::test(start_paused = true)]
async fn overlapping_trigger_is_a_no_op() {
    let h = setup(
        TEMPLATE,
        &[message(1, "9876543210", "Ravi")],
        &[("9876543210", VerificationStatus::Verified)],
        FakeAutomation::default(),
    );
    let run = tokio::spawn({
        let orchestrator = h.orchestrator.clone();
        async move { orchestrator.process_queue_messages().await }
    });
    tokio::task::yield_now().await;

    let second = h.orchestrator.process_queue_messages().await.expect("second");
    assert_eq!(second, SendRun::AlreadyRunning);
    let summary = finished(run.await.expect("join").expect("run"));
    assert_eq!(summary.committed, 1);
    assert_eq!(h.automation.opened_urls().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn cancel_before_open_returns_message_to_pending() {
    let h = setup(
        TEMPLATE,
        &[message(1, "9876543210", "Ravi")],
        &[("9876543210", VerificationStatus::Verified)],
        FakeAutomation::default(),
    );
    let run = tokio::spawn({
        let orchestrator = h.orchestrator.clone();
        async move { orchestrator.process_queue_messages().await }
    });
    tokio::task::yield_now().await;
    h.orchestrator.cancel();

    let summary = finished(run.await.expect("join").expect("run"));
    assert!(summary.cancelled);
    assert!(h.automation.opened_urls().is_empty());
    assert_eq!(h.queue.messages()[0].status, MessageStatus::Pending);
    assert_eq!(h.automation.kills(), 0);
}

#[tokio::test(start_paused = true)]
async fn cancel_after_open_files_an_attempt() {
    let h = setup(
        TEMPLATE,
        &[message(1, "9876543210", "Ravi"), message(2, "9876543211", "Asha")],
        &[
            ("9876543210", VerificationStatus::Verified),
            ("9876543211", VerificationStatus::Verified),
        ],
        FakeAutomation::default(),
    );
    let run = tokio::spawn({
        let orchestrator = h.orchestrator.clone();
        async move { orchestrator.process_queue_messages().await }
    });
    tokio::time::sleep(Duration::from_millis(600)).await;
    h.orchestrator.cancel();

    let summary = finished(run.await.expect("join").expect("run"));
    assert!(summary.cancelled);
    assert_eq!(summary.attempted, 1);
    assert_eq!(h.automation.opened_urls().len(), 1);
    assert_eq!(h.automation.check_calls(), 0);

    let history = h.queue.history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, MessageStatus::Attempted);
    assert_eq!(h.queue.messages().len(), 1);
    assert_eq!(h.queue.messages()[0].status, MessageStatus::Pending);
}

#[tokio::test(start_paused = true)]
async fn message_deleted_mid_send_is_tolerated() {
    let h = setup(
        TEMPLATE,
        &[message(1, "9876543210", "Ravi")],
        &[("9876543210", VerificationStatus::Verified)],
        FakeAutomation::default(),
    );
    let run = tokio::spawn({
        let orchestrator = h.orchestrator.clone();
        async move { orchestrator.process_queue_messages().await }
    });
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(h.queue.delete(1).expect("delete"));

    let summary = finished(run.await.expect("join").expect("run"));
    assert_eq!(summary.committed + summary.unverified + summary.failed, 0);
    assert!(h.queue.messages().is_empty());
    assert!(h.queue.history().is_empty());
    assert!(h.store.list("sent_messages").expect("history").is_empty());
}
