use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::phone;

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageStatus {
    #[default]
    Pending,
    OpeningApp,
    SearchingContact,
    PastingText,
    SendingMessage,
    VerifyingDelivery,
    SentVerified,
    SentUnverified,
    Attempted,
    AttemptedUnverified,
    AttemptedFailed,
    Snoozed,
    Skipped(String),
    /// A status string written by something other than this crate.
    Other(String),
}

impl MessageStatus {
    pub fn skipped(reason: impl fmt::Display) -> Self {
        MessageStatus::Skipped(reason.to_string())
    }

    /// Mirrors how the queue decides a message is done: any status naming a send.
    pub fn indicates_sent(&self) -> bool {
        let text = self.to_string();
        text.contains("Sent") || text.contains("sent")
    }

    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            MessageStatus::OpeningApp
                | MessageStatus::SearchingContact
                | MessageStatus::PastingText
                | MessageStatus::SendingMessage
                | MessageStatus::VerifyingDelivery
        )
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageStatus::Pending => f.write_str("Pending"),
            MessageStatus::OpeningApp => f.write_str("Opening WhatsApp..."),
            MessageStatus::SearchingContact => f.write_str("Searching contact..."),
            MessageStatus::PastingText => f.write_str("Pasting text..."),
            MessageStatus::SendingMessage => f.write_str("Sending message..."),
            MessageStatus::VerifyingDelivery => f.write_str("Verifying message delivery..."),
            MessageStatus::SentVerified => f.write_str("Sent ✅ (Verified)"),
            MessageStatus::SentUnverified => f.write_str("Sent ⚠️ (Unverified - Time Mismatch)"),
            MessageStatus::Attempted => f.write_str("Attempted"),
            MessageStatus::AttemptedUnverified => f.write_str("Attempted - Unverified"),
            MessageStatus::AttemptedFailed => f.write_str("Attempted - Verification Failed"),
            MessageStatus::Snoozed => f.write_str("Snoozed"),
            MessageStatus::Skipped(reason) => write!(f, "Skipped - {}", reason),
            MessageStatus::Other(text) => f.write_str(text),
        }
    }
}

impl From<String> for MessageStatus {
    fn from(value: String) -> Self {
        let known = [
            MessageStatus::Pending,
            MessageStatus::OpeningApp,
            MessageStatus::SearchingContact,
            MessageStatus::PastingText,
            MessageStatus::SendingMessage,
            MessageStatus::VerifyingDelivery,
            MessageStatus::SentVerified,
            MessageStatus::SentUnverified,
            MessageStatus::Attempted,
            MessageStatus::AttemptedUnverified,
            MessageStatus::AttemptedFailed,
            MessageStatus::Snoozed,
        ];
        if let Some(status) = known.into_iter().find(|s| s.to_string() == value) {
            return status;
        }
        match value.strip_prefix("Skipped - ") {
            Some(reason) => MessageStatus::Skipped(reason.to_string()),
            None => MessageStatus::Other(value),
        }
    }
}

impl From<MessageStatus> for String {
    fn from(value: MessageStatus) -> Self {
        value.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationDetails {
    pub first_chat_timestamp: Option<String>,
    pub current_time: Option<String>,
    #[serde(rename = "timeDifference")]
    pub time_difference_minutes: f64,
    pub verified_at: DateTime<Utc>,
}

/// One queued outbound message.
///
/// `phone_number` holds the dialing form. The semantic fields the template
/// aliases know about are resolved once at import time; every imported
/// column also stays in `custom_fields`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub record_index: i64,
    pub phone_number: String,
    #[serde(default)]
    pub whatsapp_link: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub student_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receipt_no: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default)]
    pub custom_fields: BTreeMap<String, String>,
    #[serde(default)]
    pub status: MessageStatus,
    #[serde(default)]
    pub is_sent: bool,
    #[serde(default)]
    pub is_attempted: bool,
    #[serde(default)]
    pub is_snoozed: bool,
    #[serde(default)]
    pub snoozed_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub sent_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub attempt_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
    #[serde(default)]
    pub imported_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification_details: Option<VerificationDetails>,
}

impl Message {
    pub fn new(record_index: i64, phone_number: &str, custom_fields: BTreeMap<String, String>) -> Self {
        let dialing = phone::with_country_code(phone_number);
        Self {
            record_index,
            whatsapp_link: phone::wa_me_link(&dialing),
            phone_number: dialing,
            student_name: None,
            receipt_no: None,
            amount: None,
            email: None,
            custom_fields,
            status: MessageStatus::Pending,
            is_sent: false,
            is_attempted: false,
            is_snoozed: false,
            snoozed_until: None,
            sent_time: None,
            attempt_time: None,
            last_updated: None,
            imported_at: Some(Utc::now()),
            verification_details: None,
        }
    }

    pub fn bare_number(&self) -> String {
        phone::normalize(&self.phone_number)
    }

    pub fn is_snoozed_at(&self, now: DateTime<Utc>) -> bool {
        self.is_snoozed && self.snoozed_until.map(|until| until > now).unwrap_or(false)
    }

    /// Best display name: the resolved student name, else the first custom
    /// field that looks like a name.
    pub fn display_name(&self) -> String {
        if let Some(name) = self.student_name.as_deref().filter(|n| !n.trim().is_empty()) {
            return name.trim().to_string();
        }
        self.custom_fields
            .iter()
            .find(|(key, value)| {
                let key = key.to_lowercase();
                (key.contains("name") || key.contains("student"))
                    && !key.contains("phone")
                    && !key.contains("number")
                    && !value.trim().is_empty()
            })
            .map(|(_, value)| value.trim().to_string())
            .unwrap_or_else(|| "Contact".to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VerificationStatus {
    Pending,
    Verifying,
    Verified,
    NotVerified,
    Error,
}

impl fmt::Display for VerificationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            VerificationStatus::Pending => "pending",
            VerificationStatus::Verifying => "verifying",
            VerificationStatus::Verified => "verified",
            VerificationStatus::NotVerified => "not-verified",
            VerificationStatus::Error => "error",
        };
        f.write_str(text)
    }
}

/// Result of a registry lookup. `NotStarted` means the number was never
/// enqueued, which is different from a stored `pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationState {
    NotStarted,
    Tracked(VerificationStatus),
}

impl VerificationState {
    pub fn is_verified(&self) -> bool {
        matches!(self, VerificationState::Tracked(VerificationStatus::Verified))
    }
}

impl fmt::Display for VerificationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerificationState::NotStarted => f.write_str("not-started"),
            VerificationState::Tracked(status) => status.fmt(f),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationItem {
    pub number: String,
    pub status: VerificationStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddNumberResult {
    pub number: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifiedExportRow {
    pub number: String,
    pub status: VerificationStatus,
    pub timestamp: DateTime<Utc>,
    pub ocr_text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(default)]
    pub message_template: String,
    #[serde(default)]
    pub notification_minutes: u32,
    #[serde(default = "default_notification_seconds")]
    pub notification_seconds: u32,
    #[serde(default = "default_true")]
    pub notifications_enabled: bool,
}

fn default_notification_seconds() -> u32 {
    5
}

fn default_true() -> bool {
    true
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            message_template: String::new(),
            notification_minutes: 0,
            notification_seconds: default_notification_seconds(),
            notifications_enabled: true,
        }
    }
}

impl Settings {
    pub const MIN_POLL: Duration = Duration::from_secs(5);

    pub fn poll_interval(&self) -> Duration {
        if self.notification_minutes == 0 && self.notification_seconds == 0 {
            return Self::MIN_POLL;
        }
        Duration::from_secs(u64::from(self.notification_minutes) * 60 + u64::from(self.notification_seconds))
    }
}

/// What the automation collaborator is asked to open.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenRequest {
    pub url: String,
    pub text: String,
    pub simulate_paste: bool,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct OpenResult {
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct KillResult {
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
}

/// Output of the number-presence probe.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NumberProbeResult {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub ocr_text: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl NumberProbeResult {
    pub fn is_verified(&self) -> bool {
        self.status == "Verified"
    }
}

/// Output of the post-send screenshot timestamp probe.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ScreenshotVerification {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub time_matches: bool,
    #[serde(default)]
    pub first_chat_timestamp: Option<String>,
    #[serde(default)]
    pub current_time: Option<String>,
    #[serde(default)]
    pub time_difference_minutes: Option<f64>,
    #[serde(default)]
    pub error: Option<String>,
}

impl ScreenshotVerification {
    pub fn confirms_delivery(&self) -> bool {
        self.success && self.time_matches
    }

    pub fn details(&self) -> VerificationDetails {
        VerificationDetails {
            first_chat_timestamp: self.first_chat_timestamp.clone(),
            current_time: self.current_time.clone(),
            time_difference_minutes: self.time_difference_minutes.unwrap_or(0.0),
            verified_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DuplicateRow {
    pub row: usize,
    pub student_name: String,
    pub phone_number: String,
    pub receipt_no: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportSummary {
    pub created: Vec<i64>,
    pub duplicates: Vec<DuplicateRow>,
    pub missing_phone_rows: Vec<usize>,
    pub verification_enqueued: usize,
}
