//! `{placeholder}` templates.
//!
//! Resolution order for a placeholder: exact custom field, custom field with
//! an equivalent normalized name, then the semantic alias table checked
//! against first-class message fields and custom fields. Anything unresolved
//! stays in the output verbatim so a missing mapping is visible.

use std::collections::HashSet;
use std::sync::OnceLock;

use chrono::{Duration as ChronoDuration, NaiveDate};
use regex::{Captures, Regex};

use crate::models::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Semantic {
    StudentName,
    ReceiptNo,
    Amount,
    FileLink,
    WhatsappLink,
    PhoneNumber,
    Email,
    TransactionId,
    Date,
}

const ALIASES: &[(Semantic, &[&str])] = &[
    (
        Semantic::StudentName,
        &["student_name", "student name", "name", "student", "customer name", "client name", "full name"],
    ),
    (
        Semantic::ReceiptNo,
        &["receipt_no", "receipt no", "receipt number", "receipt", "invoice no", "invoice number", "bill no"],
    ),
    (Semantic::Amount, &["amount", "amt", "fee", "fees", "total", "price", "payment"]),
    (Semantic::FileLink, &["file_link", "file link", "receipt link", "document link", "link"]),
    (Semantic::WhatsappLink, &["whatsapp_link", "whatsapp link", "wa link"]),
    (
        Semantic::PhoneNumber,
        &["phone_number", "phone number", "phone", "mobile", "mobile number", "contact", "whatsapp number"],
    ),
    (Semantic::Email, &["email", "e-mail", "email id", "mail"]),
    (
        Semantic::TransactionId,
        &["transaction_id", "transaction id", "txn id", "transaction", "reference no", "ref no"],
    ),
    (Semantic::Date, &["date", "payment date", "due date", "receipt date"]),
];

fn placeholder_regex() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\{([^{}]+)\}").expect("placeholder pattern"))
}

fn date_serial_regex() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^\d{5,}$").expect("date serial pattern"))
}

/// Case, space, underscore and hyphen insensitive form of a field name.
pub fn placeholder_key(name: &str) -> String {
    name.chars()
        .filter(|c| !c.is_whitespace() && *c != '_' && *c != '-')
        .flat_map(char::to_lowercase)
        .collect()
}

/// Placeholder names in first-occurrence order, duplicates collapsed.
pub fn extract_placeholders(template: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    placeholder_regex()
        .captures_iter(template)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str().trim().to_string()))
        .filter(|name| !name.is_empty() && seen.insert(name.clone()))
        .collect()
}

fn present(value: &str) -> Option<String> {
    if value.trim().is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

fn semantic_for(name: &str) -> Option<(Semantic, &'static [&'static str])> {
    let wanted = placeholder_key(name);
    ALIASES
        .iter()
        .find(|(_, variants)| variants.iter().any(|v| placeholder_key(v) == wanted))
        .map(|(semantic, variants)| (*semantic, *variants))
}

fn top_level(message: &Message, semantic: Semantic) -> Option<String> {
    let value = match semantic {
        Semantic::StudentName => message.student_name.as_deref(),
        Semantic::ReceiptNo => message.receipt_no.as_deref(),
        Semantic::Amount => message.amount.as_deref(),
        Semantic::PhoneNumber => Some(message.phone_number.as_str()),
        Semantic::Email => message.email.as_deref(),
        Semantic::WhatsappLink => Some(message.whatsapp_link.as_str()),
        Semantic::FileLink | Semantic::TransactionId | Semantic::Date => None,
    };
    value.and_then(present)
}

/// Value for one placeholder, or `None` when nothing maps to it.
pub fn resolve(name: &str, message: &Message) -> Option<String> {
    if let Some(value) = message.custom_fields.get(name).and_then(|v| present(v)) {
        return Some(value);
    }
    let wanted = placeholder_key(name);
    if let Some(value) = message
        .custom_fields
        .iter()
        .find(|(key, value)| placeholder_key(key) == wanted && !value.trim().is_empty())
        .map(|(_, value)| value.clone())
    {
        return Some(value);
    }
    let (semantic, variants) = semantic_for(name)?;
    if let Some(value) = top_level(message, semantic) {
        return Some(value);
    }
    let keys: Vec<String> = variants.iter().map(|v| placeholder_key(v)).collect();
    message
        .custom_fields
        .iter()
        .find(|(key, value)| keys.contains(&placeholder_key(key)) && !value.trim().is_empty())
        .map(|(_, value)| value.clone())
}

/// Spreadsheet day serial (days since 1899-12-30) as `DD/MM/YYYY`.
pub fn date_from_serial(serial: &str) -> Option<String> {
    let days: i64 = serial.trim().parse().ok()?;
    let epoch = NaiveDate::from_ymd_opt(1899, 12, 30)?;
    let date = epoch.checked_add_signed(ChronoDuration::try_days(days)?)?;
    Some(date.format("%d/%m/%Y").to_string())
}

fn render_value(name: &str, value: String) -> String {
    if name.to_lowercase().contains("date") && date_serial_regex().is_match(value.trim()) {
        return date_from_serial(&value).unwrap_or(value);
    }
    value
}

pub fn format(template: &str, message: &Message) -> String {
    placeholder_regex()
        .replace_all(template, |caps: &Captures<'_>| {
            let name = caps[1].trim();
            match resolve(name, message) {
                Some(value) => render_value(name, value),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}
