use std::collections::BTreeMap;
use std::sync::Mutex;

use chrono::Utc;
use rand::Rng;
use serde_json::Value;
use tracing::{info, warn};

use crate::error::CoreError;
use crate::models::{DuplicateRow, ImportSummary, Message};
use crate::phone;
use crate::queue::MessageQueueStore;
use crate::template::{self, placeholder_key};
use crate::verification::VerificationRegistry;

/// One parsed spreadsheet row: column header to raw cell value.
pub type Row = BTreeMap<String, Value>;

/// Placeholder name to column header. An empty header means unmapped.
pub type ColumnMapping = BTreeMap<String, String>;

pub const PHONE_PLACEHOLDER: &str = "phone_number";

const HEADER_ALIASES: &[(&str, &[&str])] = &[
    ("student_name", &["name", "student", "customer", "client", "full name", "person"]),
    ("receipt_no", &["receipt", "invoice", "bill", "voucher", "reference"]),
    ("amount", &["amt", "price", "payment", "fee", "total", "value"]),
    ("phone_number", &["phone", "mobile", "contact", "cell", "whatsapp", "number"]),
];

/// Issues record indexes: millisecond clock scaled by 1000 plus a random
/// salt, never repeating or going backwards within one generator.
#[derive(Debug, Default)]
pub struct RecordIndexGenerator {
    last: Mutex<i64>,
}

impl RecordIndexGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> i64 {
        let candidate = Utc::now().timestamp_millis() * 1000 + rand::thread_rng().gen_range(0..1000);
        let mut last = match self.last.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let issued = if candidate > *last { candidate } else { *last + 1 };
        *last = issued;
        issued
    }
}

/// Text form of a spreadsheet cell. Whole floats lose their fraction so a
/// phone number read as `9876543210.0` stays intact.
pub fn cell_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.trim().to_string(),
        Value::Bool(flag) => flag.to_string(),
        Value::Number(number) => {
            if let Some(int) = number.as_i64() {
                int.to_string()
            } else if let Some(float) = number.as_f64().filter(|f| f.fract() == 0.0 && f.abs() < 1e15) {
                format!("{}", float as i64)
            } else {
                number.to_string()
            }
        }
        other => other.to_string(),
    }
}

fn find_header(placeholder: &str, headers: &[String]) -> Option<String> {
    let wanted = placeholder_key(placeholder);
    if let Some(header) = headers.iter().find(|h| placeholder_key(h) == wanted) {
        return Some(header.clone());
    }
    if let Some((_, aliases)) = HEADER_ALIASES.iter().find(|(name, _)| *name == placeholder) {
        for alias in aliases.iter() {
            let alias_key = placeholder_key(alias);
            if let Some(header) = headers.iter().find(|h| placeholder_key(h) == alias_key) {
                return Some(header.clone());
            }
        }
        for alias in aliases.iter() {
            let alias_key = placeholder_key(alias);
            if let Some(header) = headers.iter().find(|h| placeholder_key(h).contains(&alias_key)) {
                return Some(header.clone());
            }
        }
    }
    headers
        .iter()
        .find(|h| {
            let key = placeholder_key(h);
            !key.is_empty() && (key.contains(&wanted) || wanted.contains(&key))
        })
        .cloned()
}

/// Proposes a column for every placeholder; `phone_number` is always part
/// of the result. Unmatched placeholders map to an empty header.
pub fn suggest_mapping(placeholders: &[String], headers: &[String]) -> ColumnMapping {
    let mut names: Vec<&str> = placeholders.iter().map(String::as_str).collect();
    if !names.contains(&PHONE_PLACEHOLDER) {
        names.push(PHONE_PLACEHOLDER);
    }
    names
        .into_iter()
        .map(|name| (name.to_string(), find_header(name, headers).unwrap_or_default()))
        .collect()
}

/// Placeholders of `template`, plus `phone_number`, with no column mapped.
pub fn missing_mappings(template_text: &str, mapping: &ColumnMapping) -> Vec<String> {
    let mut names = template::extract_placeholders(template_text);
    if !names.iter().any(|n| n == PHONE_PLACEHOLDER) {
        names.insert(0, PHONE_PLACEHOLDER.to_string());
    }
    names
        .into_iter()
        .filter(|name| mapping.get(name).map(|h| h.trim().is_empty()).unwrap_or(true))
        .collect()
}

fn mapped_value(row: &Row, mapping: &ColumnMapping, placeholder: &str) -> String {
    mapping
        .get(placeholder)
        .filter(|header| !header.trim().is_empty())
        .and_then(|header| row.get(header))
        .map(cell_to_string)
        .unwrap_or_default()
}

fn build_message(row: &Row, mapping: &ColumnMapping, record_index: i64, raw_phone: &str) -> Message {
    let mut fields: BTreeMap<String, String> = row
        .iter()
        .map(|(header, value)| (header.clone(), cell_to_string(value)))
        .collect();
    for placeholder in mapping.keys() {
        let value = mapped_value(row, mapping, placeholder);
        if !value.is_empty() {
            fields.insert(placeholder.clone(), value);
        }
    }
    let mut message = Message::new(record_index, raw_phone, fields);
    message.student_name = template::resolve("student_name", &message);
    message.receipt_no = template::resolve("receipt_no", &message);
    message.amount = template::resolve("amount", &message);
    message.email = template::resolve("email", &message);
    message
}

pub fn import_rows(
    rows: &[Row],
    mapping: &ColumnMapping,
    queue: &MessageQueueStore,
    registry: &VerificationRegistry,
    ids: &RecordIndexGenerator,
) -> Result<ImportSummary, CoreError> {
    import_rows_with_progress(rows, mapping, queue, registry, ids, |_| {})
}

/// Turns rows into queued messages. Rows without a phone number and rows
/// whose number is already in the queue, in history, or earlier in the batch
/// are skipped and reported. Every created message's number is offered to
/// the verification registry; rejections there are ignored.
pub fn import_rows_with_progress<F>(
    rows: &[Row],
    mapping: &ColumnMapping,
    queue: &MessageQueueStore,
    registry: &VerificationRegistry,
    ids: &RecordIndexGenerator,
    progress: F,
) -> Result<ImportSummary, CoreError>
where
    F: Fn(&str),
{
    progress("Checking existing messages...");
    let mut known = queue.known_numbers();
    let mut summary = ImportSummary::default();
    let mut created = Vec::new();

    for (idx, row) in rows.iter().enumerate() {
        let row_number = idx + 1;
        let raw_phone = mapped_value(row, mapping, PHONE_PLACEHOLDER);
        if phone::digits(&raw_phone).is_empty() {
            summary.missing_phone_rows.push(row_number);
            continue;
        }
        let message = build_message(row, mapping, ids.next(), &raw_phone);
        if !known.insert(message.bare_number()) {
            summary.duplicates.push(DuplicateRow {
                row: row_number,
                student_name: message.display_name(),
                phone_number: message.phone_number.clone(),
                receipt_no: message.receipt_no.clone().unwrap_or_default(),
            });
            continue;
        }
        created.push(message);
        if row_number % 100 == 0 {
            progress(&format!("Importing rows... {}/{}", row_number, rows.len()));
        }
    }

    if !created.is_empty() {
        progress("Saving messages...");
        queue.upsert_many(&created)?;
        progress("Queueing numbers for verification...");
        let numbers: Vec<String> = created.iter().map(Message::bare_number).collect();
        summary.verification_enqueued = registry
            .add_bulk(&numbers)?
            .iter()
            .filter(|result| result.success)
            .count();
    }
    summary.created = created.iter().map(|m| m.record_index).collect();

    if !summary.missing_phone_rows.is_empty() {
        warn!(
            rows = ?summary.missing_phone_rows,
            "rows skipped without phone number"
        );
    }
    if !summary.duplicates.is_empty() {
        warn!(count = summary.duplicates.len(), "duplicate rows skipped");
    }
    info!(
        created = summary.created.len(),
        duplicates = summary.duplicates.len(),
        missing_phone = summary.missing_phone_rows.len(),
        verification_enqueued = summary.verification_enqueued,
        "import finished"
    );
    Ok(summary)
}
