//! Keyed JSON document collections.
//!
//! Every component persists through this trait so the backing store can be
//! swapped (tests wrap it to inject failures). Bodies are plain JSON values;
//! typed (de)serialisation happens one layer up.

use serde_json::Value;

use crate::error::CoreError;

pub const MESSAGES: &str = "messages";
pub const SENT_MESSAGES: &str = "sent_messages";
pub const SETTINGS: &str = "settings";
pub const VERIFICATION_QUEUE: &str = "verification_queue";
pub const LEASES: &str = "leases";

/// Outcome of a [`DocumentStore::modify`] callback.
#[derive(Debug, Clone, PartialEq)]
pub enum Edit {
    Keep,
    Put(Value),
    Delete,
}

pub trait DocumentStore: Send + Sync {
    fn get(&self, collection: &str, key: &str) -> Result<Option<Value>, CoreError>;

    /// All documents of a collection in first-insertion order.
    fn list(&self, collection: &str) -> Result<Vec<Value>, CoreError>;

    /// Insert or replace. A replaced document keeps its position.
    fn put(&self, collection: &str, key: &str, body: &Value) -> Result<(), CoreError>;

    /// `put` for each pair inside one transaction.
    fn put_many(&self, collection: &str, docs: &[(String, Value)]) -> Result<(), CoreError>;

    /// Reads `key` and applies what `edit` returns, with no other writer in
    /// between, even from another process. `edit` sees `None` when the key
    /// is absent. Returns whether anything was written.
    fn modify(
        &self,
        collection: &str,
        key: &str,
        edit: &mut dyn FnMut(Option<&Value>) -> Result<Edit, CoreError>,
    ) -> Result<bool, CoreError>;

    /// Returns whether a document was removed.
    fn delete(&self, collection: &str, key: &str) -> Result<bool, CoreError>;

    /// Returns the number of removed documents.
    fn clear(&self, collection: &str) -> Result<usize, CoreError>;

    /// Atomically deletes `key` from `from` and writes `body` under `key` in
    /// `to`. Nothing is written when `key` is absent from `from`; the return
    /// value says whether the move happened.
    fn transfer(&self, from: &str, to: &str, key: &str, body: &Value) -> Result<bool, CoreError>;
}
