pub mod automation;
pub mod db;
pub mod diagnostics;
pub mod error;
pub mod import;
pub mod lease;
pub mod models;
pub mod notify;
pub mod orchestrator;
pub mod phone;
pub mod queue;
pub mod reminder;
pub mod settings;
pub mod store;
pub mod template;
pub mod verification;
mod migrations;

pub use db::{open_in_memory, open_store, SqliteDocumentStore};
pub use error::CoreError;
pub use orchestrator::{SendOrchestrator, SendRun, SendSummary};
pub use queue::MessageQueueStore;
pub use store::DocumentStore;
pub use verification::{VerificationRegistry, VerificationRun, VerificationSummary};
