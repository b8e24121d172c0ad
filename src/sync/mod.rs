//! Sync Module - Mailbox Reconciliation Engine
//!
//! Keeps the local store in line with one remote account:
//! - Canonical folder selection and UID → Message-ID resolution
//! - Header and body ingestion with deterministic message ids
//! - Label/flag reconciliation scoped per canonical folder
//! - Local task queue draining
//! - Conversation threading from header references
//!
//! Every run holds the account lock for its whole duration; changed message
//! ids are pushed to the notifier after each committed step.

pub mod bodies;
pub mod context;
pub mod folders;
pub mod headers;
pub mod labels;
pub mod lock;
pub mod manager;
pub mod notify;
pub mod supervisor;
pub mod tasks;
pub mod threads;
pub mod uids;

#[cfg(test)]
pub(crate) mod tests;

// Re-export commonly used types
pub use context::SyncContext;
pub use folders::{select_canonical, CanonicalFolder};
pub use lock::{AccountGuard, AccountLocks, LockError};
pub use manager::{SyncError, SyncManager, SyncOptions, SyncResult};
pub use notify::{HttpNotifier, Notifier, RecordingNotifier};
pub use supervisor::{ClientFactory, Job, Supervisor, SupervisorError, SupervisorState, SupervisorTimings};
pub use uids::UidMap;
