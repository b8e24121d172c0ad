//! # Mailmirror - Mail Module
//!
//! Remote mailbox access: the client contract used by the sync engine, the
//! typed rows it returns, an IMAP implementation and, for tests, an
//! in-memory mailbox.

pub mod config;
pub mod imap;
#[cfg(test)]
pub mod memory;
pub mod parser;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use std::time::Duration;

// Re-export commonly used types
pub use config::{ImapConfig, SecurityType};
pub use imap::ImapClient;
#[cfg(test)]
pub use memory::{FailPoint, MemoryMailbox, MemoryMessage};
pub use parser::{parse, Attachment, Mailbox, ParsedMessage};

/// Result type alias for mail operations
pub type MailResult<T> = Result<T, MailError>;

/// Unified error type for mail operations
#[derive(Debug, thiserror::Error)]
pub enum MailError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("IMAP error: {0}")]
    Imap(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not connected")]
    NotConnected,

    #[error("No folder selected")]
    NoFolderSelected,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Folder as listed by the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFolder {
    pub attrs: Vec<String>,
    pub delimiter: Option<String>,
    /// Raw (modified UTF-7) folder name
    pub name: String,
}

/// Counters reported by SELECT / STATUS
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderStatus {
    pub exists: u32,
    pub uid_next: Option<u32>,
    pub uid_validity: Option<u32>,
}

/// Header block holding the Message-ID of one message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MsgidRow {
    pub uid: u32,
    pub header: Vec<u8>,
}

/// Full header fetch of one message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderRow {
    pub uid: u32,
    pub internal_date: Option<DateTime<FixedOffset>>,
    pub size: u32,
    pub header: Vec<u8>,
    /// Server-wide stable message identifier (X-GM-MSGID where available)
    pub native_id: String,
}

/// Raw RFC822 message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BodyRow {
    pub uid: u32,
    pub raw: Vec<u8>,
}

/// Remote labels and flags of one message
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelRow {
    pub uid: u32,
    pub labels: Vec<String>,
    pub flags: Vec<String>,
}

/// Why an idle wait returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleEvent {
    Changed,
    Timeout,
}

/// Stateful remote session.
///
/// `search` selects the folder; the fetch methods address UIDs of the
/// currently selected folder.
#[async_trait]
pub trait MailClient: Send {
    /// List every folder with its attributes
    async fn folders(&mut self) -> MailResult<Vec<RemoteFolder>>;

    /// Select a folder for subsequent fetches
    async fn select(&mut self, folder: &str) -> MailResult<FolderStatus>;

    /// Folder counters without changing the selection
    async fn status(&mut self, folder: &str) -> MailResult<FolderStatus>;

    /// Select the folder and return all of its UIDs in ascending order
    async fn search(&mut self, folder: &str) -> MailResult<Vec<u32>>;

    async fn fetch_msgids(&mut self, uids: &[u32]) -> MailResult<Vec<MsgidRow>>;

    async fn fetch_headers(&mut self, uids: &[u32]) -> MailResult<Vec<HeaderRow>>;

    async fn fetch_bodies(&mut self, uids: &[u32]) -> MailResult<Vec<BodyRow>>;

    async fn fetch_labels(&mut self, uids: &[u32]) -> MailResult<Vec<LabelRow>>;

    /// Wait for a change in `folder` or until `timeout` elapses
    async fn idle(&mut self, folder: &str, timeout: Duration) -> MailResult<IdleEvent>;

    async fn logout(&mut self) -> MailResult<()>;
}

/// Compress sorted UIDs into an IMAP sequence set (`1:3,7,9:10`)
pub fn uid_set(uids: &[u32]) -> String {
    let mut sorted = uids.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut parts: Vec<String> = Vec::new();
    let mut iter = sorted.into_iter().peekable();
    while let Some(start) = iter.next() {
        let mut end = start;
        while iter.peek() == Some(&(end + 1)) {
            end += 1;
            iter.next();
        }
        if start == end {
            parts.push(start.to_string());
        } else {
            parts.push(format!("{}:{}", start, end));
        }
    }
    parts.join(",")
}
