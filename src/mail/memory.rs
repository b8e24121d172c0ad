//! In-memory mailbox
//!
//! A [`MailClient`] over shared in-process state. Clones share the folders,
//! so a test can keep one handle to mutate the "server" while the sync
//! engine owns another. Failures can be injected per operation.

use crate::mail::{
    BodyRow, FolderStatus, HeaderRow, IdleEvent, LabelRow, MailClient, MailError,
    MailResult, MsgidRow, RemoteFolder,
};
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use indexmap::IndexMap;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;

/// Operations that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    Folders,
    Search,
    FetchMsgids,
    FetchHeaders,
    FetchBodies,
    FetchLabels,
    Idle,
}

/// One stored message
#[derive(Debug, Clone)]
pub struct MemoryMessage {
    pub native_id: String,
    pub raw: Vec<u8>,
    pub labels: Vec<String>,
    pub flags: Vec<String>,
    pub internal_date: Option<DateTime<FixedOffset>>,
}

impl MemoryMessage {
    pub fn new(native_id: impl Into<String>, raw: impl Into<Vec<u8>>) -> Self {
        Self {
            native_id: native_id.into(),
            raw: raw.into(),
            labels: Vec::new(),
            flags: Vec::new(),
            internal_date: None,
        }
    }

    pub fn with_labels(mut self, labels: &[&str]) -> Self {
        self.labels = labels.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_flags(mut self, flags: &[&str]) -> Self {
        self.flags = flags.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_date(mut self, date: DateTime<FixedOffset>) -> Self {
        self.internal_date = Some(date);
        self
    }
}

#[derive(Debug)]
struct MemoryFolder {
    attrs: Vec<String>,
    uid_validity: u32,
    next_uid: u32,
    messages: BTreeMap<u32, MemoryMessage>,
}

#[derive(Debug, Default)]
struct MailboxState {
    folders: IndexMap<String, MemoryFolder>,
    /// Remaining successful calls before the operation fails once
    failures: HashMap<FailPoint, usize>,
    calls: HashMap<FailPoint, usize>,
    logged_out: bool,
}

/// Shared in-memory mailbox implementing [`MailClient`]
#[derive(Debug, Clone, Default)]
pub struct MemoryMailbox {
    state: Arc<Mutex<MailboxState>>,
    changed: Arc<Notify>,
    selected: Option<String>,
}

impl MemoryMailbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mailbox laid out like a Gmail account
    pub fn gmail() -> Self {
        let mailbox = Self::new();
        mailbox.add_folder("INBOX", &["\\HasNoChildren"]);
        mailbox.add_folder("[Gmail]/All Mail", &["\\HasNoChildren", "\\All"]);
        mailbox.add_folder("[Gmail]/Spam", &["\\HasNoChildren", "\\Junk"]);
        mailbox.add_folder("[Gmail]/Trash", &["\\HasNoChildren", "\\Trash"]);
        mailbox
    }

    fn state(&self) -> MailResult<MutexGuard<'_, MailboxState>> {
        self.state
            .lock()
            .map_err(|_| MailError::Imap("mailbox state poisoned".to_string()))
    }

    pub fn add_folder(&self, name: &str, attrs: &[&str]) {
        if let Ok(mut state) = self.state() {
            let uid_validity = state.folders.len() as u32 + 1;
            state.folders.entry(name.to_string()).or_insert(MemoryFolder {
                attrs: attrs.iter().map(|s| s.to_string()).collect(),
                uid_validity,
                next_uid: 1,
                messages: BTreeMap::new(),
            });
        }
    }

    /// Store a message and return its UID
    pub fn append(&self, folder: &str, message: MemoryMessage) -> MailResult<u32> {
        let mut state = self.state()?;
        let folder = state
            .folders
            .get_mut(folder)
            .ok_or_else(|| MailError::NotFound(folder.to_string()))?;
        let uid = folder.next_uid;
        folder.next_uid += 1;
        folder.messages.insert(uid, message);
        Ok(uid)
    }

    fn with_message<F>(&self, folder: &str, uid: u32, f: F) -> MailResult<()>
    where
        F: FnOnce(&mut MemoryMessage),
    {
        let mut state = self.state()?;
        let message = state
            .folders
            .get_mut(folder)
            .and_then(|f| f.messages.get_mut(&uid))
            .ok_or_else(|| MailError::NotFound(format!("{}:{}", folder, uid)))?;
        f(message);
        Ok(())
    }

    pub fn set_flags(&self, folder: &str, uid: u32, flags: &[&str]) -> MailResult<()> {
        self.with_message(folder, uid, |m| {
            m.flags = flags.iter().map(|s| s.to_string()).collect()
        })
    }

    pub fn set_labels(&self, folder: &str, uid: u32, labels: &[&str]) -> MailResult<()> {
        self.with_message(folder, uid, |m| {
            m.labels = labels.iter().map(|s| s.to_string()).collect()
        })
    }

    pub fn remove(&self, folder: &str, uid: u32) -> MailResult<Option<MemoryMessage>> {
        let mut state = self.state()?;
        Ok(state
            .folders
            .get_mut(folder)
            .and_then(|f| f.messages.remove(&uid)))
    }

    /// Fail `point` once, after `successes` more successful calls
    pub fn fail_after(&self, point: FailPoint, successes: usize) {
        if let Ok(mut state) = self.state() {
            state.failures.insert(point, successes);
        }
    }

    pub fn fail_next(&self, point: FailPoint) {
        self.fail_after(point, 0);
    }

    /// Number of calls made to `point`, failed ones included
    pub fn calls(&self, point: FailPoint) -> usize {
        self.state()
            .map(|s| s.calls.get(&point).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn is_logged_out(&self) -> bool {
        self.state().map(|s| s.logged_out).unwrap_or(false)
    }

    /// Wake a pending idle wait
    pub fn notify_change(&self) {
        self.changed.notify_one();
    }

    fn enter(&self, point: FailPoint) -> MailResult<()> {
        let mut state = self.state()?;
        *state.calls.entry(point).or_insert(0) += 1;
        match state.failures.get_mut(&point) {
            Some(0) => {
                state.failures.remove(&point);
                Err(MailError::Imap(format!("injected failure in {:?}", point)))
            }
            Some(remaining) => {
                *remaining -= 1;
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn selected_rows<T, F>(&self, uids: &[u32], map: F) -> MailResult<Vec<T>>
    where
        F: Fn(u32, &MemoryMessage, u32) -> T,
    {
        let name = self.selected.as_ref().ok_or(MailError::NoFolderSelected)?;
        let state = self.state()?;
        let folder = state
            .folders
            .get(name)
            .ok_or_else(|| MailError::NotFound(name.clone()))?;
        let mut uids = uids.to_vec();
        uids.sort_unstable();
        uids.dedup();
        Ok(uids
            .into_iter()
            .filter_map(|uid| {
                folder
                    .messages
                    .get(&uid)
                    .map(|m| map(uid, m, folder.uid_validity))
            })
            .collect())
    }

    fn folder_status(&self, folder: &str) -> MailResult<FolderStatus> {
        let state = self.state()?;
        let f = state
            .folders
            .get(folder)
            .ok_or_else(|| MailError::NotFound(folder.to_string()))?;
        Ok(FolderStatus {
            exists: f.messages.len() as u32,
            uid_next: Some(f.next_uid),
            uid_validity: Some(f.uid_validity),
        })
    }
}

#[async_trait]
impl MailClient for MemoryMailbox {
    async fn folders(&mut self) -> MailResult<Vec<RemoteFolder>> {
        self.enter(FailPoint::Folders)?;
        let state = self.state()?;
        Ok(state
            .folders
            .iter()
            .map(|(name, f)| RemoteFolder {
                attrs: f.attrs.clone(),
                delimiter: Some("/".to_string()),
                name: name.clone(),
            })
            .collect())
    }

    async fn select(&mut self, folder: &str) -> MailResult<FolderStatus> {
        let status = self.folder_status(folder)?;
        self.selected = Some(folder.to_string());
        Ok(status)
    }

    async fn status(&mut self, folder: &str) -> MailResult<FolderStatus> {
        self.folder_status(folder)
    }

    async fn search(&mut self, folder: &str) -> MailResult<Vec<u32>> {
        self.enter(FailPoint::Search)?;
        self.select(folder).await?;
        let state = self.state()?;
        Ok(state
            .folders
            .get(folder)
            .map(|f| f.messages.keys().copied().collect())
            .unwrap_or_default())
    }

    async fn fetch_msgids(&mut self, uids: &[u32]) -> MailResult<Vec<MsgidRow>> {
        self.enter(FailPoint::FetchMsgids)?;
        self.selected_rows(uids, |uid, m, _| MsgidRow {
            uid,
            header: header_block(&m.raw).to_vec(),
        })
    }

    async fn fetch_headers(&mut self, uids: &[u32]) -> MailResult<Vec<HeaderRow>> {
        self.enter(FailPoint::FetchHeaders)?;
        self.selected_rows(uids, |uid, m, _| HeaderRow {
            uid,
            internal_date: m.internal_date,
            size: m.raw.len() as u32,
            header: header_block(&m.raw).to_vec(),
            native_id: m.native_id.clone(),
        })
    }

    async fn fetch_bodies(&mut self, uids: &[u32]) -> MailResult<Vec<BodyRow>> {
        self.enter(FailPoint::FetchBodies)?;
        self.selected_rows(uids, |uid, m, _| BodyRow {
            uid,
            raw: m.raw.clone(),
        })
    }

    async fn fetch_labels(&mut self, uids: &[u32]) -> MailResult<Vec<LabelRow>> {
        self.enter(FailPoint::FetchLabels)?;
        self.selected_rows(uids, |uid, m, _| LabelRow {
            uid,
            labels: m.labels.clone(),
            flags: m.flags.clone(),
        })
    }

    async fn idle(&mut self, folder: &str, timeout: Duration) -> MailResult<IdleEvent> {
        self.enter(FailPoint::Idle)?;
        self.select(folder).await?;
        match tokio::time::timeout(timeout, self.changed.notified()).await {
            Ok(()) => Ok(IdleEvent::Changed),
            Err(_) => Ok(IdleEvent::Timeout),
        }
    }

    async fn logout(&mut self) -> MailResult<()> {
        self.state()?.logged_out = true;
        self.selected = None;
        Ok(())
    }
}

/// Header block of a raw message (everything up to the first blank line)
fn header_block(raw: &[u8]) -> &[u8] {
    for (i, window) in raw.windows(4).enumerate() {
        if window == b"\r\n\r\n" {
            return &raw[..i + 4];
        }
    }
    for (i, window) in raw.windows(2).enumerate() {
        if window == b"\n\n" {
            return &raw[..i + 2];
        }
    }
    raw
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_block() {
        let raw = b"Subject: hi\r\nMessage-ID: <a@b>\r\n\r\nbody";
        assert_eq!(header_block(raw), b"Subject: hi\r\nMessage-ID: <a@b>\r\n\r\n");
        assert_eq!(header_block(b"A: b\n\nbody"), b"A: b\n\n");
        assert_eq!(header_block(b"no body"), b"no body");
    }

    fn raw(msgid: &str) -> Vec<u8> {
        format!("Message-ID: <{}>\r\nSubject: test\r\n\r\nbody\r\n", msgid).into_bytes()
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let server = MemoryMailbox::gmail();
        let mut client = server.clone();

        let uid = server
            .append("[Gmail]/All Mail", MemoryMessage::new("1", raw("m1")).with_flags(&["\\Seen"]))
            .unwrap();
        assert_eq!(client.search("[Gmail]/All Mail").await.unwrap(), vec![uid]);

        server.set_flags("[Gmail]/All Mail", uid, &[]).unwrap();
        let rows = client.fetch_labels(&[uid, 99]).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].flags.is_empty());

        let headers = client.fetch_headers(&[uid]).await.unwrap();
        assert!(headers[0].header.ends_with(b"\r\n\r\n"));
        assert_eq!(headers[0].native_id, "1");
    }

    #[tokio::test]
    async fn test_fetch_requires_selection() {
        let mut client = MemoryMailbox::gmail();
        assert!(matches!(
            client.fetch_bodies(&[1]).await,
            Err(MailError::NoFolderSelected)
        ));
    }

    #[tokio::test]
    async fn test_fail_after() {
        let mut client = MemoryMailbox::gmail();
        client.fail_after(FailPoint::Folders, 1);
        assert!(client.folders().await.is_ok());
        assert!(client.folders().await.is_err());
        assert!(client.folders().await.is_ok());
        assert_eq!(client.calls(FailPoint::Folders), 3);
    }

    #[tokio::test]
    async fn test_idle_wakes_on_change() {
        let server = MemoryMailbox::gmail();
        let mut client = server.clone();

        let event = client
            .idle("INBOX", Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(event, IdleEvent::Timeout);

        server.notify_change();
        let event = client.idle("INBOX", Duration::from_secs(5)).await.unwrap();
        assert_eq!(event, IdleEvent::Changed);
    }
}
