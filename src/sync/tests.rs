//! Integration Tests for Sync Module
//!
//! End-to-end flows against the in-memory mailbox:
//! - Full passes, idempotence and dedup across folders
//! - Label scoping and flag labels
//! - Task queue interplay with reconciliation
//! - Threading after a sync
//! - Supervisor lifecycle

use super::*;
use crate::config::SyncSettings;
use crate::db::{Database, Task, TaskAction};
use crate::mail::{FailPoint, MailClient, MailError, MemoryMailbox, MemoryMessage};
use chrono::{FixedOffset, TimeZone};
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const ACCOUNT: &str = "a@x";
const ALL: &str = "[Gmail]/All Mail";
const TRASH: &str = "[Gmail]/Trash";

// ============================================================================
// Helpers shared with the per-module tests
// ============================================================================

/// Seen message `n` with native id `n`, dated `n` minutes past 10:00
pub fn message(n: u32, msgid: &str, in_reply_to: Option<&str>, refs: &[&str]) -> MemoryMessage {
    let mut raw = format!(
        "From: Sender <sender@example.com>\r\n\
         To: me@example.com\r\n\
         Subject: Message {msgid}\r\n\
         Date: Mon, 1 Jan 2024 10:{:02}:00 +0000\r\n\
         Message-ID: <{msgid}>\r\n",
        n % 60,
        msgid = msgid
    );
    if let Some(parent) = in_reply_to {
        raw.push_str(&format!("In-Reply-To: <{}>\r\n", parent));
    }
    if !refs.is_empty() {
        let refs: Vec<String> = refs.iter().map(|r| format!("<{}>", r)).collect();
        raw.push_str(&format!("References: {}\r\n", refs.join(" ")));
    }
    raw.push_str(&format!("\r\nBody of {}\r\n", msgid));

    let date = FixedOffset::east_opt(0)
        .unwrap()
        .with_ymd_and_hms(2024, 1, 1, 10, n % 60, 0)
        .unwrap();
    MemoryMessage::new(n.to_string(), raw.into_bytes())
        .with_flags(&["\\Seen"])
        .with_date(date)
}

/// Context over a fresh Gmail-like mailbox and in-memory store
pub fn context() -> (MemoryMailbox, SyncContext, Arc<RecordingNotifier>) {
    let server = MemoryMailbox::gmail();
    let notifier = Arc::new(RecordingNotifier::new());
    let ctx = SyncContext::new(
        ACCOUNT,
        Database::in_memory().unwrap(),
        Box::new(server.clone()),
        notifier.clone(),
        SyncSettings::default(),
    );
    (server, ctx, notifier)
}

pub fn manager() -> (SyncManager, Arc<RecordingNotifier>) {
    let notifier = Arc::new(RecordingNotifier::new());
    let manager = SyncManager::new(
        Database::in_memory().unwrap(),
        notifier.clone(),
        SyncSettings::default(),
    );
    (manager, notifier)
}

async fn full_sync(manager: &SyncManager, server: &MemoryMailbox) -> SyncResult {
    let mut ctx = manager.context(ACCOUNT, Box::new(server.clone()));
    let result = manager
        .sync_account(&mut ctx, &SyncOptions::default())
        .await
        .unwrap();
    ctx.close().await;
    result
}

fn labels(manager: &SyncManager, msgid: &str) -> Vec<String> {
    let mut labels = manager
        .db()
        .get_email_by_msgid(ACCOUNT, msgid)
        .unwrap()
        .unwrap()
        .labels;
    labels.sort();
    labels
}

fn strings(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

// ============================================================================
// Full pass
// ============================================================================

#[tokio::test]
async fn test_second_pass_is_a_no_op() {
    let (manager, notifier) = manager();
    let server = MemoryMailbox::gmail();
    server
        .append(ALL, message(1, "m1@x", None, &[]).with_labels(&["\\Inbox"]))
        .unwrap();
    server
        .append(ALL, message(2, "m2@x", Some("m1@x"), &["m1@x"]).with_flags(&[]))
        .unwrap();
    server
        .append(TRASH, message(3, "m3@x", None, &[]).with_flags(&["\\Seen", "\\Answered"]))
        .unwrap();

    let result = full_sync(&manager, &server).await;
    assert!(result.is_success());
    assert_eq!(manager.db().get_emails(ACCOUNT).unwrap().len(), 3);
    assert_eq!(notifier.ids().len(), 3);
    assert_eq!(labels(&manager, "m1@x"), strings(&["\\All", "\\Inbox"]));
    assert_eq!(labels(&manager, "m2@x"), strings(&["\\All", "\\Unread"]));
    assert_eq!(labels(&manager, "m3@x"), strings(&["\\Answered", "\\Trash"]));

    let before: Vec<_> = manager
        .db()
        .get_emails(ACCOUNT)
        .unwrap()
        .into_iter()
        .map(|e| (e.id, e.labels))
        .collect();
    let header_fetches = server.calls(FailPoint::FetchHeaders);
    notifier.clear();

    let again = full_sync(&manager, &server).await;
    assert!(again.is_success());
    assert!(notifier.batches().is_empty());
    assert_eq!(server.calls(FailPoint::FetchHeaders), header_fetches);
    let after: Vec<_> = manager
        .db()
        .get_emails(ACCOUNT)
        .unwrap()
        .into_iter()
        .map(|e| (e.id, e.labels))
        .collect();
    assert_eq!(before, after);
}

#[tokio::test]
async fn test_uid_ten_labels_and_flags() {
    let (manager, _) = manager();
    let server = MemoryMailbox::gmail();
    for n in 1..=9 {
        let uid = server.append(ALL, message(n, &format!("filler{}@x", n), None, &[])).unwrap();
        server.remove(ALL, uid).unwrap();
    }
    let uid = server
        .append(ALL, message(10, "m1@x", None, &[]).with_labels(&["\\Inbox"]))
        .unwrap();
    assert_eq!(uid, 10);

    let result = full_sync(&manager, &server).await;
    assert_eq!(result.uid_maps[ALL].as_ref().unwrap()[&10], "m1@x");

    let labels = labels(&manager, "m1@x");
    assert!(labels.contains(&"\\Inbox".to_string()));
    assert!(labels.contains(&"\\All".to_string()));
    assert!(!labels.contains(&"\\Unread".to_string()));
    assert!(!labels.contains(&"\\Answered".to_string()));
}

#[tokio::test]
async fn test_identity_is_deterministic() {
    let server = MemoryMailbox::gmail();
    server.append(ALL, message(7, "m7@x", None, &[])).unwrap();

    let (first, _) = manager();
    let (second, _) = manager();
    full_sync(&first, &server).await;
    full_sync(&second, &server).await;

    let a = first.db().get_email_by_msgid(ACCOUNT, "m7@x").unwrap().unwrap();
    let b = second.db().get_email_by_msgid(ACCOUNT, "m7@x").unwrap().unwrap();
    assert_eq!(a.id, b.id);
    assert_eq!(a.id, headers::message_uuid(ACCOUNT, "7"));
}

#[tokio::test]
async fn test_dedup_across_canonical_folders() {
    let (manager, notifier) = manager();
    let server = MemoryMailbox::gmail();
    server.append(ALL, message(1, "same@x", None, &[])).unwrap();
    server.append(TRASH, message(2, "same@x", None, &[])).unwrap();

    full_sync(&manager, &server).await;
    let emails = manager.db().get_emails(ACCOUNT).unwrap();
    assert_eq!(emails.len(), 1);
    assert_eq!(emails[0].id, headers::message_uuid(ACCOUNT, "1"));
    assert_eq!(labels(&manager, "same@x"), strings(&["\\All", "\\Trash"]));

    notifier.clear();
    full_sync(&manager, &server).await;
    assert!(notifier.batches().is_empty());
}

#[tokio::test]
async fn test_trash_only_enumeration() {
    let (manager, _) = manager();
    let server = MemoryMailbox::new();
    server.add_folder("Trash", &["\\Trash"]);
    server.add_folder("INBOX", &["\\Inbox"]);
    server.append("Trash", message(1, "t1@x", None, &[])).unwrap();
    server.append("INBOX", message(2, "i1@x", None, &[])).unwrap();

    let result = full_sync(&manager, &server).await;
    assert_eq!(result.uid_maps.keys().collect::<Vec<_>>(), vec!["Trash"]);
    assert_eq!(server.calls(FailPoint::Search), 1);

    let emails = manager.db().get_emails(ACCOUNT).unwrap();
    assert_eq!(emails.len(), 1);
    assert_eq!(emails[0].msgid, "t1@x");
}

#[tokio::test]
async fn test_only_labels_override() {
    let (manager, _) = manager();
    let server = MemoryMailbox::gmail();
    server.append(ALL, message(1, "m1@x", None, &[])).unwrap();
    server.append(TRASH, message(2, "m2@x", None, &[])).unwrap();

    let mut ctx = manager.context(ACCOUNT, Box::new(server.clone()));
    let options = SyncOptions {
        only_labels: Some(strings(&["\\Trash"])),
        ..Default::default()
    };
    let result = manager.sync_account(&mut ctx, &options).await.unwrap();
    assert_eq!(result.uid_maps.keys().collect::<Vec<_>>(), vec![TRASH]);
    assert_eq!(manager.db().get_emails(ACCOUNT).unwrap().len(), 1);
}

#[tokio::test]
async fn test_only_labels_markers_survive_sweep() {
    let notifier = Arc::new(RecordingNotifier::new());
    let settings = SyncSettings {
        labels: strings(&["\\All"]),
        ..Default::default()
    };
    let manager = SyncManager::new(Database::in_memory().unwrap(), notifier.clone(), settings);
    let server = MemoryMailbox::gmail();
    server.append(ALL, message(1, "same@x", None, &[])).unwrap();
    server.append(TRASH, message(2, "same@x", None, &[])).unwrap();

    let options = SyncOptions {
        only_labels: Some(strings(&["\\All", "\\Trash"])),
        ..Default::default()
    };
    for _ in 0..2 {
        notifier.clear();
        let mut ctx = manager.context(ACCOUNT, Box::new(server.clone()));
        manager.sync_account(&mut ctx, &options).await.unwrap();
        ctx.close().await;
        assert_eq!(labels(&manager, "same@x"), strings(&["\\All", "\\Trash"]));
    }
    assert!(notifier.batches().is_empty());
}

#[tokio::test]
async fn test_search_index_refreshed() {
    let (manager, _) = manager();
    let server = MemoryMailbox::gmail();
    server.append(ALL, message(1, "quarterly@x", None, &[])).unwrap();
    server.append(ALL, message(2, "other@x", None, &[])).unwrap();

    full_sync(&manager, &server).await;
    let hits = manager.db().search(ACCOUNT, "quarterly", 10).unwrap();
    assert_eq!(hits, vec![headers::message_uuid(ACCOUNT, "1")]);
}

// ============================================================================
// Labels
// ============================================================================

#[tokio::test]
async fn test_label_scoping_between_folders() {
    let (manager, _) = manager();
    let server = MemoryMailbox::gmail();
    let uid = server
        .append(ALL, message(1, "m1@x", None, &[]).with_labels(&["Work"]))
        .unwrap();
    server
        .append(TRASH, message(2, "m2@x", None, &[]).with_labels(&["Work"]))
        .unwrap();
    full_sync(&manager, &server).await;
    assert!(labels(&manager, "m2@x").contains(&"Work".to_string()));

    // All Mail no longer has any "Work" message
    server.set_labels(ALL, uid, &[]).unwrap();
    let mut ctx = manager.context(ACCOUNT, Box::new(server.clone()));
    let options = SyncOptions {
        only_labels: Some(strings(&["\\All"])),
        ..Default::default()
    };
    manager.sync_account(&mut ctx, &options).await.unwrap();

    assert_eq!(labels(&manager, "m1@x"), strings(&["\\All"]));
    assert_eq!(labels(&manager, "m2@x"), strings(&["Work", "\\Trash"]));
}

#[tokio::test]
async fn test_flag_changes_reconciled() {
    let (manager, notifier) = manager();
    let server = MemoryMailbox::gmail();
    let uid = server.append(ALL, message(1, "m1@x", None, &[])).unwrap();
    full_sync(&manager, &server).await;
    assert_eq!(labels(&manager, "m1@x"), strings(&["\\All"]));

    server.set_flags(ALL, uid, &["\\Answered"]).unwrap();
    notifier.clear();
    full_sync(&manager, &server).await;
    assert_eq!(
        labels(&manager, "m1@x"),
        strings(&["\\All", "\\Answered", "\\Unread"])
    );
    assert_eq!(notifier.ids(), vec![headers::message_uuid(ACCOUNT, "1")]);
}

#[tokio::test]
async fn test_removed_messages_lose_canonical_label() {
    let (manager, _) = manager();
    let server = MemoryMailbox::gmail();
    server.append(ALL, message(1, "m1@x", None, &[])).unwrap();
    let second = server.append(ALL, message(2, "m2@x", None, &[])).unwrap();
    let trashed = server.append(TRASH, message(3, "m3@x", None, &[])).unwrap();
    full_sync(&manager, &server).await;

    server.remove(ALL, second).unwrap();
    server.remove(TRASH, trashed).unwrap();
    full_sync(&manager, &server).await;

    assert_eq!(labels(&manager, "m1@x"), strings(&["\\All"]));
    assert!(labels(&manager, "m2@x").is_empty());
    assert!(labels(&manager, "m3@x").is_empty());
}

#[tokio::test]
async fn test_labels_only_pass_skips_new_headers() {
    let (manager, _) = manager();
    let server = MemoryMailbox::gmail();
    let uid = server.append(ALL, message(1, "m1@x", None, &[])).unwrap();
    full_sync(&manager, &server).await;

    server.set_labels(ALL, uid, &["\\Starred"]).unwrap();
    server.append(ALL, message(2, "m2@x", None, &[])).unwrap();

    let mut ctx = manager.context(ACCOUNT, Box::new(server.clone()));
    let options = SyncOptions {
        labels_only: true,
        ..Default::default()
    };
    let result = manager.sync_account(&mut ctx, &options).await.unwrap();
    assert!(result.is_success());
    assert_eq!(result.uid_maps[ALL].as_ref().unwrap().len(), 2);
    assert_eq!(labels(&manager, "m1@x"), strings(&["\\All", "\\Starred"]));
    assert!(manager.db().get_email_by_msgid(ACCOUNT, "m2@x").unwrap().is_none());
}

#[tokio::test]
async fn test_label_fetch_failure_keeps_canonical_step() {
    let (manager, notifier) = manager();
    let server = MemoryMailbox::gmail();
    server
        .append(ALL, message(1, "m1@x", None, &[]).with_labels(&["\\Inbox"]))
        .unwrap();
    server.fail_next(FailPoint::FetchLabels);

    let result = full_sync(&manager, &server).await;
    assert_eq!(result.errors.len(), 1);
    assert_eq!(labels(&manager, "m1@x"), strings(&["\\All"]));
    assert_eq!(notifier.ids(), vec![headers::message_uuid(ACCOUNT, "1")]);

    full_sync(&manager, &server).await;
    assert_eq!(labels(&manager, "m1@x"), strings(&["\\All", "\\Inbox"]));
}

#[tokio::test]
async fn test_partial_header_failure_recovers() {
    let notifier = Arc::new(RecordingNotifier::new());
    let settings = SyncSettings {
        batch: 2,
        ..Default::default()
    };
    let manager = SyncManager::new(Database::in_memory().unwrap(), notifier, settings);
    let server = MemoryMailbox::gmail();
    for n in 1..=5 {
        server.append(ALL, message(n, &format!("m{}@x", n), None, &[])).unwrap();
    }
    server.fail_after(FailPoint::FetchHeaders, 1);

    let result = full_sync(&manager, &server).await;
    assert_eq!(result.errors.len(), 1);
    assert_eq!(manager.db().get_emails(ACCOUNT).unwrap().len(), 2);

    let result = full_sync(&manager, &server).await;
    assert!(result.is_success());
    let emails = manager.db().get_emails(ACCOUNT).unwrap();
    assert_eq!(emails.len(), 5);
    assert!(emails.iter().all(|e| e.labels == vec!["\\All".to_string()]));
}

// ============================================================================
// Tasks
// ============================================================================

#[tokio::test]
async fn test_add_task_twice_applies_once() {
    let (manager, _) = manager();
    let server = MemoryMailbox::gmail();
    server.append(ALL, message(1, "m1@x", None, &[])).unwrap();
    full_sync(&manager, &server).await;

    let id = headers::message_uuid(ACCOUNT, "1");
    let task = Task {
        action: TaskAction::Add,
        name: "\\Starred".into(),
        ids: vec![id.clone()],
        thread: false,
    };
    manager.db().queue_task(&task).unwrap();
    manager.db().queue_task(&task).unwrap();

    let touched = manager.process_tasks().await.unwrap();
    assert_eq!(touched, vec![id.clone()]);
    let labels = manager.db().get_email(&id).unwrap().labels;
    assert_eq!(labels.iter().filter(|l| *l == "\\Starred").count(), 1);
}

#[tokio::test]
async fn test_tasks_drained_during_reconciliation() {
    let (manager, notifier) = manager();
    let server = MemoryMailbox::gmail();
    server.append(ALL, message(1, "m1@x", None, &[])).unwrap();
    full_sync(&manager, &server).await;

    let id = headers::message_uuid(ACCOUNT, "1");
    manager
        .db()
        .queue_task(&Task {
            action: TaskAction::Add,
            name: "Later".into(),
            ids: vec![id.clone()],
            thread: false,
        })
        .unwrap();

    notifier.clear();
    full_sync(&manager, &server).await;
    assert_eq!(labels(&manager, "m1@x"), strings(&["Later", "\\All"]));
    assert!(manager.db().pending_tasks().unwrap().is_empty());
    assert_eq!(notifier.ids(), vec![id]);

    // The local label survives later sweeps
    notifier.clear();
    full_sync(&manager, &server).await;
    assert_eq!(labels(&manager, "m1@x"), strings(&["Later", "\\All"]));
    assert!(notifier.batches().is_empty());
}

#[tokio::test]
async fn test_local_edit_outlives_later_passes() {
    let (manager, notifier) = manager();
    let server = MemoryMailbox::gmail();
    let uid = server.append(ALL, message(1, "m1@x", None, &[])).unwrap();
    server.set_flags(ALL, uid, &[]).unwrap();
    full_sync(&manager, &server).await;
    assert_eq!(labels(&manager, "m1@x"), strings(&["\\All", "\\Unread"]));

    let id = headers::message_uuid(ACCOUNT, "1");
    manager
        .db()
        .queue_task(&Task {
            action: TaskAction::Rm,
            name: "\\Unread".into(),
            ids: vec![id.clone()],
            thread: false,
        })
        .unwrap();

    notifier.clear();
    full_sync(&manager, &server).await;
    assert_eq!(labels(&manager, "m1@x"), strings(&["\\All"]));
    assert_eq!(notifier.ids(), vec![id]);

    // The server still reports the message unread
    notifier.clear();
    full_sync(&manager, &server).await;
    assert_eq!(labels(&manager, "m1@x"), strings(&["\\All"]));
    assert!(notifier.batches().is_empty());
}

#[tokio::test]
async fn test_mark_thread_task() {
    let (manager, notifier) = manager();
    let server = MemoryMailbox::gmail();
    server.append(ALL, message(1, "m1@x", None, &[])).unwrap();
    server.append(ALL, message(2, "m2@x", Some("m1@x"), &["m1@x"])).unwrap();
    server.append(ALL, message(3, "m3@x", None, &[])).unwrap();
    full_sync(&manager, &server).await;
    manager.update_threads(ACCOUNT).await.unwrap();

    let root = headers::message_uuid(ACCOUNT, "1");
    notifier.clear();
    let touched = manager
        .mark(
            &Task {
                action: TaskAction::Add,
                name: "Pinned".into(),
                ids: vec![root.clone()],
                thread: true,
            },
            true,
        )
        .await
        .unwrap();
    assert_eq!(touched.len(), 2);
    assert!(labels(&manager, "m2@x").contains(&"Pinned".to_string()));
    assert!(!labels(&manager, "m3@x").contains(&"Pinned".to_string()));
    assert_eq!(notifier.batches().len(), 1);
    assert_eq!(manager.db().all_tasks().unwrap().len(), 1);
}

// ============================================================================
// Bodies and threads
// ============================================================================

#[tokio::test]
async fn test_bodies_pass_reuses_uid_maps() {
    let (manager, _) = manager();
    let server = MemoryMailbox::gmail();
    for n in 1..=3 {
        server.append(ALL, message(n, &format!("m{}@x", n), None, &[])).unwrap();
    }
    let result = full_sync(&manager, &server).await;
    let searches = server.calls(FailPoint::Search);

    let mut ctx = manager.context(ACCOUNT, Box::new(server.clone()));
    let options = SyncOptions {
        bodies: true,
        uid_maps: Some(result.uid_maps),
        ..Default::default()
    };
    let bodies = manager.sync_account(&mut ctx, &options).await.unwrap();
    assert!(bodies.is_success());
    assert_eq!(server.calls(FailPoint::Search), searches);

    let emails = manager.db().get_emails(ACCOUNT).unwrap();
    assert!(emails.iter().all(|e| e.has_raw && e.text.is_some()));
}

#[tokio::test]
async fn test_threads_after_sync() {
    let (manager, _) = manager();
    let server = MemoryMailbox::gmail();
    server.append(ALL, message(1, "m1@x", None, &[])).unwrap();
    server.append(ALL, message(2, "m2@x", Some("m1@x"), &["m1@x"])).unwrap();
    server
        .append(ALL, message(3, "m3@x", Some("m2@x"), &["m1@x", "m2@x"]))
        .unwrap();
    // a reference cycle
    server.append(ALL, message(4, "c1@x", Some("c2@x"), &["c2@x"])).unwrap();
    server.append(ALL, message(5, "c2@x", Some("c1@x"), &["c1@x"])).unwrap();
    full_sync(&manager, &server).await;

    manager.update_threads(ACCOUNT).await.unwrap();

    let thrid = |msgid: &str| {
        manager
            .db()
            .get_email_by_msgid(ACCOUNT, msgid)
            .unwrap()
            .unwrap()
            .thrid
            .unwrap()
    };
    let m1 = headers::message_uuid(ACCOUNT, "1");
    assert_eq!(thrid("m1@x"), m1);
    assert_eq!(thrid("m2@x"), m1);
    assert_eq!(thrid("m3@x"), m1);
    assert_eq!(thrid("c1@x"), thrid("c2@x"));
    assert_eq!(thrid("c1@x"), headers::message_uuid(ACCOUNT, "4"));

    assert!(manager.update_threads(ACCOUNT).await.unwrap().is_empty());
}

// ============================================================================
// Supervisor
// ============================================================================

type ClientFuture = BoxFuture<'static, Result<Box<dyn MailClient>, SyncError>>;

fn fast_timings() -> SupervisorTimings {
    SupervisorTimings {
        idle_timeout: Duration::from_millis(50),
        flags_interval: Duration::from_millis(50),
        backoff: Duration::from_millis(20),
    }
}

fn memory_factory(server: MemoryMailbox) -> ClientFactory {
    Arc::new(move || -> ClientFuture {
        let client: Box<dyn MailClient> = Box::new(server.clone());
        Box::pin(async move { Ok(client) })
    })
}

async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..250 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn test_supervisor_syncs_and_follows_changes() {
    let (manager, _) = manager();
    let server = MemoryMailbox::gmail();
    server.append(ALL, message(1, "m1@x", None, &[])).unwrap();

    let factory = memory_factory(server.clone());
    let supervisor = Supervisor::new(manager.clone(), ACCOUNT, factory, fast_timings());
    supervisor.start().unwrap();
    assert!(matches!(supervisor.start(), Err(SupervisorError::AlreadyRunning)));

    let db = manager.db().clone();
    assert!(
        eventually(|| {
            db.get_email_by_msgid(ACCOUNT, "m1@x")
                .ok()
                .flatten()
                .map(|e| e.has_raw && e.thrid.is_some())
                .unwrap_or(false)
        })
        .await
    );
    assert_eq!(supervisor.state(Job::Remote).await, SupervisorState::Running);

    server.append(ALL, message(2, "m2@x", Some("m1@x"), &["m1@x"])).unwrap();
    server.notify_change();
    assert!(
        eventually(|| {
            db.get_email_by_msgid(ACCOUNT, "m2@x")
                .ok()
                .flatten()
                .and_then(|e| e.thrid)
                .is_some()
        })
        .await
    );

    supervisor.stop().await.unwrap();
    assert_eq!(supervisor.state(Job::Remote).await, SupervisorState::Stopped);
    assert_eq!(supervisor.state(Job::Flags).await, SupervisorState::Stopped);
    assert!(!manager.locks().is_locked(ACCOUNT));
}

#[tokio::test]
async fn test_supervisor_restarts_after_failure() {
    let (manager, _) = manager();
    let server = MemoryMailbox::gmail();
    server.append(ALL, message(1, "m1@x", None, &[])).unwrap();

    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    let inner = server.clone();
    let factory: ClientFactory = Arc::new(move || -> ClientFuture {
        let attempt = counter.fetch_add(1, Ordering::SeqCst);
        let client: Box<dyn MailClient> = Box::new(inner.clone());
        Box::pin(async move {
            if attempt < 2 {
                Err(SyncError::Mail(MailError::Connection("refused".into())))
            } else {
                Ok(client)
            }
        })
    });

    let supervisor = Supervisor::new(manager.clone(), ACCOUNT, factory, fast_timings());
    supervisor.start().unwrap();

    let db = manager.db().clone();
    assert!(eventually(|| db.get_emails(ACCOUNT).map(|e| e.len() == 1).unwrap_or(false)).await);
    assert!(attempts.load(Ordering::SeqCst) >= 3);

    supervisor.stop().await.unwrap();
}

#[tokio::test]
async fn test_supervisor_without_credentials_stops() {
    let (manager, _) = manager();
    let factory: ClientFactory = Arc::new(|| -> ClientFuture {
        Box::pin(async {
            Err(SyncError::Credentials(
                crate::credentials::CredentialsError::CredentialsMissing(ACCOUNT.into()),
            ))
        })
    });

    let supervisor = Supervisor::new(manager, ACCOUNT, factory, fast_timings());
    supervisor.start().unwrap();
    tokio::time::timeout(Duration::from_secs(5), supervisor.join())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(supervisor.state(Job::Remote).await, SupervisorState::Stopped);
    assert!(matches!(supervisor.stop().await, Err(SupervisorError::NotRunning)));
}
