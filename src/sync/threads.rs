//! Conversation threading
//!
//! Four passes, each committed and notified on its own: roots, direct
//! replies, the transitive closure, and a fallback for whatever the graph
//! leaves unresolved (reference cycles, replies to missing messages).

use super::manager::SyncError;
use super::notify::Notifier;
use crate::db::Database;

/// Give every message of `account` a thread id, returning touched ids
pub async fn update_threads(
    db: &Database,
    account: &str,
    notifier: &dyn Notifier,
) -> Result<Vec<String>, SyncError> {
    let mut updated = Vec::new();

    let roots = db.thread_roots(account)?;
    log::info!("  * Thread roots: {}", roots.len());
    notifier.notify(&roots).await;
    updated.extend(roots);

    let direct = db.thread_direct(account)?;
    log::info!("  * Direct replies: {}", direct.len());
    notifier.notify(&direct).await;
    updated.extend(direct);

    let closure = db.thread_closure(account)?;
    log::info!("  * Reference closure: {}", closure.len());
    notifier.notify(&closure).await;
    updated.extend(closure);

    let fallback = db.thread_fallback(account)?;
    if !fallback.roots.is_empty() {
        log::warn!(
            "  * Fallback roots for {}: {:?} (attached {:?})",
            account,
            fallback.roots,
            fallback.attached
        );
    }
    let mut ids = fallback.roots;
    ids.extend(fallback.attached);
    notifier.notify(&ids).await;
    updated.extend(ids);

    Ok(updated)
}
