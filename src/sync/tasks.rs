//! Local label mutations

use super::manager::SyncError;
use super::notify::Notifier;
use crate::db::{Database, Task};

/// Drain the task queue, returning the ids it touched
pub async fn process_tasks(db: &Database, notifier: &dyn Notifier) -> Result<Vec<String>, SyncError> {
    let updated = db.process_tasks()?;
    notifier.notify(&updated).await;
    Ok(updated)
}

/// Apply `task` now. A `new` task is also recorded as processed, committed
/// and notified right away.
pub async fn mark(db: &Database, notifier: &dyn Notifier, task: &Task, new: bool) -> Result<Vec<String>, SyncError> {
    let updated = db.mark_task(task, new)?;
    if new {
        notifier.notify(&updated).await;
    }
    Ok(updated)
}
