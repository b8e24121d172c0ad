//! Durable queue of local label mutations
//!
//! Tasks are kept as a log: draining marks them processed instead of
//! deleting them, and folder reconciliation replays the whole log so a local
//! edit outlives remote state that has not caught up with it.

use super::{returning_ids, Database, DbError, DbResult};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

const QUEUE_NAME: &str = "sync";

/// Label mutation direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskAction {
    Add,
    Rm,
}

/// Local label edit: `ids` are message ids, or thread ids when `thread` is set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub action: TaskAction,
    pub name: String,
    pub ids: Vec<String>,
    #[serde(default)]
    pub thread: bool,
}

/// Task as stored in the queue
#[derive(Debug, Clone, Serialize)]
pub struct TaskRecord {
    pub id: i64,
    pub task: Task,
    pub created: String,
    pub processed_at: Option<String>,
}

/// Apply one task with membership guards, returning the ids it changed.
pub(super) fn apply_task(conn: &Connection, task: &Task) -> DbResult<Vec<String>> {
    let target = if task.thread {
        "thrid IN (SELECT value FROM json_each(?2))"
    } else {
        "id IN (SELECT value FROM json_each(?2))"
    };
    let sql = match task.action {
        TaskAction::Rm => format!(
            r#"
            UPDATE emails
            SET labels = (SELECT json_group_array(value) FROM json_each(emails.labels) WHERE value != ?1)
            WHERE {}
              AND EXISTS (SELECT 1 FROM json_each(emails.labels) WHERE value = ?1)
            RETURNING id
            "#,
            target
        ),
        TaskAction::Add => format!(
            r#"
            UPDATE emails
            SET labels = json_insert(labels, '$[#]', ?1)
            WHERE {}
              AND NOT EXISTS (SELECT 1 FROM json_each(emails.labels) WHERE value = ?1)
            RETURNING id
            "#,
            target
        ),
    };
    let ids = serde_json::to_string(&task.ids)?;
    returning_ids(conn, &sql, params![task.name, ids])
}

/// Apply queued tasks in creation order, marking pending ones processed.
///
/// With `replay` every task in the log is applied again; the membership
/// guards make that a no-op unless something reverted its effect.
pub(super) fn apply_queued(conn: &Connection, replay: bool) -> DbResult<Vec<String>> {
    let tasks: Vec<(i64, String, bool)> = {
        let mut stmt = conn.prepare(&format!(
            r#"
            SELECT id, data, processed_at IS NULL FROM tasks
            WHERE name = ?1 {}
            ORDER BY created, id
            "#,
            if replay { "" } else { "AND processed_at IS NULL" }
        ))?;
        let rows = stmt
            .query_map([QUEUE_NAME], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };

    log::info!("  * Process {} tasks", tasks.len());
    let mut updated = Vec::new();
    for (id, data, pending) in tasks {
        match serde_json::from_str::<Task>(&data) {
            Ok(task) => {
                let ids = apply_task(conn, &task)?;
                log::info!("  - done {} ({} emails)", data, ids.len());
                updated.extend(ids);
            }
            Err(e) if pending => log::warn!("  - skip malformed task {}: {}", id, e),
            Err(_) => {}
        }
        if pending {
            conn.execute(
                "UPDATE tasks SET processed_at = strftime('%Y-%m-%d %H:%M:%f', 'now') WHERE id = ?1",
                [id],
            )?;
        }
    }
    Ok(updated)
}

/// Labels named by any `add` task, kept through the integrity sweep
pub(super) fn added_labels(conn: &Connection) -> DbResult<BTreeSet<String>> {
    let mut stmt = conn.prepare(
        r#"
        SELECT DISTINCT json_extract(data, '$.name') FROM tasks
        WHERE name = ?1 AND json_extract(data, '$.action') = 'add'
        "#,
    )?;
    let labels = stmt
        .query_map([QUEUE_NAME], |row| row.get::<_, Option<String>>(0))?
        .filter_map(|r| r.transpose())
        .collect::<Result<BTreeSet<String>, _>>()?;
    Ok(labels)
}

fn insert_task(conn: &Connection, task: &Task, processed: bool) -> DbResult<i64> {
    let data = serde_json::to_string(task)?;
    let sql = if processed {
        "INSERT INTO tasks (name, data, processed_at)
         VALUES (?1, ?2, strftime('%Y-%m-%d %H:%M:%f', 'now'))"
    } else {
        "INSERT INTO tasks (name, data) VALUES (?1, ?2)"
    };
    conn.execute(sql, params![QUEUE_NAME, data])?;
    Ok(conn.last_insert_rowid())
}

fn task_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(i64, String, String, Option<String>)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

impl Database {
    /// Queue a task for the next drain
    pub fn queue_task(&self, task: &Task) -> DbResult<i64> {
        let conn = self.get_conn()?;
        insert_task(&conn, task, false)
    }

    /// Pending tasks in drain order
    pub fn pending_tasks(&self) -> DbResult<Vec<TaskRecord>> {
        self.list_tasks("AND processed_at IS NULL")
    }

    /// Every task, processed or not, in creation order
    pub fn all_tasks(&self) -> DbResult<Vec<TaskRecord>> {
        self.list_tasks("")
    }

    fn list_tasks(&self, filter: &str) -> DbResult<Vec<TaskRecord>> {
        let conn = self.get_conn()?;
        let sql = format!(
            "SELECT id, data, created, processed_at FROM tasks
             WHERE name = ?1 {} ORDER BY created, id",
            filter
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([QUEUE_NAME], task_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(id, data, created, processed_at)| {
                Ok(TaskRecord {
                    id,
                    task: serde_json::from_str(&data)?,
                    created,
                    processed_at,
                })
            })
            .collect()
    }

    /// Drain pending tasks in one transaction, returning touched ids
    pub fn process_tasks(&self) -> DbResult<Vec<String>> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;
        let updated = apply_queued(&tx, false)?;
        tx.commit()?;
        Ok(updated)
    }

    /// Apply one task now; with `new` the task is also recorded as processed.
    pub fn mark_task(&self, task: &Task, new: bool) -> DbResult<Vec<String>> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;
        let updated = apply_task(&tx, task)?;
        if new {
            insert_task(&tx, task, true)?;
        }
        tx.commit()?;
        Ok(updated)
    }

    /// Look up a stored task
    pub fn get_task(&self, id: i64) -> DbResult<TaskRecord> {
        let conn = self.get_conn()?;
        let row = conn
            .query_row(
                "SELECT id, data, created, processed_at FROM tasks WHERE id = ?1",
                [id],
                task_from_row,
            )
            .optional()?
            .ok_or_else(|| DbError::NotFound(format!("Task {}", id)))?;
        Ok(TaskRecord {
            id: row.0,
            task: serde_json::from_str(&row.1)?,
            created: row.2,
            processed_at: row.3,
        })
    }
}
