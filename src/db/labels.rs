//! Label membership statements
//!
//! Every statement is a set difference against a JSON array of msgids and
//! reports the rows it changed through `RETURNING id`.

use super::{emails, json_list, returning_ids, tasks, Database, DbResult};
use rusqlite::{params, Connection};
use std::collections::{BTreeSet, HashMap};

/// Remote membership of one label inside a canonical folder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelMembers {
    pub label: String,
    pub msgids: Vec<String>,
}

/// Ids touched by the scoped phase of a folder reconciliation
#[derive(Debug, Default, Clone)]
pub struct LabelChanges {
    pub labels: Vec<String>,
    pub swept: Vec<String>,
    pub tasks: Vec<String>,
}

impl LabelChanges {
    pub fn touched(&self) -> Vec<String> {
        let mut ids = self.labels.clone();
        ids.extend(self.swept.iter().cloned());
        ids.extend(self.tasks.iter().cloned());
        ids
    }
}

/// Remove `label` from records outside `msgids` that carry it.
fn lose_label(
    conn: &Connection,
    account: &str,
    label: &str,
    msgids: &str,
    scope: Option<&str>,
) -> DbResult<Vec<String>> {
    let sql = format!(
        r#"
        UPDATE emails
        SET labels = (SELECT json_group_array(value) FROM json_each(emails.labels) WHERE value != ?2)
        WHERE account = ?1
          AND msgid NOT IN (SELECT value FROM json_each(?3))
          AND EXISTS (SELECT 1 FROM json_each(emails.labels) WHERE value = ?2)
          {}
        RETURNING id
        "#,
        scope_clause(scope)
    );
    match scope {
        Some(folder) => returning_ids(conn, &sql, params![account, label, msgids, folder]),
        None => returning_ids(conn, &sql, params![account, label, msgids]),
    }
}

/// Add `label` to records in `msgids` that lack it.
fn gain_label(
    conn: &Connection,
    account: &str,
    label: &str,
    msgids: &str,
    scope: Option<&str>,
) -> DbResult<Vec<String>> {
    let sql = format!(
        r#"
        UPDATE emails
        SET labels = json_insert(labels, '$[#]', ?2)
        WHERE account = ?1
          AND msgid IN (SELECT value FROM json_each(?3))
          AND NOT EXISTS (SELECT 1 FROM json_each(emails.labels) WHERE value = ?2)
          {}
        RETURNING id
        "#,
        scope_clause(scope)
    );
    match scope {
        Some(folder) => returning_ids(conn, &sql, params![account, label, msgids, folder]),
        None => returning_ids(conn, &sql, params![account, label, msgids]),
    }
}

fn scope_clause(scope: Option<&str>) -> &'static str {
    if scope.is_some() {
        "AND EXISTS (SELECT 1 FROM json_each(emails.labels) WHERE value = ?4)"
    } else {
        ""
    }
}

/// Bring `label` in line with `msgids`: lose first, then gain.
pub(super) fn update_label(
    conn: &Connection,
    account: &str,
    label: &str,
    msgids: &[String],
    scope: Option<&str>,
) -> DbResult<Vec<String>> {
    let list = serde_json::to_string(msgids)?;
    let mut ids = lose_label(conn, account, label, &list, scope)?;
    let gained = gain_label(conn, account, label, &list, scope)?;
    log::debug!(
        "label {:?}: removed from {}, added to {}",
        label,
        ids.len(),
        gained.len()
    );
    ids.extend(gained);
    Ok(ids)
}

/// Rewrite the labels of records carrying `folder` to the sorted
/// intersection with `allowed`, touching only records whose sorted labels
/// differ from it.
fn sweep_labels(
    conn: &Connection,
    account: &str,
    folder: &str,
    allowed: &BTreeSet<String>,
) -> DbResult<Vec<String>> {
    let rows: Vec<(String, Vec<String>)> = {
        let mut stmt = conn.prepare(
            r#"
            SELECT id, labels FROM emails
            WHERE account = ?1
              AND EXISTS (SELECT 1 FROM json_each(emails.labels) WHERE value = ?2)
            "#,
        )?;
        let rows = stmt
            .query_map(params![account, folder], |row| {
                Ok((row.get(0)?, json_list(row, 1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };

    let mut stmt = conn.prepare("UPDATE emails SET labels = ?2 WHERE id = ?1")?;
    let mut swept = Vec::new();
    for (id, mut current) in rows {
        let kept: BTreeSet<&String> = current.iter().filter(|l| allowed.contains(*l)).collect();
        let kept: Vec<String> = kept.into_iter().cloned().collect();
        current.sort();
        if kept != current {
            stmt.execute(params![id, serde_json::to_string(&kept)?])?;
            swept.push(id);
        }
    }
    Ok(swept)
}

/// Label set of every record carrying `folder`
fn folder_label_sets(
    conn: &Connection,
    account: &str,
    folder: &str,
) -> DbResult<HashMap<String, BTreeSet<String>>> {
    let mut stmt = conn.prepare(
        r#"
        SELECT id, labels FROM emails
        WHERE account = ?1
          AND EXISTS (SELECT 1 FROM json_each(emails.labels) WHERE value = ?2)
        "#,
    )?;
    let sets = stmt
        .query_map(params![account, folder], |row| {
            Ok((row.get(0)?, json_list(row, 1)?.into_iter().collect()))
        })?
        .collect::<Result<HashMap<_, _>, _>>()?;
    Ok(sets)
}

impl Database {
    /// Reconcile the canonical folder label against the remote msgids.
    ///
    /// Commits on its own; returns the ids whose labels changed.
    pub fn sync_folder_label(
        &self,
        account: &str,
        folder: &str,
        msgids: &[String],
    ) -> DbResult<Vec<String>> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;
        let ids = update_label(&tx, account, folder, msgids, None)?;
        tx.commit()?;
        Ok(ids)
    }

    /// Apply remote label membership for records of `folder`, sweep stale
    /// labels and replay the task log, all in one transaction.
    ///
    /// A record of the folder counts as changed only if its label set
    /// differs from the one it had before, so a task undoing the remote
    /// state on every pass reports nothing.
    pub fn apply_folder_labels(
        &self,
        account: &str,
        folder: &str,
        members: &[LabelMembers],
        catalogue: &BTreeSet<String>,
    ) -> DbResult<LabelChanges> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;
        let before = folder_label_sets(&tx, account, folder)?;
        let mut changes = LabelChanges::default();

        for entry in members {
            let ids = update_label(&tx, account, &entry.label, &entry.msgids, Some(folder))?;
            changes.labels.extend(ids);
        }

        let mut allowed = catalogue.clone();
        allowed.insert(folder.to_string());
        allowed.insert("\\Answered".to_string());
        allowed.insert("\\Unread".to_string());
        allowed.extend(tasks::added_labels(&tx)?);
        changes.swept = sweep_labels(&tx, account, folder, &allowed)?;

        changes.tasks = tasks::apply_queued(&tx, true)?;

        let after = folder_label_sets(&tx, account, folder)?;
        let changed = |id: &String| match before.get(id) {
            Some(old) => after.get(id) != Some(old),
            None => true,
        };
        changes.labels.retain(changed);
        changes.swept.retain(changed);
        changes.tasks.retain(changed);

        tx.commit()?;
        Ok(changes)
    }

    /// Subset of `msgids` already stored (the gids of a folder pass)
    pub fn stored_msgids(&self, account: &str, msgids: &[String]) -> DbResult<Vec<String>> {
        let conn = self.get_conn()?;
        let known = emails::known_msgids(&conn, account, msgids)?;
        Ok(msgids.iter().filter(|m| known.contains(*m)).cloned().collect())
    }
}
