//! Thread id assignment passes

use super::{json_list, returning_ids, Database, DbResult};
use rusqlite::{params, Connection};
use std::collections::HashMap;

const ROOTS_SQL: &str = r#"
UPDATE emails SET thrid = id
WHERE account = ?1 AND thrid IS NULL
  AND (in_reply_to IS NULL
       OR in_reply_to NOT IN (SELECT msgid FROM emails WHERE account = ?1))
  AND (refs IS NULL
       OR NOT EXISTS (
         SELECT 1 FROM json_each(emails.refs) r
         JOIN emails k ON k.account = ?1 AND k.msgid = r.value))
RETURNING id
"#;

const DIRECT_SQL: &str = r#"
UPDATE emails SET thrid = COALESCE(
  (SELECT t.thrid FROM emails t
   WHERE t.account = emails.account AND t.thrid IS NOT NULL
     AND t.msgid = emails.in_reply_to
   LIMIT 1),
  (SELECT t.thrid FROM emails t
   WHERE t.account = emails.account AND t.thrid IS NOT NULL
     AND t.msgid IN (SELECT value FROM json_each(emails.refs))
   LIMIT 1))
WHERE account = ?1 AND thrid IS NULL
  AND EXISTS (
    SELECT 1 FROM emails t
    WHERE t.account = emails.account AND t.thrid IS NOT NULL
      AND (t.msgid = emails.in_reply_to
           OR t.msgid IN (SELECT value FROM json_each(emails.refs))))
RETURNING id
"#;

const CLOSURE_SQL: &str = r#"
WITH RECURSIVE
  edges(child, parent) AS (
    SELECT id, in_reply_to FROM emails
    WHERE account = ?1 AND thrid IS NULL AND in_reply_to IS NOT NULL
    UNION
    SELECT e.id, r.value FROM emails e, json_each(e.refs) r
    WHERE e.account = ?1 AND e.thrid IS NULL
  ),
  thrids(id, msgid, thrid) AS (
    SELECT id, msgid, thrid FROM emails
    WHERE account = ?1 AND thrid IS NOT NULL
    UNION
    SELECT e.id, e.msgid, t.thrid
    FROM thrids t
    JOIN edges g ON g.parent = t.msgid
    JOIN emails e ON e.id = g.child
  )
UPDATE emails SET thrid = (SELECT MIN(t.thrid) FROM thrids t WHERE t.id = emails.id)
WHERE account = ?1 AND thrid IS NULL
  AND id IN (SELECT id FROM thrids)
RETURNING id
"#;

fn run_pass(conn: &Connection, sql: &str, account: &str) -> DbResult<Vec<String>> {
    returning_ids(conn, sql, [account])
}

/// Outcome of the fallback pass
#[derive(Debug, Default, Clone)]
pub struct FallbackThreads {
    /// Messages promoted to roots because nothing else resolved them
    pub roots: Vec<String>,
    /// Messages placed in the thread of a promoted root
    pub attached: Vec<String>,
}

impl Database {
    /// Pass 1: messages referencing nothing known become their own root
    pub fn thread_roots(&self, account: &str) -> DbResult<Vec<String>> {
        let conn = self.get_conn()?;
        run_pass(&conn, ROOTS_SQL, account)
    }

    /// Pass 2: inherit the thread of a directly referenced resolved message
    pub fn thread_direct(&self, account: &str) -> DbResult<Vec<String>> {
        let conn = self.get_conn()?;
        run_pass(&conn, DIRECT_SQL, account)
    }

    /// Pass 3: transitive closure over the reference graph
    pub fn thread_closure(&self, account: &str) -> DbResult<Vec<String>> {
        let conn = self.get_conn()?;
        run_pass(&conn, CLOSURE_SQL, account)
    }

    /// Pass 4: group the remaining messages into components connected by
    /// references in either direction; the earliest message of each
    /// component becomes the root of all of it.
    pub fn thread_fallback(&self, account: &str) -> DbResult<FallbackThreads> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;

        let rows: Vec<(String, String, Option<String>, Vec<String>)> = {
            let mut stmt = tx.prepare(
                r#"
                SELECT id, msgid, in_reply_to, refs FROM emails
                WHERE account = ?1 AND thrid IS NULL
                ORDER BY time, created_at, id
                "#,
            )?;
            let rows = stmt
                .query_map([account], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?, json_list(row, 3)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        let mut by_msgid: HashMap<&str, Vec<usize>> = HashMap::new();
        for (i, (_, msgid, _, _)) in rows.iter().enumerate() {
            by_msgid.entry(msgid.as_str()).or_default().push(i);
        }
        let mut components = Components::new(rows.len());
        for (i, (_, _, in_reply_to, refs)) in rows.iter().enumerate() {
            for target in in_reply_to.iter().chain(refs.iter()) {
                for &j in by_msgid.get(target.as_str()).into_iter().flatten() {
                    components.join(i, j);
                }
            }
        }

        let mut result = FallbackThreads::default();
        {
            let mut stmt = tx.prepare("UPDATE emails SET thrid = ?2 WHERE id = ?1")?;
            for (i, (id, _, _, _)) in rows.iter().enumerate() {
                let root = components.find(i);
                stmt.execute(params![id, rows[root].0])?;
                if root == i {
                    result.roots.push(id.clone());
                } else {
                    result.attached.push(id.clone());
                }
            }
        }

        tx.commit()?;
        Ok(result)
    }
}

/// Disjoint sets over row positions; a set is represented by its lowest
/// position, which is its earliest message.
struct Components {
    parent: Vec<usize>,
}

impl Components {
    fn new(len: usize) -> Self {
        Self {
            parent: (0..len).collect(),
        }
    }

    fn find(&mut self, mut i: usize) -> usize {
        while self.parent[i] != i {
            self.parent[i] = self.parent[self.parent[i]];
            i = self.parent[i];
        }
        i
    }

    fn join(&mut self, a: usize, b: usize) {
        let (a, b) = (self.find(a), self.find(b));
        if a != b {
            self.parent[a.max(b)] = a.min(b);
        }
    }
}
