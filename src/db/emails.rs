//! Message rows: header inserts, body updates and lookups

use super::{json_list, Database, DbError, DbResult};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};

/// New message from the header ingestor
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewEmail {
    pub id: String,
    pub account: String,
    pub msgid: String,
    pub in_reply_to: Option<String>,
    pub refs: Option<Vec<String>>,
    pub header: String,
    pub subj: Option<String>,
    pub fr: Value,
    pub to: Value,
    pub cc: Value,
    pub bcc: Value,
    pub reply_to: Value,
    pub sender: Value,
    pub sender_time: Option<String>,
    pub size: i64,
    pub time: Option<String>,
    pub extra: Value,
}

/// Parsed body content written by the body ingestor
#[derive(Debug, Clone, Default)]
pub struct BodyUpdate {
    pub msgid: String,
    pub raw: Vec<u8>,
    pub subj: Option<String>,
    pub fr: Value,
    pub to: Value,
    pub cc: Value,
    pub bcc: Value,
    pub reply_to: Value,
    pub sender: Value,
    pub sender_time: Option<String>,
    pub in_reply_to: Option<String>,
    pub refs: Option<Vec<String>>,
    pub html: Option<String>,
    pub text: Option<String>,
    pub attachments: Value,
    pub embedded: Value,
}

/// Stored message
#[derive(Debug, Clone, Serialize)]
pub struct Email {
    pub id: String,
    pub account: String,
    pub msgid: String,
    pub thrid: Option<String>,
    pub labels: Vec<String>,
    pub in_reply_to: Option<String>,
    pub refs: Vec<String>,
    pub subj: Option<String>,
    pub fr: Value,
    pub html: Option<String>,
    pub text: Option<String>,
    pub size: i64,
    pub time: Option<String>,
    pub extra: Value,
    pub has_raw: bool,
    pub created_at: String,
}

const EMAIL_COLUMNS: &str = "id, account, msgid, thrid, labels, in_reply_to, refs, subj, fr, \
     html, text, size, time, extra, raw IS NOT NULL, created_at";

fn json_value(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Value> {
    let raw: Option<String> = row.get(idx)?;
    match raw {
        Some(s) => serde_json::from_str(&s).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        }),
        None => Ok(Value::Null),
    }
}

fn to_json(value: &Value) -> Option<String> {
    if value.is_null() {
        None
    } else {
        Some(value.to_string())
    }
}

fn refs_json(refs: &Option<Vec<String>>) -> DbResult<Option<String>> {
    match refs {
        Some(list) => Ok(Some(serde_json::to_string(list)?)),
        None => Ok(None),
    }
}

impl Email {
    /// Create Email from database row
    pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Email {
            id: row.get(0)?,
            account: row.get(1)?,
            msgid: row.get(2)?,
            thrid: row.get(3)?,
            labels: json_list(row, 4)?,
            in_reply_to: row.get(5)?,
            refs: json_list(row, 6)?,
            subj: row.get(7)?,
            fr: json_value(row, 8)?,
            html: row.get(9)?,
            text: row.get(10)?,
            size: row.get(11)?,
            time: row.get(12)?,
            extra: json_value(row, 13)?,
            has_raw: row.get(14)?,
            created_at: row.get(15)?,
        })
    }
}

impl Database {
    // =========================================================================
    // EMAIL OPERATIONS
    // =========================================================================

    /// Insert one chunk of new messages in a single transaction.
    ///
    /// Messages whose msgid is already stored for the account are skipped.
    /// Returns the ids that were actually inserted.
    pub fn insert_emails(&self, emails: &[NewEmail]) -> DbResult<Vec<String>> {
        if emails.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;
        let mut inserted = Vec::with_capacity(emails.len());

        {
            let mut stmt = tx.prepare(
                r#"
                INSERT INTO emails (
                    id, account, msgid, in_reply_to, refs, header,
                    subj, fr, "to", cc, bcc, reply_to, sender, sender_time,
                    size, time, extra
                ) VALUES (
                    ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17
                )
                ON CONFLICT DO NOTHING
                RETURNING id
                "#,
            )?;

            for email in emails {
                let refs = refs_json(&email.refs)?;
                let id: Option<String> = stmt
                    .query_row(
                        params![
                            email.id,
                            email.account,
                            email.msgid,
                            email.in_reply_to,
                            refs,
                            email.header,
                            email.subj,
                            to_json(&email.fr),
                            to_json(&email.to),
                            to_json(&email.cc),
                            to_json(&email.bcc),
                            to_json(&email.reply_to),
                            to_json(&email.sender),
                            email.sender_time,
                            email.size,
                            email.time,
                            to_json(&email.extra).unwrap_or_else(|| "{}".to_string()),
                        ],
                        |row| row.get(0),
                    )
                    .optional()?;
                inserted.extend(id);
            }
        }

        tx.commit()?;
        Ok(inserted)
    }

    /// Msgids from `msgids` already stored for the account
    pub fn known_msgids(&self, account: &str, msgids: &[String]) -> DbResult<HashSet<String>> {
        let conn = self.get_conn()?;
        known_msgids(&conn, account, msgids)
    }

    /// `msgid -> size` for stored messages of `msgids` that still lack a body
    pub fn pending_bodies(
        &self,
        account: &str,
        msgids: &[String],
    ) -> DbResult<HashMap<String, i64>> {
        let conn = self.get_conn()?;
        let list = serde_json::to_string(msgids)?;
        let mut stmt = conn.prepare(
            r#"
            SELECT msgid, size FROM emails
            WHERE account = ?1
              AND msgid IN (SELECT value FROM json_each(?2))
              AND raw IS NULL
            "#,
        )?;
        let pairs = stmt
            .query_map(params![account, list], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<HashMap<String, i64>, _>>()?;
        Ok(pairs)
    }

    /// Write parsed bodies by msgid in one transaction, returning updated ids
    pub fn update_bodies(&self, account: &str, items: &[BodyUpdate]) -> DbResult<Vec<String>> {
        if items.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;
        let mut updated = Vec::with_capacity(items.len());

        {
            let mut stmt = tx.prepare(
                r#"
                UPDATE emails SET
                    raw = ?3,
                    subj = ?4, fr = ?5, "to" = ?6, cc = ?7, bcc = ?8,
                    reply_to = ?9, sender = ?10, sender_time = ?11,
                    in_reply_to = ?12, refs = ?13,
                    html = ?14, text = ?15, attachments = ?16, embedded = ?17
                WHERE account = ?1 AND msgid = ?2
                RETURNING id
                "#,
            )?;

            for item in items {
                let refs = refs_json(&item.refs)?;
                let ids = stmt
                    .query_map(
                        params![
                            account,
                            item.msgid,
                            item.raw,
                            item.subj,
                            to_json(&item.fr),
                            to_json(&item.to),
                            to_json(&item.cc),
                            to_json(&item.bcc),
                            to_json(&item.reply_to),
                            to_json(&item.sender),
                            item.sender_time,
                            item.in_reply_to,
                            refs,
                            item.html,
                            item.text,
                            to_json(&item.attachments),
                            to_json(&item.embedded),
                        ],
                        |row| row.get::<_, String>(0),
                    )?
                    .collect::<Result<Vec<_>, _>>()?;
                updated.extend(ids);
            }
        }

        tx.commit()?;
        Ok(updated)
    }

    /// Get a single message by id
    pub fn get_email(&self, id: &str) -> DbResult<Email> {
        let conn = self.get_conn()?;
        let sql = format!("SELECT {} FROM emails WHERE id = ?1", EMAIL_COLUMNS);
        conn.query_row(&sql, [id], Email::from_row)
            .optional()?
            .ok_or_else(|| DbError::NotFound(format!("Email {}", id)))
    }

    /// Get a message by account and msgid
    pub fn get_email_by_msgid(&self, account: &str, msgid: &str) -> DbResult<Option<Email>> {
        let conn = self.get_conn()?;
        let sql = format!(
            "SELECT {} FROM emails WHERE account = ?1 AND msgid = ?2",
            EMAIL_COLUMNS
        );
        Ok(conn
            .query_row(&sql, params![account, msgid], Email::from_row)
            .optional()?)
    }

    /// All messages of an account ordered by internal date
    pub fn get_emails(&self, account: &str) -> DbResult<Vec<Email>> {
        let conn = self.get_conn()?;
        let sql = format!(
            "SELECT {} FROM emails WHERE account = ?1 ORDER BY time, id",
            EMAIL_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let emails = stmt
            .query_map([account], Email::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(emails)
    }
}

pub(super) fn known_msgids(
    conn: &rusqlite::Connection,
    account: &str,
    msgids: &[String],
) -> DbResult<HashSet<String>> {
    if msgids.is_empty() {
        return Ok(HashSet::new());
    }
    let list = serde_json::to_string(msgids)?;
    let mut stmt = conn.prepare(
        r#"
        SELECT msgid FROM emails
        WHERE account = ?1 AND msgid IN (SELECT value FROM json_each(?2))
        "#,
    )?;
    let found = stmt
        .query_map(params![account, list], |row| row.get(0))?
        .collect::<Result<HashSet<String>, _>>()?;
    Ok(found)
}
