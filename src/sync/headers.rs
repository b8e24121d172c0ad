//! Header ingestion
//!
//! Messages whose msgid is not stored yet get their full header fetched,
//! parsed and inserted. Each fetched chunk commits on its own.

use super::context::SyncContext;
use super::manager::SyncError;
use super::uids::UidMap;
use crate::db::NewEmail;
use crate::mail::{parser, HeaderRow, ParsedMessage};
use serde_json::json;
use uuid::Uuid;

/// Stable id of a message: UUIDv5 of `account \r native_id`
pub fn message_uuid(account: &str, native_id: &str) -> String {
    let name = format!("{}\r{}", account, native_id);
    Uuid::new_v5(&Uuid::NAMESPACE_URL, name.as_bytes()).to_string()
}

fn new_email(account: &str, msgid: &str, row: &HeaderRow) -> Result<NewEmail, SyncError> {
    let id = message_uuid(account, &row.native_id);
    let parsed = parser::parse(&row.header, &id, None).unwrap_or_else(|e| {
        log::warn!("  - unparseable header for {}: {}", msgid, e);
        ParsedMessage::default()
    });

    Ok(NewEmail {
        id,
        account: account.to_string(),
        msgid: msgid.to_string(),
        in_reply_to: parsed.in_reply_to,
        refs: if parsed.references.is_empty() {
            None
        } else {
            Some(parsed.references)
        },
        header: String::from_utf8_lossy(&row.header).into_owned(),
        subj: parsed.subject,
        fr: serde_json::to_value(&parsed.from)?,
        to: serde_json::to_value(&parsed.to)?,
        cc: serde_json::to_value(&parsed.cc)?,
        bcc: serde_json::to_value(&parsed.bcc)?,
        reply_to: serde_json::to_value(&parsed.reply_to)?,
        sender: serde_json::to_value(&parsed.sender)?,
        sender_time: parsed.date,
        size: i64::from(row.size),
        time: row.internal_date.map(|d| d.to_rfc3339()),
        extra: json!({ "X-GM-MSGID": row.native_id }),
    })
}

/// Insert headers of messages in `map` that are not stored yet.
///
/// Returns the ids inserted. The folder must be selected.
pub async fn fetch_headers(ctx: &mut SyncContext, map: &UidMap) -> Result<Vec<String>, SyncError> {
    let msgids: Vec<String> = map.values().cloned().collect();
    let known = ctx.db.known_msgids(&ctx.account, &msgids)?;
    let uids: Vec<u32> = map
        .iter()
        .filter(|(_, msgid)| !known.contains(*msgid))
        .map(|(uid, _)| *uid)
        .collect();
    if uids.is_empty() {
        log::info!("  * No headers to fetch");
        return Ok(Vec::new());
    }

    log::info!("  * Fetch {} headers", uids.len());
    let mut inserted = Vec::new();
    for chunk in uids.chunks(ctx.settings.batch) {
        let rows = ctx.client.fetch_headers(chunk).await?;
        let mut emails = Vec::with_capacity(rows.len());
        for row in &rows {
            if let Some(msgid) = map.get(&row.uid) {
                emails.push(new_email(&ctx.account, msgid, row)?);
            }
        }
        let ids = ctx.db.insert_emails(&emails)?;
        log::debug!("  - add emails with headers: {} of {}", ids.len(), chunk.len());
        inserted.extend(ids);
    }
    log::info!("  * Added {} emails", inserted.len());
    Ok(inserted)
}
