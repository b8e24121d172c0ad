//! UID → Message-ID resolution for one folder

use super::context::SyncContext;
use super::folders::display_name;
use crate::mail::{parser, MailResult};
use indexmap::IndexMap;

/// Remote UIDs of a folder mapped to their msgids, in fetch order
pub type UidMap = IndexMap<u32, String>;

/// Stand-in msgid for a message without a Message-ID header
pub fn placeholder_msgid(uid: u32, folder: &str) -> String {
    format!("{}.{}@mailmirror.invalid", uid, folder)
}

/// Map every UID of `folder` to its msgid; `None` for an empty folder.
///
/// Leaves `folder` selected.
pub async fn resolve_uids(ctx: &mut SyncContext, folder: &str) -> MailResult<Option<UidMap>> {
    let uids = ctx.client.search(folder).await?;
    log::info!("\"{}\" has {} messages", display_name(folder), uids.len());
    if uids.is_empty() {
        return Ok(None);
    }

    let mut map = UidMap::with_capacity(uids.len());
    let mut placeholders = 0;
    for chunk in uids.chunks(ctx.settings.batch) {
        for row in ctx.client.fetch_msgids(chunk).await? {
            let msgid = parser::message_id(&row.header).unwrap_or_else(|| {
                placeholders += 1;
                placeholder_msgid(row.uid, folder)
            });
            map.insert(row.uid, msgid);
        }
    }
    if placeholders > 0 {
        log::warn!("  * {} messages without Message-ID", placeholders);
    }
    Ok(Some(map))
}
