//! Label/flag reconciliation for one canonical folder

use super::context::SyncContext;
use super::folders::{display_name, CanonicalFolder};
use super::manager::SyncError;
use super::uids::UidMap;
use crate::db::LabelMembers;
use crate::mail::LabelRow;
use std::collections::{BTreeSet, HashSet};

pub const ANSWERED: &str = "\\Answered";
pub const UNREAD: &str = "\\Unread";
const SEEN: &str = "\\Seen";

/// Membership of every remote label plus the synthesized flag labels, and
/// the catalogue of decoded remote label names.
pub fn label_members(map: &UidMap, rows: &[LabelRow]) -> (Vec<LabelMembers>, BTreeSet<String>) {
    let raw_labels: BTreeSet<&String> = rows.iter().flat_map(|r| r.labels.iter()).collect();
    let flags: BTreeSet<&String> = rows.iter().flat_map(|r| r.flags.iter()).collect();
    log::info!("  * Unique labels {:?}", raw_labels);
    log::info!("  * Unique flags {:?}", flags);

    let members_where = |pred: &dyn Fn(&LabelRow) -> bool| -> Vec<String> {
        rows.iter()
            .filter(|row| pred(row))
            .filter_map(|row| map.get(&row.uid).cloned())
            .collect()
    };

    let mut catalogue = BTreeSet::new();
    let mut members = Vec::new();
    for raw in raw_labels {
        let label = display_name(raw);
        catalogue.insert(label.clone());
        members.push(LabelMembers {
            label,
            msgids: members_where(&|row: &LabelRow| row.labels.contains(raw)),
        });
    }
    members.push(LabelMembers {
        label: ANSWERED.to_string(),
        msgids: members_where(&|row: &LabelRow| row.flags.iter().any(|f| f == ANSWERED)),
    });
    members.push(LabelMembers {
        label: UNREAD.to_string(),
        msgids: members_where(&|row: &LabelRow| !row.flags.iter().any(|f| f == SEEN)),
    });
    (members, catalogue)
}

/// Reconcile labels and flags of `folder` against the remote state.
///
/// `markers` are the canonical folder markers of this run; the sweep leaves
/// them to their own folders. The canonical label is committed first; remote labels, the integrity
/// sweep and the task drain then commit together. Every touched id is
/// notified, including those of the first step when the rest fails.
pub async fn fetch_labels(
    ctx: &mut SyncContext,
    map: &UidMap,
    folder: &CanonicalFolder,
    markers: &[String],
) -> Result<Vec<String>, SyncError> {
    let msgids: Vec<String> = map.values().cloned().collect();
    let gids = ctx.db.stored_msgids(&ctx.account, &msgids)?;
    let mut updated = ctx.db.sync_folder_label(&ctx.account, &folder.label, &gids)?;
    log::info!("  * {} emails changed {}", updated.len(), folder.label);

    if gids.is_empty() {
        log::info!("  - no labels to update");
        ctx.notifier.notify(&updated).await;
        return Ok(updated);
    }

    match reconcile(ctx, map, folder, markers, &gids).await {
        Ok(ids) => {
            updated.extend(ids);
            ctx.notifier.notify(&updated).await;
            Ok(updated)
        }
        Err(e) => {
            ctx.notifier.notify(&updated).await;
            Err(e)
        }
    }
}

async fn reconcile(
    ctx: &mut SyncContext,
    map: &UidMap,
    folder: &CanonicalFolder,
    markers: &[String],
    gids: &[String],
) -> Result<Vec<String>, SyncError> {
    let stored: HashSet<&String> = gids.iter().collect();
    let uids: Vec<u32> = map
        .iter()
        .filter(|(_, msgid)| stored.contains(msgid))
        .map(|(uid, _)| *uid)
        .collect();

    let mut rows = Vec::with_capacity(uids.len());
    for chunk in uids.chunks(ctx.settings.batch) {
        rows.extend(ctx.client.fetch_labels(chunk).await?);
    }

    let (members, mut keep) = label_members(map, &rows);
    keep.extend(markers.iter().cloned());
    let changes = ctx
        .db
        .apply_folder_labels(&ctx.account, &folder.label, &members, &keep)?;
    log::info!(
        "  * Labels changed on {} emails, cleaned {}, tasks touched {}",
        changes.labels.len(),
        changes.swept.len(),
        changes.tasks.len()
    );
    Ok(changes.touched())
}
