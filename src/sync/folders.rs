//! Canonical folder selection
//!
//! Only some folders hold every message exactly once (All Mail, Spam and
//! Trash on Gmail). Those are found by matching folder attributes and names
//! against the configured markers.

use super::context::SyncContext;
use crate::mail::{MailResult, RemoteFolder};

/// Remote folder chosen for the unique-message pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalFolder {
    /// Raw folder name as listed by the server
    pub name: String,
    /// Marker stored on every record of this folder
    pub label: String,
}

/// Folder name decoded from modified UTF-7 for display
pub fn display_name(name: &str) -> String {
    utf7_imap::decode_utf7_imap(name.to_string())
}

/// Pick the folders whose attributes or name match a marker in `labels`.
///
/// A folder carrying several markers gets the first one in `labels` order.
pub fn select_canonical(folders: &[RemoteFolder], labels: &[String]) -> Vec<CanonicalFolder> {
    folders
        .iter()
        .filter_map(|folder| {
            let label = labels.iter().find(|marker| {
                folder.name == **marker || folder.attrs.iter().any(|a| a == *marker)
            })?;
            Some(CanonicalFolder {
                name: folder.name.clone(),
                label: label.clone(),
            })
        })
        .collect()
}

/// List remote folders and keep the canonical ones
pub async fn canonical_folders(
    ctx: &mut SyncContext,
    labels: &[String],
) -> MailResult<Vec<CanonicalFolder>> {
    let folders = ctx.client.folders().await?;
    let selected = select_canonical(&folders, labels);
    log::info!(
        "{} folders, canonical: {:?}",
        folders.len(),
        selected
            .iter()
            .map(|f| format!("{} ({})", display_name(&f.name), f.label))
            .collect::<Vec<_>>()
    );
    Ok(selected)
}
