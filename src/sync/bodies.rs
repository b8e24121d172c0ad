//! Body ingestion
//!
//! Stored messages without a raw body are fetched in chunks bounded by
//! count and by their recorded sizes. Each chunk is parsed and written by a
//! worker; workers run on a semaphore-bounded pool and are all joined
//! before the call returns.

use super::context::SyncContext;
use super::manager::SyncError;
use super::notify::Notifier;
use super::uids::UidMap;
use crate::db::{BodyUpdate, Database};
use crate::mail::parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

/// Split `(uid, size)` pairs into fetch chunks of at most `batch` uids and,
/// unless a single message exceeds it, at most `max_bytes` in total.
pub fn body_chunks(uids: &[(u32, i64)], batch: usize, max_bytes: u64) -> Vec<Vec<u32>> {
    let mut chunks = Vec::new();
    let mut current: Vec<u32> = Vec::new();
    let mut bytes: u64 = 0;
    for &(uid, size) in uids {
        let size = size.max(0) as u64;
        if !current.is_empty() && (current.len() >= batch || bytes + size > max_bytes) {
            chunks.push(std::mem::take(&mut current));
            bytes = 0;
        }
        current.push(uid);
        bytes += size;
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

fn body_update(raw: Vec<u8>, msgid: String, attachments: Option<&Path>) -> Result<BodyUpdate, SyncError> {
    let parsed = parser::parse(&raw, &msgid, attachments)?;
    Ok(BodyUpdate {
        subj: parsed.subject,
        fr: serde_json::to_value(&parsed.from)?,
        to: serde_json::to_value(&parsed.to)?,
        cc: serde_json::to_value(&parsed.cc)?,
        bcc: serde_json::to_value(&parsed.bcc)?,
        reply_to: serde_json::to_value(&parsed.reply_to)?,
        sender: serde_json::to_value(&parsed.sender)?,
        sender_time: parsed.date,
        in_reply_to: parsed.in_reply_to,
        refs: if parsed.references.is_empty() {
            None
        } else {
            Some(parsed.references)
        },
        html: parsed.html,
        text: parsed.text,
        attachments: serde_json::to_value(&parsed.attachments)?,
        embedded: serde_json::to_value(&parsed.embedded)?,
        raw,
        msgid,
    })
}

/// One fetched chunk waiting to be parsed and stored
struct BodyJob {
    db: Database,
    account: String,
    attachments: Option<PathBuf>,
    notifier: Arc<dyn Notifier>,
    items: Vec<(Vec<u8>, String)>,
}

impl BodyJob {
    fn store(self) -> Result<Vec<String>, SyncError> {
        let updates = self
            .items
            .into_iter()
            .map(|(raw, msgid)| body_update(raw, msgid, self.attachments.as_deref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(self.db.update_bodies(&self.account, &updates)?)
    }

    async fn run(self) -> Result<Vec<String>, SyncError> {
        let notifier = self.notifier.clone();
        let ids = tokio::task::spawn_blocking(move || self.store())
            .await
            .map_err(|e| SyncError::Join(e.to_string()))??;
        log::debug!("  - add bodies: {} updated", ids.len());
        notifier.notify(&ids).await;
        Ok(ids)
    }
}

/// Fetch, parse and store bodies for messages of `map` stored without one.
///
/// Returns the ids updated. The folder must be selected.
pub async fn fetch_bodies(ctx: &mut SyncContext, map: &UidMap) -> Result<Vec<String>, SyncError> {
    let msgids: Vec<String> = map.values().cloned().collect();
    let pending = ctx.db.pending_bodies(&ctx.account, &msgids)?;
    let uids: Vec<(u32, i64)> = map
        .iter()
        .filter_map(|(uid, msgid)| pending.get(msgid).map(|size| (*uid, *size)))
        .collect();
    if uids.is_empty() {
        log::info!("  * No bodies to fetch");
        return Ok(Vec::new());
    }

    let chunks = body_chunks(&uids, ctx.settings.batch, ctx.settings.body_batch_bytes);
    log::info!("  * Fetch {} bodies in {} chunks", uids.len(), chunks.len());

    let pool = ctx.settings.pool;
    let semaphore = Arc::new(Semaphore::new(pool.max(1)));
    let mut handles: Vec<JoinHandle<Result<Vec<String>, SyncError>>> = Vec::new();
    let mut updated = Vec::new();
    let mut first_error: Option<SyncError> = None;

    for chunk in chunks {
        let rows = match ctx.client.fetch_bodies(&chunk).await {
            Ok(rows) => rows,
            Err(e) => {
                first_error = Some(e.into());
                break;
            }
        };
        let job = BodyJob {
            db: ctx.db.clone(),
            account: ctx.account.clone(),
            attachments: ctx.settings.attachments.clone(),
            notifier: ctx.notifier.clone(),
            items: rows
                .into_iter()
                .filter_map(|row| map.get(&row.uid).map(|msgid| (row.raw, msgid.clone())))
                .collect(),
        };

        if pool == 0 {
            match job.run().await {
                Ok(ids) => updated.extend(ids),
                Err(e) => {
                    first_error = Some(e);
                    break;
                }
            }
            continue;
        }

        let permit = match semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(e) => {
                first_error = Some(SyncError::Join(e.to_string()));
                break;
            }
        };
        handles.push(tokio::spawn(async move {
            let _permit = permit;
            job.run().await
        }));
    }

    for handle in handles {
        let outcome = match handle.await {
            Ok(outcome) => outcome,
            Err(e) => Err(SyncError::Join(e.to_string())),
        };
        match outcome {
            Ok(ids) => updated.extend(ids),
            Err(e) => {
                log::error!("Body worker failed: {}", e);
                first_error.get_or_insert(e);
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => {
            log::info!("  * Added {} bodies", updated.len());
            Ok(updated)
        }
    }
}
