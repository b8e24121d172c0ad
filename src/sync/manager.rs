//! Sync Manager - Orchestrates one account's reconciliation
//!
//! Runs the stages in order under the account lock:
//! - Canonical folder enumeration
//! - Per folder: UID resolution, then headers and labels (or bodies)
//! - Search index refresh
//!
//! Threading and task draining are separate entry points.

use super::bodies::fetch_bodies;
use super::context::SyncContext;
use super::folders::{canonical_folders, display_name, CanonicalFolder};
use super::headers::fetch_headers;
use super::labels::fetch_labels;
use super::lock::{AccountLocks, LockError};
use super::notify::Notifier;
use super::uids::{resolve_uids, UidMap};
use super::{tasks, threads};
use crate::config::SyncSettings;
use crate::credentials::CredentialsError;
use crate::db::{Database, DbError, Task};
use crate::mail::{MailClient, MailError};
use indexmap::IndexMap;
use std::sync::Arc;

/// What a sync run does
#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    /// Fetch bodies instead of headers and labels
    pub bodies: bool,
    /// Skip header ingestion and only reconcile labels
    pub labels_only: bool,
    /// Canonical markers to use instead of the configured ones
    pub only_labels: Option<Vec<String>>,
    /// UID maps of an earlier run, keyed by folder; skips UID resolution
    pub uid_maps: Option<IndexMap<String, Option<UidMap>>>,
}

/// Outcome of one sync run
#[derive(Debug, Clone, Default)]
pub struct SyncResult {
    /// UID map of every canonical folder, reusable by a later run
    pub uid_maps: IndexMap<String, Option<UidMap>>,
    /// Folders that failed, with the reason
    pub errors: Vec<String>,
}

impl SyncResult {
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }

    /// First folder that had messages, the natural idle target
    pub fn primary_folder(&self) -> Option<&str> {
        self.uid_maps
            .iter()
            .find(|(_, map)| map.is_some())
            .or_else(|| self.uid_maps.first())
            .map(|(name, _)| name.as_str())
    }
}

/// Sync manager - main orchestrator
#[derive(Clone)]
pub struct SyncManager {
    db: Database,
    locks: AccountLocks,
    notifier: Arc<dyn Notifier>,
    settings: SyncSettings,
}

impl SyncManager {
    pub fn new(db: Database, notifier: Arc<dyn Notifier>, settings: SyncSettings) -> Self {
        Self {
            db,
            locks: AccountLocks::new(),
            notifier,
            settings,
        }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn locks(&self) -> &AccountLocks {
        &self.locks
    }

    pub fn notifier(&self) -> Arc<dyn Notifier> {
        self.notifier.clone()
    }

    /// Context for a run over `client`
    pub fn context(&self, account: &str, client: Box<dyn MailClient>) -> SyncContext {
        SyncContext::new(
            account,
            self.db.clone(),
            client,
            self.notifier.clone(),
            self.settings.clone(),
        )
    }

    // ========================================================================
    // Remote sync
    // ========================================================================

    /// Run one pass over the canonical folders of `ctx.account`.
    ///
    /// A failing folder is recorded in the result and the run moves on;
    /// a failure to list folders aborts the run.
    pub async fn sync_account(
        &self,
        ctx: &mut SyncContext,
        options: &SyncOptions,
    ) -> Result<SyncResult, SyncError> {
        let _guard = self.locks.acquire(&ctx.account)?;
        log::info!("Sync {} (bodies: {})", ctx.account, options.bodies);

        let labels = options
            .only_labels
            .clone()
            .unwrap_or_else(|| ctx.settings.labels.clone());
        let folders = canonical_folders(ctx, &labels).await?;

        let mut result = SyncResult::default();
        for folder in folders {
            match self.sync_folder(ctx, &folder, &labels, options).await {
                Ok(map) => {
                    result.uid_maps.insert(folder.name.clone(), map);
                }
                Err(e) => {
                    log::error!("\"{}\" failed: {}", display_name(&folder.name), e);
                    result
                        .errors
                        .push(format!("{}: {}", display_name(&folder.name), e));
                }
            }
        }

        self.db.refresh_search_index()?;
        log::info!(
            "Sync {} done: {} folders, {} errors",
            ctx.account,
            result.uid_maps.len(),
            result.errors.len()
        );
        Ok(result)
    }

    async fn sync_folder(
        &self,
        ctx: &mut SyncContext,
        folder: &CanonicalFolder,
        markers: &[String],
        options: &SyncOptions,
    ) -> Result<Option<UidMap>, SyncError> {
        let map = match &options.uid_maps {
            Some(maps) => {
                let status = ctx.client.select(&folder.name).await?;
                log::info!(
                    "\"{}\" has {} messages",
                    display_name(&folder.name),
                    status.exists
                );
                maps.get(&folder.name).cloned().flatten()
            }
            None => resolve_uids(ctx, &folder.name).await?,
        };

        let Some(map) = map else {
            if !options.bodies {
                // Nothing left remotely, so nothing may keep the marker
                let ids = ctx.db.sync_folder_label(&ctx.account, &folder.label, &[])?;
                ctx.notifier.notify(&ids).await;
            }
            return Ok(None);
        };

        if options.bodies {
            fetch_bodies(ctx, &map).await?;
        } else {
            if !options.labels_only {
                fetch_headers(ctx, &map).await?;
            }
            fetch_labels(ctx, &map, folder, markers).await?;
        }
        Ok(Some(map))
    }

    // ========================================================================
    // Local passes
    // ========================================================================

    /// Assign thread ids to every message of `account`
    pub async fn update_threads(&self, account: &str) -> Result<Vec<String>, SyncError> {
        log::info!("Update threads for {}", account);
        threads::update_threads(&self.db, account, self.notifier.as_ref()).await
    }

    /// Drain queued label tasks
    pub async fn process_tasks(&self) -> Result<Vec<String>, SyncError> {
        tasks::process_tasks(&self.db, self.notifier.as_ref()).await
    }

    /// Apply a task immediately; see [`tasks::mark`]
    pub async fn mark(&self, task: &Task, new: bool) -> Result<Vec<String>, SyncError> {
        tasks::mark(&self.db, self.notifier.as_ref(), task, new).await
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Mail error: {0}")]
    Mail(#[from] MailError),

    #[error("Credentials error: {0}")]
    Credentials(#[from] CredentialsError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Worker failed: {0}")]
    Join(String),
}

impl SyncError {
    /// Missing credentials mean there is nothing to sync, not a failure
    pub fn is_credentials_missing(&self) -> bool {
        matches!(
            self,
            SyncError::Credentials(CredentialsError::CredentialsMissing(_))
        )
    }
}
