//! Per-invocation sync context

use super::notify::Notifier;
use crate::config::SyncSettings;
use crate::db::Database;
use crate::mail::MailClient;
use std::sync::Arc;

/// Everything one sync invocation works with: the store, the remote
/// session, the change sink and the run settings.
pub struct SyncContext {
    pub account: String,
    pub db: Database,
    pub client: Box<dyn MailClient>,
    pub notifier: Arc<dyn Notifier>,
    pub settings: SyncSettings,
}

impl SyncContext {
    pub fn new(
        account: impl Into<String>,
        db: Database,
        client: Box<dyn MailClient>,
        notifier: Arc<dyn Notifier>,
        settings: SyncSettings,
    ) -> Self {
        Self {
            account: account.into(),
            db,
            client,
            notifier,
            settings,
        }
    }

    /// End the remote session
    pub async fn close(mut self) {
        if let Err(e) = self.client.logout().await {
            log::warn!("Logout for {} failed: {}", self.account, e);
        }
    }
}
