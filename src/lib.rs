//! # Mailmirror
//!
//! Mirrors a remote IMAP/Gmail mailbox into a local SQLite store and keeps
//! labels, flags and conversation threads reconciled with it.

pub mod config;
pub mod credentials;
pub mod crypto;
pub mod db;
pub mod mail;
pub mod sync;

use config::{ConfigError, SyncConfig};
use credentials::{CredentialStore, CredentialsError};
use db::{Database, DbError};
use futures::future::BoxFuture;
use mail::{ImapClient, ImapConfig, MailClient};
use std::sync::Arc;
use sync::{
    ClientFactory, HttpNotifier, Supervisor, SupervisorError, SupervisorTimings, SyncError, SyncManager,
};

/// Startup and shutdown failures of the service
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to create data directory: {0}")]
    DataDir(#[from] std::io::Error),

    #[error("Database initialization failed: {0}")]
    Database(#[from] DbError),

    #[error("Credential store error: {0}")]
    Credentials(#[from] CredentialsError),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Supervisor error: {0}")]
    Supervisor(#[from] SupervisorError),
}

/// Opens IMAP sessions with the stored credentials of `account`
fn imap_factory(imap: ImapConfig, account: String, store: Arc<CredentialStore>) -> ClientFactory {
    Arc::new(move || -> BoxFuture<'static, Result<Box<dyn MailClient>, SyncError>> {
        let mut imap = imap.clone();
        let account = account.clone();
        let store = store.clone();
        Box::pin(async move {
            let credentials = store.get_credentials(&account)?;
            imap.username = credentials.username.clone();
            imap.password = credentials.password.clone();
            let client = ImapClient::connect(imap).await?;
            Ok::<Box<dyn MailClient>, SyncError>(Box::new(client))
        })
    })
}

// ============================================================================
// Application Entry Point
// ============================================================================

/// Run the sync service until Ctrl-C
pub async fn run() -> Result<(), AppError> {
    dotenvy::dotenv().ok();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = SyncConfig::from_env()?;
    std::fs::create_dir_all(&config.data_dir)?;
    log::info!("Database path: {:?}", config.db_path);

    let db = Database::new(config.db_path.clone())?;
    log::info!("Database initialized successfully");

    let store = Arc::new(CredentialStore::new(db.clone(), &config.data_dir)?);
    if let Some(password) = &config.password {
        store.save_credentials(&config.account, &config.imap.username, password)?;
    }

    let notifier = Arc::new(HttpNotifier::new(config.notify_url.clone())?);
    let manager = SyncManager::new(db, notifier, config.settings.clone());
    let factory = imap_factory(config.imap.clone(), config.account.clone(), store);
    let timings = SupervisorTimings {
        idle_timeout: config.idle_timeout,
        flags_interval: config.flags_interval,
        backoff: config.backoff,
    };

    let supervisor = Supervisor::new(manager, config.account.clone(), factory, timings);
    supervisor.start()?;

    let cancel = supervisor.cancel_token();
    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                log::error!("Failed to listen for Ctrl-C: {}", e);
            }
            log::info!("Shutting down");
        }
        _ = cancel.cancelled() => {}
    }

    supervisor.stop().await?;
    Ok(())
}
