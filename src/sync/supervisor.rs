//! Supervisor - long-running sync loops
//!
//! Two jobs per account, each restarted after a fixed backoff when it fails:
//! - remote: full pass, bodies, threads, then IDLE until the next change
//! - flags: periodic labels-only pass
//!
//! Both stop when the cancellation token fires.

use super::lock::LockError;
use super::manager::{SyncError, SyncManager, SyncOptions, SyncResult};
use super::context::SyncContext;
use crate::mail::{IdleEvent, MailClient};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Opens a fresh remote session for the supervised account
pub type ClientFactory =
    Arc<dyn Fn() -> BoxFuture<'static, Result<Box<dyn MailClient>, SyncError>> + Send + Sync>;

/// Lifecycle of one supervised job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Starting,
    Running,
    BackingOff,
    Stopped,
}

/// Supervised loops
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Job {
    Remote,
    Flags,
}

/// Loop timings
#[derive(Debug, Clone, Copy)]
pub struct SupervisorTimings {
    pub idle_timeout: Duration,
    pub flags_interval: Duration,
    pub backoff: Duration,
}

impl Default for SupervisorTimings {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(1200),
            flags_interval: Duration::from_secs(300),
            backoff: Duration::from_secs(10),
        }
    }
}

/// Supervisor errors
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("Supervisor is already running")]
    AlreadyRunning,

    #[error("Supervisor is not running")]
    NotRunning,

    #[error("Job panicked: {0}")]
    Join(String),
}

/// Runs and restarts the sync loops of one account
#[derive(Clone)]
pub struct Supervisor {
    manager: SyncManager,
    account: String,
    factory: ClientFactory,
    timings: SupervisorTimings,
    cancel: CancellationToken,
    states: Arc<RwLock<HashMap<Job, SupervisorState>>>,
    handles: Arc<StdMutex<Vec<JoinHandle<()>>>>,
}

impl Supervisor {
    pub fn new(
        manager: SyncManager,
        account: impl Into<String>,
        factory: ClientFactory,
        timings: SupervisorTimings,
    ) -> Self {
        Self {
            manager,
            account: account.into(),
            factory,
            timings,
            cancel: CancellationToken::new(),
            states: Arc::new(RwLock::new(HashMap::new())),
            handles: Arc::new(StdMutex::new(Vec::new())),
        }
    }

    /// Token that stops every job when cancelled
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn state(&self, job: Job) -> SupervisorState {
        self.states
            .read()
            .await
            .get(&job)
            .copied()
            .unwrap_or(SupervisorState::Stopped)
    }

    async fn set_state(&self, job: Job, state: SupervisorState) {
        log::debug!("{:?} job for {}: {:?}", job, self.account, state);
        self.states.write().await.insert(job, state);
    }

    /// Spawn both jobs
    pub fn start(&self) -> Result<(), SupervisorError> {
        let mut handles = self
            .handles
            .lock()
            .map_err(|e| SupervisorError::Join(e.to_string()))?;
        if !handles.is_empty() {
            return Err(SupervisorError::AlreadyRunning);
        }

        let remote = self.clone();
        handles.push(tokio::spawn(async move {
            remote.supervise(Job::Remote, |s| async move { s.remote().await }).await
        }));
        let flags = self.clone();
        handles.push(tokio::spawn(async move {
            flags.supervise(Job::Flags, |s| async move { s.flags().await }).await
        }));

        log::info!("Supervisor started for {}", self.account);
        Ok(())
    }

    /// Wait for both jobs to finish, without cancelling them
    pub async fn join(&self) -> Result<(), SupervisorError> {
        let handles: Vec<JoinHandle<()>> = {
            let mut guard = self
                .handles
                .lock()
                .map_err(|e| SupervisorError::Join(e.to_string()))?;
            std::mem::take(&mut *guard)
        };
        if handles.is_empty() {
            return Err(SupervisorError::NotRunning);
        }

        let mut first_error = None;
        for handle in handles {
            if let Err(e) = handle.await {
                first_error.get_or_insert(SupervisorError::Join(e.to_string()));
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Cancel both jobs and wait for them
    pub async fn stop(&self) -> Result<(), SupervisorError> {
        self.cancel.cancel();
        let result = self.join().await;
        log::info!("Supervisor stopped for {}", self.account);
        result
    }

    /// Run `job` until it finishes or is cancelled, restarting after a
    /// backoff whenever it fails.
    async fn supervise<F, Fut>(self, job: Job, run: F)
    where
        F: Fn(Supervisor) -> Fut,
        Fut: Future<Output = Result<(), SyncError>>,
    {
        loop {
            self.set_state(job, SupervisorState::Starting).await;
            let outcome = tokio::select! {
                _ = self.cancel.cancelled() => break,
                outcome = run(self.clone()) => outcome,
            };
            match outcome {
                Ok(()) => break,
                Err(e) => {
                    log::error!("{:?} job for {} failed: {}", job, self.account, e);
                    self.set_state(job, SupervisorState::BackingOff).await;
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.timings.backoff) => {}
                    }
                }
            }
        }
        self.set_state(job, SupervisorState::Stopped).await;
    }

    /// Open a session; `None` when the account has no credentials
    async fn connect(&self, job: Job) -> Result<Option<SyncContext>, SyncError> {
        match (self.factory)().await {
            Ok(client) => {
                self.set_state(job, SupervisorState::Running).await;
                Ok(Some(self.manager.context(&self.account, client)))
            }
            Err(e) if e.is_credentials_missing() => {
                log::info!("## no credentials for {}", self.account);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Full pass, bodies for what it found, then threads
    async fn handle_changes(&self, ctx: &mut SyncContext) -> Result<Option<SyncResult>, SyncError> {
        let result = match self.manager.sync_account(ctx, &SyncOptions::default()).await {
            Ok(result) => result,
            Err(SyncError::Lock(e)) => {
                log::warn!("{}", e);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let bodies = SyncOptions {
            bodies: true,
            uid_maps: Some(result.uid_maps.clone()),
            ..Default::default()
        };
        match self.manager.sync_account(ctx, &bodies).await {
            Ok(_) => {}
            Err(SyncError::Lock(e)) => log::warn!("{}", e),
            Err(e) => return Err(e),
        }

        self.manager.update_threads(&self.account).await?;
        Ok(Some(result))
    }

    async fn remote(self) -> Result<(), SyncError> {
        let Some(mut ctx) = self.connect(Job::Remote).await? else {
            return Ok(());
        };
        let result = self.remote_loop(&mut ctx).await;
        ctx.close().await;
        result
    }

    async fn remote_loop(&self, ctx: &mut SyncContext) -> Result<(), SyncError> {
        let mut idle_folder: Option<String> = None;
        loop {
            if let Some(result) = self.handle_changes(ctx).await? {
                if let Some(folder) = result.primary_folder() {
                    idle_folder = Some(folder.to_string());
                }
            }

            match &idle_folder {
                Some(folder) => match ctx.client.idle(folder, self.timings.idle_timeout).await? {
                    IdleEvent::Changed => log::info!("Changes in \"{}\"", folder),
                    IdleEvent::Timeout => log::debug!("Idle timeout on \"{}\"", folder),
                },
                None => tokio::time::sleep(self.timings.idle_timeout).await,
            }
        }
    }

    async fn flags(self) -> Result<(), SyncError> {
        let Some(mut ctx) = self.connect(Job::Flags).await? else {
            return Ok(());
        };
        let result = self.flags_loop(&mut ctx).await;
        ctx.close().await;
        result
    }

    async fn flags_loop(&self, ctx: &mut SyncContext) -> Result<(), SyncError> {
        let options = SyncOptions {
            labels_only: true,
            ..Default::default()
        };
        let mut interval = tokio::time::interval(self.timings.flags_interval);
        loop {
            interval.tick().await;
            match self.manager.sync_account(ctx, &options).await {
                Ok(result) if !result.is_success() => {
                    log::warn!("Flag sync had {} errors: {:?}", result.errors.len(), result.errors)
                }
                Ok(_) => {}
                Err(SyncError::Lock(LockError::Locked(account))) => {
                    log::warn!("Flag sync skipped, {} is busy", account)
                }
                Err(e) => return Err(e),
            }
        }
    }
}
