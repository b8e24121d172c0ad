//! Per-account mutual exclusion
//!
//! An in-process registry of accounts with a sync in flight. The guard
//! releases its account on drop, so early returns and unwinding panics
//! both free the lock.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum LockError {
    #[error("Sync for {0} is already running")]
    Locked(String),
}

/// Registry shared by every holder of a clone
#[derive(Debug, Clone, Default)]
pub struct AccountLocks {
    held: Arc<Mutex<HashSet<String>>>,
}

impl AccountLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lock for `account`, failing if a guard for it is alive
    pub fn acquire(&self, account: &str) -> Result<AccountGuard, LockError> {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        if !held.insert(account.to_string()) {
            return Err(LockError::Locked(account.to_string()));
        }
        log::debug!("Locked {}", account);
        Ok(AccountGuard {
            account: account.to_string(),
            held: self.held.clone(),
        })
    }

    pub fn is_locked(&self, account: &str) -> bool {
        self.held
            .lock()
            .map(|held| held.contains(account))
            .unwrap_or(true)
    }
}

/// Proof that the account lock is held
#[derive(Debug)]
pub struct AccountGuard {
    account: String,
    held: Arc<Mutex<HashSet<String>>>,
}

impl AccountGuard {
    pub fn account(&self) -> &str {
        &self.account
    }
}

impl Drop for AccountGuard {
    fn drop(&mut self) {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        held.remove(&self.account);
        log::debug!("Unlocked {}", self.account);
    }
}
