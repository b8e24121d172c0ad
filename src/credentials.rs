//! Per-account credential store
//!
//! Credentials live in the settings table under `credentials:<account>`,
//! with the password encrypted by [`PasswordCipher`].

use crate::crypto::{CryptoError, PasswordCipher};
use crate::db::{Database, DbError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

#[derive(Error, Debug)]
pub enum CredentialsError {
    #[error("No credentials stored for {0}")]
    CredentialsMissing(String),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

/// Decrypted login for one account
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

#[derive(Serialize, Deserialize)]
struct StoredCredentials {
    username: String,
    password_encrypted: String,
}

fn setting_key(account: &str) -> String {
    format!("credentials:{}", account)
}

/// Encrypted credentials backed by the settings table
pub struct CredentialStore {
    db: Database,
    cipher: PasswordCipher,
}

impl CredentialStore {
    pub fn new(db: Database, data_dir: &Path) -> Result<Self, CredentialsError> {
        Ok(Self {
            db,
            cipher: PasswordCipher::new(data_dir)?,
        })
    }

    pub fn get_credentials(&self, account: &str) -> Result<Credentials, CredentialsError> {
        let stored: StoredCredentials = self
            .db
            .get_setting(&setting_key(account))?
            .ok_or_else(|| CredentialsError::CredentialsMissing(account.to_string()))?;

        Ok(Credentials {
            username: stored.username,
            password: self.cipher.decrypt(&stored.password_encrypted)?,
        })
    }

    pub fn save_credentials(
        &self,
        account: &str,
        username: &str,
        password: &str,
    ) -> Result<(), CredentialsError> {
        let stored = StoredCredentials {
            username: username.to_string(),
            password_encrypted: self.cipher.encrypt(password)?,
        };
        self.db.set_setting(&setting_key(account), &stored)?;
        log::info!("Saved credentials for {}", account);
        Ok(())
    }
}
