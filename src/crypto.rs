//! Password encryption for stored credentials
//!
//! AES-256-GCM with an HKDF-derived key. Key material is the machine
//! identity combined with an installation salt kept next to the database.

use base64::Engine;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::hkdf;
use ring::rand::{SecureRandom, SystemRandom};
use std::fs;
use std::path::Path;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const SALT_LEN: usize = 32;
const SALT_FILE: &str = ".encryption_salt";
const KEY_INFO: &[u8] = b"mailmirror-credentials-v1";

/// Crypto error types
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Salt file error: {0}")]
    Salt(#[from] std::io::Error),

    #[error("Insufficient entropy sources for key derivation")]
    Entropy,

    #[error("Key derivation failed")]
    KeyDerivation,

    #[error("Encryption failed")]
    Encrypt,

    #[error("Decryption failed: {0}")]
    Decrypt(String),
}

#[derive(Zeroize, ZeroizeOnDrop)]
struct KeyBytes([u8; 32]);

/// Custom key type for HKDF output
struct KeyLen(usize);

impl hkdf::KeyType for KeyLen {
    fn len(&self) -> usize {
        self.0
    }
}

/// Encrypts and decrypts passwords with an installation-bound key
pub struct PasswordCipher {
    key: KeyBytes,
}

impl PasswordCipher {
    /// Derive the key, creating the salt file under `data_dir` on first use
    pub fn new(data_dir: &Path) -> Result<Self, CryptoError> {
        let salt = get_or_create_salt(&data_dir.join(SALT_FILE))?;
        let machine_id = get_machine_id()?;
        Ok(Self {
            key: derive_key(&salt, machine_id.as_bytes())?,
        })
    }

    fn sealing_key(&self) -> Result<LessSafeKey, CryptoError> {
        let unbound = UnboundKey::new(&AES_256_GCM, &self.key.0).map_err(|_| CryptoError::Encrypt)?;
        Ok(LessSafeKey::new(unbound))
    }

    /// Encrypt a password
    /// Returns base64-encoded ciphertext with prepended nonce
    pub fn encrypt(&self, password: &str) -> Result<String, CryptoError> {
        let key = self.sealing_key()?;

        let rng = SystemRandom::new();
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rng.fill(&mut nonce_bytes).map_err(|_| CryptoError::Encrypt)?;

        let mut in_out = password.as_bytes().to_vec();
        key.seal_in_place_append_tag(
            Nonce::assume_unique_for_key(nonce_bytes),
            Aad::empty(),
            &mut in_out,
        )
        .map_err(|_| CryptoError::Encrypt)?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + in_out.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&in_out);
        Ok(base64::engine::general_purpose::STANDARD.encode(&sealed))
    }

    /// Decrypt a password
    /// Takes base64-encoded ciphertext with prepended nonce
    pub fn decrypt(&self, encrypted: &str) -> Result<String, CryptoError> {
        let data = base64::engine::general_purpose::STANDARD
            .decode(encrypted)
            .map_err(|e| CryptoError::Decrypt(e.to_string()))?;

        if data.len() < NONCE_LEN + TAG_LEN {
            return Err(CryptoError::Decrypt("encrypted data too short".to_string()));
        }

        let key = self.sealing_key()?;
        let (nonce_bytes, ciphertext) = data.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce_bytes)
            .map_err(|_| CryptoError::Decrypt("invalid nonce".to_string()))?;

        let mut in_out = ciphertext.to_vec();
        let plaintext = key
            .open_in_place(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| CryptoError::Decrypt("invalid key or corrupted data".to_string()))?;

        let result = String::from_utf8(plaintext.to_vec())
            .map_err(|e| CryptoError::Decrypt(e.to_string()));
        in_out.zeroize();
        result
    }
}

/// Get or create installation-specific salt
fn get_or_create_salt(salt_path: &Path) -> Result<[u8; SALT_LEN], CryptoError> {
    if salt_path.exists() {
        let salt_data = fs::read(salt_path)?;
        if salt_data.len() == SALT_LEN {
            let mut salt = [0u8; SALT_LEN];
            salt.copy_from_slice(&salt_data);
            return Ok(salt);
        }
        log::warn!("Salt file {:?} has the wrong size, regenerating", salt_path);
    }

    if let Some(parent) = salt_path.parent() {
        fs::create_dir_all(parent)?;
    }

    let rng = SystemRandom::new();
    let mut salt = [0u8; SALT_LEN];
    rng.fill(&mut salt).map_err(|_| CryptoError::KeyDerivation)?;

    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(salt_path)?;
        file.write_all(&salt)?;
    }

    #[cfg(not(unix))]
    {
        fs::write(salt_path, salt)?;
    }

    Ok(salt)
}

/// Machine identity from every available source
fn get_machine_id() -> Result<String, CryptoError> {
    let mut id_parts: Vec<String> = Vec::new();

    #[cfg(target_os = "linux")]
    if let Ok(id) = fs::read_to_string("/etc/machine-id") {
        let trimmed = id.trim();
        if !trimmed.is_empty() {
            id_parts.push(trimmed.to_string());
        }
    }

    if let Ok(hostname) = hostname::get() {
        if let Some(h) = hostname.to_str() {
            if !h.is_empty() {
                id_parts.push(h.to_string());
            }
        }
    }

    #[cfg(unix)]
    if let Ok(user) = std::env::var("USER") {
        if !user.is_empty() {
            id_parts.push(user);
        }
    }
    #[cfg(windows)]
    if let Ok(user) = std::env::var("USERNAME") {
        if !user.is_empty() {
            id_parts.push(user);
        }
    }

    if let Some(home) = directories::BaseDirs::new() {
        id_parts.push(home.home_dir().to_string_lossy().to_string());
    }

    // At least one identity source is required
    if id_parts.is_empty() {
        return Err(CryptoError::Entropy);
    }

    Ok(id_parts.join("|"))
}

fn derive_key(salt: &[u8], ikm: &[u8]) -> Result<KeyBytes, CryptoError> {
    let prk = hkdf::Salt::new(hkdf::HKDF_SHA256, salt).extract(ikm);
    let info: &[&[u8]] = &[KEY_INFO];
    let okm = prk
        .expand(info, KeyLen(32))
        .map_err(|_| CryptoError::KeyDerivation)?;

    let mut key = KeyBytes([0u8; 32]);
    okm.fill(&mut key.0).map_err(|_| CryptoError::KeyDerivation)?;
    Ok(key)
}
