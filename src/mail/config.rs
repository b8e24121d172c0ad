//! IMAP Connection Configuration

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Security type for IMAP connections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum SecurityType {
    #[default]
    SSL,
    STARTTLS,
    NONE,
}

impl SecurityType {
    pub fn default_imap_port(&self) -> u16 {
        match self {
            SecurityType::SSL => 993,
            SecurityType::STARTTLS => 143,
            SecurityType::NONE => 143,
        }
    }
}

impl FromStr for SecurityType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "SSL" | "TLS" => Ok(SecurityType::SSL),
            "STARTTLS" => Ok(SecurityType::STARTTLS),
            "NONE" | "PLAIN" => Ok(SecurityType::NONE),
            other => Err(format!("unknown security type {:?}", other)),
        }
    }
}

/// IMAP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImapConfig {
    pub host: String,
    pub port: u16,
    pub security: SecurityType,
    pub username: String,
    #[serde(skip_serializing)]
    pub password: String,
    #[serde(default)]
    pub accept_invalid_certs: bool,
}

impl Default for ImapConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 993,
            security: SecurityType::SSL,
            username: String::new(),
            password: String::new(),
            accept_invalid_certs: false,
        }
    }
}

impl ImapConfig {
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.host.is_empty() {
            errors.push("IMAP host is required".to_string());
        }
        if self.username.is_empty() {
            errors.push("IMAP username is required".to_string());
        }
        if self.port == 0 {
            errors.push("IMAP port must be non-zero".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
