//! Credentials and the TOML secrets store
//!
//! ```toml
//! [database]
//! username = "admin"
//! password = "..."
//! descriptor = "(description=...)"
//! ```

use crate::error::ProbeError;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::path::Path;
use tracing::debug;

pub const DEFAULT_SECRETS_FILE: &str = "secrets.toml";
pub const DEFAULT_SECTION: &str = "database";

/// Username and password pair used for the session handshake
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: SecretString,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<SecretString>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// # Errors
    ///
    /// Returns `InvalidCredentials` if the username or password is empty
    pub fn validate(&self) -> Result<(), ProbeError> {
        if self.username.trim().is_empty() {
            return Err(ProbeError::InvalidCredentials("empty username".to_string()));
        }
        if self.password.expose_secret().is_empty() {
            return Err(ProbeError::InvalidCredentials("empty password".to_string()));
        }
        Ok(())
    }
}

/// One section of the secrets file
#[derive(Debug, Default, Deserialize)]
pub struct SecretSection {
    pub username: Option<String>,
    pub password: Option<SecretString>,
    pub descriptor: Option<String>,
}

impl SecretSection {
    /// Read `section` from a TOML secrets file
    ///
    /// # Errors
    ///
    /// Returns a `Secrets` error if the file is unreadable, malformed or lacks the section
    pub fn load(path: &Path, section: &str) -> Result<Self, ProbeError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ProbeError::Secrets(format!("failed to read {}: {e}", path.display())))?;
        debug!("loaded secrets store {}", path.display());
        Self::from_toml(&content, section)
    }

    /// # Errors
    ///
    /// Returns a `Secrets` error on malformed TOML or a missing section
    pub fn from_toml(content: &str, section: &str) -> Result<Self, ProbeError> {
        let mut table: toml::Table = content
            .parse()
            .map_err(|e| ProbeError::Secrets(format!("malformed secrets store: {e}")))?;

        let value = table
            .remove(section)
            .ok_or_else(|| ProbeError::Secrets(format!("missing section [{section}]")))?;

        value
            .try_into()
            .map_err(|e| ProbeError::Secrets(format!("invalid section [{section}]: {e}")))
    }
}

/// Credential sources, highest precedence first
#[derive(Debug, Default)]
pub struct CredentialSources<'a> {
    pub username: Option<&'a str>,
    pub password: Option<&'a str>,
    pub section: Option<&'a SecretSection>,
    pub descriptor_username: Option<&'a str>,
    pub descriptor_password: Option<&'a SecretString>,
}

impl CredentialSources<'_> {
    /// Pick each field from the first source that provides a non-empty value
    ///
    /// # Errors
    ///
    /// Returns `InvalidCredentials` if no source provides a username or password
    pub fn resolve(&self) -> Result<Credentials, ProbeError> {
        fn non_empty(value: Option<&str>) -> Option<&str> {
            value.filter(|v| !v.is_empty())
        }

        let username = non_empty(self.username)
            .or_else(|| non_empty(self.section.and_then(|s| s.username.as_deref())))
            .or_else(|| non_empty(self.descriptor_username))
            .ok_or_else(|| ProbeError::InvalidCredentials("no username provided".to_string()))?;

        let password = non_empty(self.password)
            .or_else(|| {
                non_empty(
                    self.section
                        .and_then(|s| s.password.as_ref())
                        .map(ExposeSecret::expose_secret),
                )
            })
            .or_else(|| non_empty(self.descriptor_password.map(ExposeSecret::expose_secret)))
            .ok_or_else(|| ProbeError::InvalidCredentials("no password provided".to_string()))?;

        let credentials = Credentials::new(username, password);
        credentials.validate()?;
        Ok(credentials)
    }
}
