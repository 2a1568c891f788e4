mod run;

use crate::{
    credentials::{CredentialSources, Credentials, SecretSection},
    descriptor::ConnectDescriptor,
    driver::Driver,
    error::ProbeError,
    probe::ValidationQuery,
};
use secrecy::{ExposeSecret, SecretString};
use std::{path::PathBuf, time::Duration};
use tracing::debug;

/// How results are printed on stdout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// Where the descriptor and credentials come from, before resolution
#[derive(Debug, Clone, Default)]
pub struct Connection {
    pub descriptor: Option<String>,
    pub driver: Driver,
    pub secrets: PathBuf,
    /// `--secrets` was given explicitly, so a missing file is an error
    pub secrets_required: bool,
    pub section: String,
    pub username: Option<String>,
    pub password: Option<SecretString>,
    pub tls_ca: Option<PathBuf>,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    pub retry_count: Option<u32>,
    pub retry_delay: Option<Duration>,
    pub connect_timeout: Option<Duration>,
}

impl Connection {
    fn secret_section(&self) -> Result<Option<SecretSection>, ProbeError> {
        if !self.secrets_required && !self.secrets.exists() {
            debug!("no secrets store at {}", self.secrets.display());
            return Ok(None);
        }
        SecretSection::load(&self.secrets, &self.section).map(Some)
    }

    /// Build the descriptor and credentials from every source, CLI and
    /// environment first, then the secrets store, then the descriptor itself
    ///
    /// # Errors
    ///
    /// Returns a `Secrets`, `InvalidDescriptor` or `InvalidCredentials` error
    pub fn resolve(&self) -> Result<(ConnectDescriptor, Credentials), ProbeError> {
        let section = self.secret_section()?;

        let text = self
            .descriptor
            .as_deref()
            .filter(|d| !d.trim().is_empty())
            .or_else(|| section.as_ref().and_then(|s| s.descriptor.as_deref()))
            .ok_or_else(|| {
                ProbeError::InvalidDescriptor(
                    "no descriptor given, use --descriptor or the secrets store".to_string(),
                )
            })?;

        let mut descriptor = ConnectDescriptor::parse(text, self.driver)?.with_tls_files(
            self.tls_ca.clone(),
            self.tls_cert.clone(),
            self.tls_key.clone(),
        );
        if let Some(count) = self.retry_count {
            descriptor.retry.retry_count = count;
        }
        if let Some(delay) = self.retry_delay {
            descriptor.retry.retry_delay = delay;
        }
        if let Some(timeout) = self.connect_timeout {
            descriptor.connect_timeout = timeout;
        }

        let credentials = CredentialSources {
            username: self.username.as_deref(),
            password: self.password.as_ref().map(ExposeSecret::expose_secret),
            section: section.as_ref(),
            descriptor_username: descriptor.username.as_deref(),
            descriptor_password: descriptor.password.as_ref(),
        }
        .resolve()?;

        Ok((descriptor, credentials))
    }
}

/// Action enum representing each possible command
#[derive(Debug)]
pub enum Action {
    Test {
        connection: Connection,
        validation: ValidationQuery,
        format: OutputFormat,
        metrics_file: Option<PathBuf>,
    },
    Query {
        connection: Connection,
        sql: String,
        format: OutputFormat,
    },
    Version {
        connection: Connection,
        format: OutputFormat,
    },
    PublicIp {
        format: OutputFormat,
    },
}

impl Action {
    /// Execute the action, returning the process exit code
    ///
    /// # Errors
    ///
    /// Returns an error if the action fails to execute
    pub async fn execute(self) -> anyhow::Result<i32> {
        run::execute(self).await
    }
}
