use serde::Serialize;
use std::{fmt, path::PathBuf, str::FromStr};

/// TLS configuration for database connections
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsConfig {
    pub mode: TlsMode,
    pub ca: Option<PathBuf>,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    /// Expected server certificate subject, checked instead of the hostname
    pub server_cert_dn: Option<String>,
}

impl TlsConfig {
    /// A CA file turns `require` into `verify-ca`, the way libpq treats `sslrootcert`
    pub fn set_ca(&mut self, ca: PathBuf) {
        if self.mode == TlsMode::Require {
            self.mode = TlsMode::VerifyCA;
        }
        self.ca = Some(ca);
    }

    #[must_use]
    pub const fn has_client_auth(&self) -> bool {
        self.cert.is_some() && self.key.is_some()
    }
}

/// TLS/SSL mode for database connections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum TlsMode {
    /// No TLS encryption
    #[default]
    #[serde(rename = "disable")]
    Disable,
    /// TLS required, but no certificate verification
    #[serde(rename = "require")]
    Require,
    /// Verify server certificate against CA
    #[serde(rename = "verify-ca")]
    VerifyCA,
    /// Verify certificate and hostname
    #[serde(rename = "verify-full")]
    VerifyFull,
}

impl FromStr for TlsMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "disable" | "disabled" => Ok(Self::Disable),
            "require" | "required" => Ok(Self::Require),
            "verify-ca" | "verify_ca" => Ok(Self::VerifyCA),
            "verify-full" | "verify_identity" | "verify-identity" => Ok(Self::VerifyFull),
            _ => Err(format!("Invalid TLS mode: {s}")),
        }
    }
}

impl fmt::Display for TlsMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Disable => "disable",
            Self::Require => "require",
            Self::VerifyCA => "verify-ca",
            Self::VerifyFull => "verify-full",
        })
    }
}

impl TlsMode {
    /// Check if TLS is enabled
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        !matches!(self, Self::Disable)
    }

    /// Check if the certificate chain is validated
    #[must_use]
    pub const fn verifies_chain(&self) -> bool {
        matches!(self, Self::VerifyCA | Self::VerifyFull)
    }
}
