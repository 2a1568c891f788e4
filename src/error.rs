use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Failure categories surfaced to the operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidDescriptor,
    InvalidCredentials,
    Secrets,
    Network,
    Tls,
    Authentication,
    ServiceNotFound,
    Query,
    Protocol,
}

impl ErrorKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidDescriptor => "invalid_descriptor",
            Self::InvalidCredentials => "invalid_credentials",
            Self::Secrets => "secrets",
            Self::Network => "network",
            Self::Tls => "tls",
            Self::Authentication => "authentication",
            Self::ServiceNotFound => "service_not_found",
            Self::Query => "query",
            Self::Protocol => "protocol",
        }
    }

    /// Process exit code for this kind of failure
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::InvalidDescriptor | Self::InvalidCredentials | Self::Secrets => 2,
            Self::Network => 3,
            Self::Tls => 4,
            Self::Authentication => 5,
            Self::ServiceNotFound => 6,
            Self::Query => 7,
            Self::Protocol => 8,
        }
    }

    /// Operator hint printed next to the failure
    #[must_use]
    pub const fn hint(&self) -> &'static str {
        match self {
            Self::InvalidDescriptor => {
                "check the connect descriptor: host, port and service_name must be set"
            }
            Self::InvalidCredentials | Self::Secrets => {
                "check that the secrets store provides a non-empty username and password"
            }
            Self::Network => {
                "make sure your public IP address is on the database access control list (ACL); \
                 ACL changes can take a few minutes to apply"
            }
            Self::Tls => {
                "check the server trust policy: ssl_server_dn_match, ssl_server_cert_dn and the CA \
                 file must match the server certificate (mutual TLS must be disabled unless a \
                 client certificate is configured)"
            }
            Self::Authentication => "check the username and password in the secrets store",
            Self::ServiceNotFound => "check service_name in the connect descriptor",
            Self::Query => "the session was established but the statement failed",
            Self::Protocol => "the endpoint answered with an unexpected response; check the driver",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("invalid connect descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("secrets store: {0}")]
    Secrets(String),

    #[error("network unreachable: {target}: {reason}")]
    NetworkUnreachable { target: String, reason: String },

    #[error("TLS failure: {0}")]
    Tls(String),

    #[error("authentication failed for user {user}: {reason}")]
    Authentication { user: String, reason: String },

    #[error("service not found: {service}: {reason}")]
    ServiceNotFound { service: String, reason: String },

    #[error("query failed: {0}")]
    Query(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    /// Any of the above, stamped with the connection attempts made before it
    #[error("{error} (after {attempts} attempt(s))")]
    Attempted {
        attempts: u32,
        error: Box<ProbeError>,
    },
}

impl ProbeError {
    pub fn network(target: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::NetworkUnreachable {
            target: target.into(),
            reason: reason.to_string(),
        }
    }

    /// The failure itself, without the attempt count
    #[must_use]
    pub fn inner(&self) -> &Self {
        match self {
            Self::Attempted { error, .. } => error.inner(),
            other => other,
        }
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self.inner() {
            Self::InvalidDescriptor(_) => ErrorKind::InvalidDescriptor,
            Self::InvalidCredentials(_) => ErrorKind::InvalidCredentials,
            Self::Secrets(_) => ErrorKind::Secrets,
            Self::NetworkUnreachable { .. } => ErrorKind::Network,
            Self::Tls(_) => ErrorKind::Tls,
            Self::Authentication { .. } => ErrorKind::Authentication,
            Self::ServiceNotFound { .. } => ErrorKind::ServiceNotFound,
            Self::Query(_) => ErrorKind::Query,
            Self::Protocol(_) => ErrorKind::Protocol,
            Self::Attempted { error, .. } => error.kind(),
        }
    }

    /// Only network failures are worth another attempt
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self.inner(), Self::NetworkUnreachable { .. })
    }

    /// Connection attempts made before this error, `None` when it was raised
    /// before anything was sent
    #[must_use]
    pub const fn attempts(&self) -> Option<u32> {
        match self {
            Self::Attempted { attempts, .. } => Some(*attempts),
            _ => None,
        }
    }

    /// Record the attempt count, replacing one recorded earlier
    #[must_use]
    pub fn with_attempts(self, attempts: u32) -> Self {
        let error = match self {
            Self::Attempted { error, .. } => error,
            other => Box::new(other),
        };
        Self::Attempted { attempts, error }
    }
}
