//! Database sessions negotiated with `sqlx`
//!
//! The transport probe proves the endpoint is reachable and trusted; the
//! session performs the application-layer handshake (authentication against
//! the service named in the descriptor) and runs statements.

pub mod mysql;
pub mod postgres;

use crate::{
    descriptor::ConnectDescriptor,
    error::ProbeError,
    probe::{QueryOutcome, ServerInfo, Session},
    tls::{TlsConfig, TlsMode},
};
use serde::Serialize;
use std::{fmt, str::FromStr, time::Instant};
use tracing::debug;

/// Database dialect used for the session handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Driver {
    #[default]
    Postgres,
    Mysql,
}

impl Driver {
    #[must_use]
    pub const fn default_port(&self) -> u16 {
        match self {
            Self::Postgres => 5432,
            Self::Mysql => 3306,
        }
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::Mysql => "mysql",
        }
    }

    /// Statement listing detailed server information, one `(component, value)` row each
    #[must_use]
    pub const fn version_details_sql(&self) -> &'static str {
        match self {
            Self::Postgres => postgres::VERSION_DETAILS_SQL,
            Self::Mysql => mysql::VERSION_DETAILS_SQL,
        }
    }
}

impl FromStr for Driver {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "postgres" | "postgresql" | "pg" => Ok(Self::Postgres),
            "mysql" | "mariadb" => Ok(Self::Mysql),
            _ => Err(format!("unsupported driver: {s}")),
        }
    }
}

impl fmt::Display for Driver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An authenticated database session
#[derive(Debug)]
pub enum DbSession {
    Postgres(sqlx::PgConnection),
    Mysql(sqlx::MySqlConnection),
}

impl DbSession {
    /// Open a session and authenticate with the given credentials, giving up
    /// at `deadline`
    ///
    /// # Errors
    ///
    /// Returns a categorized error when the handshake fails
    pub async fn open(
        descriptor: &ConnectDescriptor,
        username: &str,
        password: &str,
        deadline: tokio::time::Instant,
    ) -> Result<Self, ProbeError> {
        let connect = async {
            match descriptor.driver {
                Driver::Postgres => postgres::connect(descriptor, username, password)
                    .await
                    .map(Self::Postgres),
                Driver::Mysql => mysql::connect(descriptor, username, password)
                    .await
                    .map(Self::Mysql),
            }
        };

        tokio::time::timeout_at(deadline, connect)
            .await
            .map_err(|_| descriptor.timed_out("session handshake"))?
    }
}

impl Session for DbSession {
    async fn server_info(&mut self) -> Result<ServerInfo, ProbeError> {
        match self {
            Self::Postgres(conn) => postgres::server_info(conn).await,
            Self::Mysql(conn) => mysql::server_info(conn).await,
        }
    }

    async fn execute(&mut self, sql: &str) -> Result<QueryOutcome, ProbeError> {
        let started = Instant::now();
        let mut outcome = match self {
            Self::Postgres(conn) => postgres::execute(conn, sql).await?,
            Self::Mysql(conn) => mysql::execute(conn, sql).await?,
        };
        outcome.elapsed = started.elapsed();
        Ok(outcome)
    }

    async fn close(self) {
        let result = match self {
            Self::Postgres(conn) => sqlx::Connection::close(conn).await,
            Self::Mysql(conn) => sqlx::Connection::close(conn).await,
        };
        if let Err(e) = result {
            debug!("error closing session: {e}");
        }
    }
}

/// TLS mode handed to the session driver
///
/// An expected server DN replaces the hostname check; the transport probe
/// has already compared it, so the session only verifies the chain.
pub(crate) fn session_tls_mode(tls: &TlsConfig) -> TlsMode {
    match tls.mode {
        TlsMode::VerifyFull if tls.server_cert_dn.is_some() => TlsMode::VerifyCA,
        mode => mode,
    }
}

/// Map a `sqlx` failure onto the operator-facing taxonomy
pub(crate) fn classify(
    err: sqlx::Error,
    descriptor: &ConnectDescriptor,
    username: &str,
    auth_failed: impl Fn(&dyn sqlx::error::DatabaseError) -> bool,
    service_missing: impl Fn(&dyn sqlx::error::DatabaseError) -> bool,
) -> ProbeError {
    match err {
        sqlx::Error::Database(db_err) => {
            if auth_failed(&*db_err) {
                ProbeError::Authentication {
                    user: username.to_string(),
                    reason: db_err.message().to_string(),
                }
            } else if service_missing(&*db_err) {
                ProbeError::ServiceNotFound {
                    service: descriptor.service_name.clone(),
                    reason: db_err.message().to_string(),
                }
            } else {
                ProbeError::Protocol(db_err.message().to_string())
            }
        }
        sqlx::Error::Io(e) => ProbeError::network(descriptor.address(), e),
        sqlx::Error::Tls(e) => ProbeError::Tls(e.to_string()),
        other => ProbeError::Protocol(other.to_string()),
    }
}

/// Map a statement failure once the session is established
pub(crate) fn query_error(err: sqlx::Error) -> ProbeError {
    match err {
        sqlx::Error::Database(db_err) => ProbeError::Query(db_err.message().to_string()),
        other => ProbeError::Query(other.to_string()),
    }
}
