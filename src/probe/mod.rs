//! Connectivity tester
//!
//! A test runs: validate inputs, open a session under the retry policy, run
//! the validation query, close the session. Nothing touches the network
//! before the descriptor and credentials are known to be well formed.

mod live;
pub mod retry;

pub use live::LiveConnector;
pub use retry::retry_transient;

use crate::{
    credentials::Credentials, descriptor::ConnectDescriptor, error::ProbeError, tls::TlsMetadata,
};
use serde::{Serialize, Serializer};
use std::{
    future::Future,
    time::{Duration, Instant},
};
use tracing::{debug, info, instrument};

/// An authenticated session able to run statements
pub trait Session {
    /// Run the default validation query
    fn server_info(&mut self) -> impl Future<Output = Result<ServerInfo, ProbeError>>;

    /// Execute a single statement
    fn execute(&mut self, sql: &str) -> impl Future<Output = Result<QueryOutcome, ProbeError>>;

    fn close(self) -> impl Future<Output = ()>;
}

/// Opens sessions; one call is one attempt
pub trait Connector {
    type Session: Session;

    fn connect(
        &self,
        descriptor: &ConnectDescriptor,
        credentials: &Credentials,
    ) -> impl Future<Output = Result<Connected<Self::Session>, ProbeError>>;
}

/// A session plus what the transport handshake negotiated
#[derive(Debug)]
pub struct Connected<S> {
    pub session: S,
    pub tls: Option<TlsMetadata>,
}

/// Answer to the default validation query
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ServerInfo {
    pub server_time: Option<String>,
    pub version: Option<String>,
    pub banner: Option<String>,
}

impl ServerInfo {
    /// Read `(time, version, banner)` from the first row
    #[must_use]
    pub fn from_first_row(outcome: &QueryOutcome) -> Self {
        let column = |i: usize| {
            outcome
                .rows
                .first()
                .and_then(|row| row.get(i))
                .cloned()
                .flatten()
        };

        Self {
            server_time: column(0),
            version: column(1),
            banner: column(2),
        }
    }
}

/// Columns, rows rendered as text, and the statement's cost
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueryOutcome {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
    pub rows_affected: u64,
    #[serde(rename = "elapsed_ms", serialize_with = "millis")]
    pub elapsed: Duration,
}

pub(crate) fn millis<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(round_millis(*duration))
}

/// Milliseconds with two decimals
#[must_use]
pub fn round_millis(duration: Duration) -> f64 {
    (duration.as_secs_f64() * 100_000.0).round() / 100.0
}

/// Statement used to prove the session works
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ValidationQuery {
    /// Server time, version and banner
    #[default]
    Default,
    Custom(String),
    Skip,
}

#[derive(Debug, Clone, Default)]
pub struct ProbeOptions {
    pub validation: ValidationQuery,
}

/// A successful connectivity test
#[derive(Debug, Clone)]
pub struct Established {
    pub attempts: u32,
    pub elapsed: Duration,
    pub server: Option<ServerInfo>,
    pub tls: Option<TlsMetadata>,
}

fn validate(credentials: &Credentials, descriptor: &ConnectDescriptor) -> Result<(), ProbeError> {
    descriptor.validate()?;
    credentials.validate()
}

async fn connect<C: Connector>(
    connector: &C,
    credentials: &Credentials,
    descriptor: &ConnectDescriptor,
) -> Result<(Connected<C::Session>, u32), ProbeError> {
    validate(credentials, descriptor)?;
    let target = descriptor.target();
    retry_transient(&descriptor.retry, &target, |_| {
        connector.connect(descriptor, credentials)
    })
    .await
}

/// Check that `descriptor` is reachable and accepts `credentials`
///
/// # Errors
///
/// Returns a categorized [`ProbeError`]
pub async fn test_connection(
    credentials: &Credentials,
    descriptor: &ConnectDescriptor,
) -> Result<Established, ProbeError> {
    test_connection_with(
        &LiveConnector,
        credentials,
        descriptor,
        &ProbeOptions::default(),
    )
    .await
}

/// [`test_connection`] over any [`Connector`]
///
/// # Errors
///
/// Returns a categorized [`ProbeError`]; invalid input fails before the
/// connector is called
#[instrument(skip_all, fields(target = %descriptor.target(), user = %credentials.username))]
pub async fn test_connection_with<C: Connector>(
    connector: &C,
    credentials: &Credentials,
    descriptor: &ConnectDescriptor,
    options: &ProbeOptions,
) -> Result<Established, ProbeError> {
    let started = Instant::now();
    let (connected, attempts) = connect(connector, credentials, descriptor).await?;
    let Connected { mut session, tls } = connected;

    let server = match &options.validation {
        ValidationQuery::Default => session.server_info().await.map(Some),
        ValidationQuery::Custom(sql) => session.execute(sql).await.map(|outcome| {
            debug!(rows = outcome.rows.len(), "validation query returned");
            None
        }),
        ValidationQuery::Skip => Ok(None),
    };
    session.close().await;

    let established = Established {
        attempts,
        elapsed: started.elapsed(),
        server: server.map_err(|e| e.with_attempts(attempts))?,
        tls,
    };
    info!(
        attempts,
        elapsed_ms = round_millis(established.elapsed),
        "connection established"
    );
    Ok(established)
}

/// Connect under the retry policy and execute one statement
///
/// # Errors
///
/// Returns a categorized [`ProbeError`]; an empty statement is a query error
#[instrument(skip_all, fields(target = %descriptor.target()))]
pub async fn run_query<C: Connector>(
    connector: &C,
    credentials: &Credentials,
    descriptor: &ConnectDescriptor,
    sql: &str,
) -> Result<QueryOutcome, ProbeError> {
    if sql.trim().is_empty() {
        return Err(ProbeError::Query("empty statement".to_string()));
    }

    let (connected, attempts) = connect(connector, credentials, descriptor).await?;
    let mut session = connected.session;
    let outcome = session.execute(sql).await;
    session.close().await;

    let outcome = outcome.map_err(|e| e.with_attempts(attempts))?;
    debug!(
        columns = outcome.columns.len(),
        rows = outcome.rows.len(),
        rows_affected = outcome.rows_affected,
        "statement executed"
    );
    Ok(outcome)
}

/// Detailed server information, one `(component, value)` row per item
///
/// # Errors
///
/// Returns a categorized [`ProbeError`]
pub async fn version_details<C: Connector>(
    connector: &C,
    credentials: &Credentials,
    descriptor: &ConnectDescriptor,
) -> Result<QueryOutcome, ProbeError> {
    run_query(
        connector,
        credentials,
        descriptor,
        descriptor.driver.version_details_sql(),
    )
    .await
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    fn outcome(rows: Vec<Vec<Option<&str>>>) -> QueryOutcome {
        QueryOutcome {
            columns: vec!["a".into(), "b".into(), "c".into()],
            rows: rows
                .into_iter()
                .map(|row| row.into_iter().map(|v| v.map(String::from)).collect())
                .collect(),
            ..QueryOutcome::default()
        }
    }

    #[test]
    fn test_server_info_from_first_row() {
        let info = ServerInfo::from_first_row(&outcome(vec![
            vec![Some("2026-01-01 00:00:00"), Some("16.4"), Some("PostgreSQL 16.4")],
            vec![Some("ignored"), None, None],
        ]));
        assert_eq!(info.server_time.as_deref(), Some("2026-01-01 00:00:00"));
        assert_eq!(info.version.as_deref(), Some("16.4"));
        assert_eq!(info.banner.as_deref(), Some("PostgreSQL 16.4"));
    }

    #[test]
    fn test_server_info_tolerates_short_rows() {
        let info = ServerInfo::from_first_row(&outcome(vec![vec![Some("now"), None]]));
        assert_eq!(info.server_time.as_deref(), Some("now"));
        assert!(info.version.is_none());
        assert!(info.banner.is_none());
        assert_eq!(ServerInfo::from_first_row(&QueryOutcome::default()), ServerInfo::default());
    }

    #[test]
    fn test_round_millis() {
        assert!((round_millis(Duration::from_micros(12_340)) - 12.34).abs() < f64::EPSILON);
        assert!((round_millis(Duration::from_secs(1)) - 1000.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_query_outcome_serializes_elapsed_ms() {
        let mut outcome = outcome(vec![vec![Some("1"), None, Some("x")]]);
        outcome.elapsed = Duration::from_millis(250);
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["elapsed_ms"], 250.0);
        assert_eq!(json["rows"][0][1], serde_json::Value::Null);
        assert_eq!(json["columns"][2], "c");
    }
}
