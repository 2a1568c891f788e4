use super::{classify, query_error, session_tls_mode};
use crate::{
    descriptor::ConnectDescriptor,
    error::ProbeError,
    probe::{QueryOutcome, ServerInfo},
    tls::TlsMode,
};
use futures::TryStreamExt;
use sqlx::{
    Column, ConnectOptions, Either, Row,
    error::DatabaseError,
    postgres::{PgConnectOptions, PgConnection, PgDatabaseError, PgRow, PgSslMode},
};

const SERVER_INFO_SQL: &str =
    "SELECT now()::text, current_setting('server_version'), version()";

pub const VERSION_DETAILS_SQL: &str = r"
    SELECT component, value FROM (
        SELECT 1 AS ord, 'Database Version'::text AS component, current_setting('server_version') AS value
        UNION ALL SELECT 2, 'Banner', version()
        UNION ALL SELECT 3, 'Database Name', current_database()::text
        UNION ALL SELECT 4, 'Current User', current_user::text
        UNION ALL SELECT 5, 'Server Address', COALESCE(host(inet_server_addr()), 'local socket')
        UNION ALL SELECT 6, 'Server Port', COALESCE(inet_server_port()::text, '')
        UNION ALL SELECT 7, 'In Recovery', pg_is_in_recovery()::text
        UNION ALL SELECT 8, 'Started', pg_postmaster_start_time()::text
        UNION ALL SELECT 9, 'Encoding', pg_encoding_to_char(encoding)::text
            FROM pg_database WHERE datname = current_database()
    ) details ORDER BY ord
";

// SQLSTATE invalid_password, invalid_authorization_specification
const AUTH_FAILED: [&str; 2] = ["28P01", "28000"];
// SQLSTATE invalid_catalog_name
const UNKNOWN_DATABASE: &str = "3D000";

fn sqlstate(err: &dyn DatabaseError) -> Option<&str> {
    err.as_error()
        .downcast_ref::<PgDatabaseError>()
        .map(PgDatabaseError::code)
}

fn is_auth_failure(err: &dyn DatabaseError) -> bool {
    sqlstate(err).is_some_and(|code| AUTH_FAILED.contains(&code))
}

fn is_unknown_database(err: &dyn DatabaseError) -> bool {
    sqlstate(err) == Some(UNKNOWN_DATABASE)
}

fn connect_options(
    descriptor: &ConnectDescriptor,
    username: &str,
    password: &str,
) -> PgConnectOptions {
    let tls = &descriptor.tls;
    let mut options = PgConnectOptions::new()
        .host(&descriptor.host)
        .port(descriptor.port)
        .username(username)
        .password(password)
        .database(&descriptor.service_name)
        .application_name(env!("CARGO_PKG_NAME"));

    // Apply TLS configuration
    options = match session_tls_mode(tls) {
        TlsMode::Disable => options.ssl_mode(PgSslMode::Disable),
        TlsMode::Require => options.ssl_mode(PgSslMode::Require),
        TlsMode::VerifyCA => {
            let mut opts = options.ssl_mode(PgSslMode::VerifyCa);
            if let Some(ca_path) = &tls.ca {
                opts = opts.ssl_root_cert(ca_path);
            }
            opts
        }
        TlsMode::VerifyFull => {
            let mut opts = options.ssl_mode(PgSslMode::VerifyFull);
            if let Some(ca_path) = &tls.ca {
                opts = opts.ssl_root_cert(ca_path);
            }
            opts
        }
    };

    // Apply client certificate if provided
    if let (Some(cert_path), Some(key_path)) = (&tls.cert, &tls.key) {
        options = options.ssl_client_cert(cert_path).ssl_client_key(key_path);
    }

    options
}

/// Authenticate against the descriptor's service
///
/// # Errors
///
/// Returns an authentication, service-not-found, TLS or network error
pub async fn connect(
    descriptor: &ConnectDescriptor,
    username: &str,
    password: &str,
) -> Result<PgConnection, ProbeError> {
    connect_options(descriptor, username, password)
        .connect()
        .await
        .map_err(|e| classify(e, descriptor, username, is_auth_failure, is_unknown_database))
}

/// Run the default validation query
///
/// # Errors
///
/// Returns a query error if the statement fails
pub async fn server_info(conn: &mut PgConnection) -> Result<ServerInfo, ProbeError> {
    let outcome = execute(conn, SERVER_INFO_SQL).await?;
    Ok(ServerInfo::from_first_row(&outcome))
}

/// Execute a statement over the simple query protocol, every value comes back as text
///
/// # Errors
///
/// Returns a query error if the statement fails
pub async fn execute(conn: &mut PgConnection, sql: &str) -> Result<QueryOutcome, ProbeError> {
    let mut outcome = QueryOutcome::default();
    let mut stream = sqlx::raw_sql(sql).fetch_many(&mut *conn);

    while let Some(step) = stream.try_next().await.map_err(query_error)? {
        match step {
            Either::Left(done) => outcome.rows_affected += done.rows_affected(),
            Either::Right(row) => {
                if outcome.columns.is_empty() {
                    outcome.columns = row
                        .columns()
                        .iter()
                        .map(|c| c.name().to_string())
                        .collect();
                }
                outcome.rows.push(render_row(&row));
            }
        }
    }

    Ok(outcome)
}

fn render_row(row: &PgRow) -> Vec<Option<String>> {
    (0..row.len())
        .map(|i| {
            row.try_get_unchecked::<Option<String>, _>(i)
                .unwrap_or_else(|_| Some("<binary>".to_string()))
        })
        .collect()
}
