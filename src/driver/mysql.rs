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
    mysql::{MySqlConnectOptions, MySqlConnection, MySqlDatabaseError, MySqlRow, MySqlSslMode},
};

const SERVER_INFO_SQL: &str = "SELECT CAST(NOW() AS CHAR), VERSION(), @@version_comment";

pub const VERSION_DETAILS_SQL: &str = r"
    SELECT 'Database Version' AS component, VERSION() AS value
    UNION ALL SELECT 'Edition', @@version_comment
    UNION ALL SELECT 'Database Name', COALESCE(DATABASE(), '')
    UNION ALL SELECT 'Current User', CURRENT_USER()
    UNION ALL SELECT 'Host Name', @@hostname
    UNION ALL SELECT 'Port', CAST(@@port AS CHAR)
    UNION ALL SELECT 'Read Only', CAST(@@read_only AS CHAR)
    UNION ALL SELECT 'Platform', CONCAT(@@version_compile_os, ' ', @@version_compile_machine)
";

// ER_DBACCESS_DENIED_ERROR, ER_ACCESS_DENIED_ERROR, ER_ACCESS_DENIED_NO_PASSWORD_ERROR
const AUTH_FAILED: [u16; 3] = [1044, 1045, 1698];
// ER_BAD_DB_ERROR
const UNKNOWN_DATABASE: u16 = 1049;

fn error_number(err: &dyn DatabaseError) -> Option<u16> {
    err.as_error()
        .downcast_ref::<MySqlDatabaseError>()
        .map(MySqlDatabaseError::number)
}

fn is_auth_failure(err: &dyn DatabaseError) -> bool {
    error_number(err).is_some_and(|number| AUTH_FAILED.contains(&number))
}

fn is_unknown_database(err: &dyn DatabaseError) -> bool {
    error_number(err) == Some(UNKNOWN_DATABASE)
}

fn connect_options(
    descriptor: &ConnectDescriptor,
    username: &str,
    password: &str,
) -> MySqlConnectOptions {
    let tls = &descriptor.tls;
    let mut options = MySqlConnectOptions::new()
        .host(&descriptor.host)
        .port(descriptor.port)
        .username(username)
        .password(password)
        .database(&descriptor.service_name);

    // Apply TLS configuration
    options = match session_tls_mode(tls) {
        TlsMode::Disable => options.ssl_mode(MySqlSslMode::Disabled),
        TlsMode::Require => options.ssl_mode(MySqlSslMode::Required),
        TlsMode::VerifyCA => {
            let mut opts = options.ssl_mode(MySqlSslMode::VerifyCa);
            if let Some(ca_path) = &tls.ca {
                opts = opts.ssl_ca(ca_path);
            }
            opts
        }
        TlsMode::VerifyFull => {
            let mut opts = options.ssl_mode(MySqlSslMode::VerifyIdentity);
            if let Some(ca_path) = &tls.ca {
                opts = opts.ssl_ca(ca_path);
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
) -> Result<MySqlConnection, ProbeError> {
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
pub async fn server_info(conn: &mut MySqlConnection) -> Result<ServerInfo, ProbeError> {
    let outcome = execute(conn, SERVER_INFO_SQL).await?;
    Ok(ServerInfo::from_first_row(&outcome))
}

/// Execute a statement over the text protocol
///
/// # Errors
///
/// Returns a query error if the statement fails
pub async fn execute(conn: &mut MySqlConnection, sql: &str) -> Result<QueryOutcome, ProbeError> {
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

fn render_row(row: &MySqlRow) -> Vec<Option<String>> {
    (0..row.len())
        .map(|i| {
            row.try_get_unchecked::<Option<String>, _>(i)
                .unwrap_or_else(|_| Some("<binary>".to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use crate::driver::Driver;

    #[test]
    fn test_auth_and_database_error_numbers() {
        assert!(AUTH_FAILED.contains(&1045));
        assert!(!AUTH_FAILED.contains(&UNKNOWN_DATABASE));
    }

    #[test]
    fn test_descriptor_scheme_selects_mysql() {
        let d = ConnectDescriptor::parse(
            "mysql://app:pw@tcp(db.internal:3306)/shop",
            Driver::Postgres,
        )
        .unwrap();
        assert_eq!(d.driver, Driver::Mysql);
        assert_eq!(d.port, 3306);
        assert_eq!(d.service_name, "shop");
    }

    #[test]
    fn test_version_details_sql_lists_components() {
        for component in ["Database Version", "Edition", "Current User", "Read Only"] {
            assert!(VERSION_DETAILS_SQL.contains(component));
        }
    }
}
