use super::{Action, Connection, OutputFormat};
use crate::{
    error::ProbeError,
    metrics,
    probe::{self, LiveConnector, ProbeOptions, QueryOutcome, ValidationQuery},
    public_ip,
    report::{ConnectionReport, render_table},
};
use anyhow::{Context, Result};
use std::{path::Path, time::Instant};
use tracing::{info, warn};

/// Execute the action's business logic by delegating to the appropriate module
pub async fn execute(action: Action) -> Result<i32> {
    match action {
        Action::Test {
            connection,
            validation,
            format,
            metrics_file,
        } => test(&connection, validation, format, metrics_file.as_deref()).await,
        Action::Query {
            connection,
            sql,
            format,
        } => query(&connection, Some(&sql), format).await,
        Action::Version { connection, format } => query(&connection, None, format).await,
        Action::PublicIp { format } => lookup_public_ip(format).await,
    }
}

fn unresolved_user(connection: &Connection) -> String {
    connection
        .username
        .clone()
        .unwrap_or_else(|| "unknown".to_string())
}

async fn test(
    connection: &Connection,
    validation: ValidationQuery,
    format: OutputFormat,
    metrics_file: Option<&Path>,
) -> Result<i32> {
    let started = Instant::now();

    let report = match connection.resolve() {
        Ok((descriptor, credentials)) => {
            let target = descriptor.target();
            let tls_mode = Some(descriptor.tls.mode);
            let options = ProbeOptions { validation };

            match probe::test_connection_with(&LiveConnector, &credentials, &descriptor, &options)
                .await
            {
                Ok(established) => ConnectionReport::succeeded(
                    target,
                    &credentials.username,
                    tls_mode,
                    established,
                ),
                Err(err) => ConnectionReport::failed(
                    target,
                    &credentials.username,
                    tls_mode,
                    &err,
                    started.elapsed(),
                ),
            }
        }
        Err(err) => ConnectionReport::failed(
            "unknown",
            unresolved_user(connection),
            None,
            &err,
            started.elapsed(),
        ),
    };

    if let Some(path) = metrics_file {
        metrics::record(&report);
        metrics::write_textfile(path)
            .with_context(|| format!("failed to write metrics to {}", path.display()))?;
        info!("metrics written to {}", path.display());
    }

    print_report(&report, format)?;
    Ok(report.exit_code())
}

/// `sql` of `None` asks for the server's version details
async fn query(connection: &Connection, sql: Option<&str>, format: OutputFormat) -> Result<i32> {
    let started = Instant::now();

    let (descriptor, credentials) = match connection.resolve() {
        Ok(resolved) => resolved,
        Err(err) => {
            let report = ConnectionReport::failed(
                "unknown",
                unresolved_user(connection),
                None,
                &err,
                started.elapsed(),
            );
            print_report(&report, format)?;
            return Ok(report.exit_code());
        }
    };

    let result: Result<QueryOutcome, ProbeError> = match sql {
        Some(sql) => probe::run_query(&LiveConnector, &credentials, &descriptor, sql).await,
        None => probe::version_details(&LiveConnector, &credentials, &descriptor).await,
    };

    match result {
        Ok(outcome) => {
            match format {
                OutputFormat::Text => print!("{}", render_table(&outcome)),
                OutputFormat::Json => println!(
                    "{}",
                    serde_json::to_string_pretty(&outcome).context("failed to serialize result")?
                ),
            }
            Ok(0)
        }
        Err(err) => {
            let report = ConnectionReport::failed(
                descriptor.target(),
                &credentials.username,
                Some(descriptor.tls.mode),
                &err,
                started.elapsed(),
            );
            print_report(&report, format)?;
            Ok(report.exit_code())
        }
    }
}

async fn lookup_public_ip(format: OutputFormat) -> Result<i32> {
    let ip = public_ip::lookup().await?;

    match format {
        OutputFormat::Text => {
            println!("{ip}");
            eprintln!("add {ip}/32 to the database access control list");
        }
        OutputFormat::Json => println!("{}", serde_json::json!({ "public_ip": ip })),
    }

    Ok(0)
}

fn print_report(report: &ConnectionReport, format: OutputFormat) -> Result<()> {
    if !report.success {
        warn!(
            kind = report.error_kind.map(|k| k.as_str()),
            attempts = report.attempts,
            "{}",
            report.message
        );
    }

    match format {
        OutputFormat::Text => print!("{report}"),
        OutputFormat::Json => println!(
            "{}",
            report.to_json().context("failed to serialize report")?
        ),
    }
    Ok(())
}
