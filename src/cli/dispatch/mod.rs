use crate::{
    cli::actions::{Action, Connection, OutputFormat},
    descriptor::parse_duration,
    driver::Driver,
    probe::ValidationQuery,
};
use anyhow::{Context, Result, anyhow, bail};
use secrecy::SecretString;
use clap::{ArgMatches, parser::ValueSource};
use std::{path::PathBuf, time::Duration};

fn duration_arg(matches: &ArgMatches, name: &str) -> Result<Option<Duration>> {
    matches
        .get_one::<String>(name)
        .map(|value| {
            parse_duration(value)
                .filter(|d| !d.is_zero() || name == "retry-delay")
                .ok_or_else(|| anyhow!("invalid --{name}: {value:?}"))
        })
        .transpose()
}

fn path_arg(matches: &ArgMatches, name: &str) -> Option<PathBuf> {
    matches.get_one::<String>(name).map(PathBuf::from)
}

fn format_arg(matches: &ArgMatches) -> OutputFormat {
    match matches.get_one::<String>("format").map(String::as_str) {
        Some("json") => OutputFormat::Json,
        _ => OutputFormat::Text,
    }
}

/// Collect the connection sources; resolution happens when the action runs
fn connection(matches: &ArgMatches) -> Result<Connection> {
    let driver = matches
        .get_one::<String>("driver")
        .map(|d| d.parse::<Driver>().map_err(|e| anyhow!(e)))
        .transpose()?
        .unwrap_or_default();

    let secrets = path_arg(matches, "secrets").context("secrets path is required")?;
    let secrets_required = matches
        .value_source("secrets")
        .is_some_and(|source| source != ValueSource::DefaultValue);

    Ok(Connection {
        descriptor: matches.get_one::<String>("descriptor").cloned(),
        driver,
        secrets,
        secrets_required,
        section: matches
            .get_one::<String>("section")
            .cloned()
            .context("section is required")?,
        username: matches.get_one::<String>("username").cloned(),
        password: matches.get_one::<SecretString>("password").cloned(),
        tls_ca: path_arg(matches, "tls-ca"),
        tls_cert: path_arg(matches, "tls-cert"),
        tls_key: path_arg(matches, "tls-key"),
        retry_count: matches.get_one::<u32>("retry-count").copied(),
        retry_delay: duration_arg(matches, "retry-delay")?,
        connect_timeout: duration_arg(matches, "connect-timeout")?,
    })
}

/// Number of `-v` flags given
#[must_use]
pub fn verbosity(matches: &ArgMatches) -> u8 {
    matches
        .subcommand()
        .map_or(matches, |(_, sub)| sub)
        .get_count("verbose")
}

/// Convert `ArgMatches` into typed Action enum with validation
///
/// # Errors
///
/// Returns an error if an argument is invalid or the subcommand is unknown
pub fn dispatch(matches: &ArgMatches) -> Result<Action> {
    let Some((name, sub)) = matches.subcommand() else {
        bail!("a subcommand is required");
    };

    let format = format_arg(sub);

    let action = match name {
        "test" => {
            let validation = if sub.get_flag("skip-validation") {
                ValidationQuery::Skip
            } else {
                sub.get_one::<String>("validation-query")
                    .filter(|sql| !sql.trim().is_empty())
                    .map_or(ValidationQuery::Default, |sql| {
                        ValidationQuery::Custom(sql.clone())
                    })
            };

            Action::Test {
                connection: connection(sub)?,
                validation,
                format,
                metrics_file: path_arg(sub, "metrics-file"),
            }
        }
        "query" => Action::Query {
            connection: connection(sub)?,
            sql: sub
                .get_one::<String>("sql")
                .cloned()
                .context("SQL statement is required")?,
            format,
        },
        "version" => Action::Version {
            connection: connection(sub)?,
            format,
        },
        "public-ip" => Action::PublicIp { format },
        other => bail!("unknown subcommand: {other}"),
    };

    Ok(action)
}
