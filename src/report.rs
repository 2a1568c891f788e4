//! Rendering of connection results for the operator

use crate::{
    error::{ErrorKind, ProbeError},
    probe::{Established, QueryOutcome, ServerInfo, round_millis},
    tls::{TlsMetadata, TlsMode},
};
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use std::{fmt, time::Duration};

/// Outcome of one connectivity test
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionReport {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    pub attempts: u32,
    pub response_time_ms: f64,
    pub target: String,
    pub user: String,
    pub tls_mode: Option<TlsMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<ServerInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsMetadata>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<&'static str>,
    pub checked_at: String,
}

impl ConnectionReport {
    fn new(target: impl Into<String>, user: impl Into<String>, tls_mode: Option<TlsMode>) -> Self {
        Self {
            success: false,
            message: String::new(),
            error_kind: None,
            attempts: 0,
            response_time_ms: 0.0,
            target: target.into(),
            user: user.into(),
            tls_mode,
            server: None,
            tls: None,
            hint: None,
            checked_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }

    #[must_use]
    pub fn succeeded(
        target: impl Into<String>,
        user: impl Into<String>,
        tls_mode: Option<TlsMode>,
        established: Established,
    ) -> Self {
        Self {
            success: true,
            message: "connection succeeded".to_string(),
            attempts: established.attempts,
            response_time_ms: round_millis(established.elapsed),
            server: established.server,
            tls: established.tls,
            ..Self::new(target, user, tls_mode)
        }
    }

    /// Errors raised before any connection attempt report zero attempts
    #[must_use]
    pub fn failed(
        target: impl Into<String>,
        user: impl Into<String>,
        tls_mode: Option<TlsMode>,
        error: &ProbeError,
        elapsed: Duration,
    ) -> Self {
        let kind = error.kind();
        Self {
            message: error.to_string(),
            error_kind: Some(kind),
            attempts: error.attempts().unwrap_or(0),
            response_time_ms: round_millis(elapsed),
            hint: Some(kind.hint()),
            ..Self::new(target, user, tls_mode)
        }
    }

    /// Process exit code: 0 on success, per error kind otherwise
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        self.error_kind.map_or(0, |kind| kind.exit_code())
    }

    /// # Errors
    ///
    /// Returns an error if serialization fails
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

fn field(f: &mut fmt::Formatter<'_>, name: &str, value: impl fmt::Display) -> fmt::Result {
    writeln!(f, "  {:<15} {value}", format!("{name}:"))
}

impl fmt::Display for ConnectionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.success {
            writeln!(f, "Connection test succeeded")?;
        } else {
            writeln!(f, "Connection test failed: {}", self.message)?;
        }

        field(f, "target", &self.target)?;
        field(f, "user", &self.user)?;
        if let Some(kind) = self.error_kind {
            field(f, "error kind", kind)?;
        }
        field(f, "attempts", self.attempts)?;
        field(f, "response time", format!("{} ms", self.response_time_ms))?;

        if let Some(server) = &self.server {
            if let Some(time) = &server.server_time {
                field(f, "server time", time)?;
            }
            if let Some(version) = &server.version {
                field(f, "version", version)?;
            }
            if let Some(banner) = &server.banner {
                field(f, "banner", banner)?;
            }
        }

        if let Some(tls) = &self.tls {
            let negotiated = [tls.version.as_deref(), tls.cipher.as_deref()]
                .into_iter()
                .flatten()
                .collect::<Vec<_>>()
                .join(" ");
            if !negotiated.is_empty() {
                field(f, "tls", negotiated)?;
            }
            if let Some(subject) = &tls.cert_subject {
                field(f, "certificate", subject)?;
            }
            if let Some(issuer) = &tls.cert_issuer {
                field(f, "issuer", issuer)?;
            }
            if let Some(days) = tls.cert_expiry_days {
                field(f, "expires in", format!("{days} days"))?;
            }
        }

        if let Some(hint) = self.hint {
            writeln!(f)?;
            writeln!(f, "hint: {hint}")?;
            writeln!(f)?;
            writeln!(f, "debug info:")?;
            field(f, env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))?;
            field(
                f,
                "os",
                format!("{} {}", std::env::consts::OS, std::env::consts::ARCH),
            )?;
            field(
                f,
                "tls mode",
                self.tls_mode
                    .map_or_else(|| "unknown".to_string(), |mode| mode.to_string()),
            )?;
        }

        Ok(())
    }
}

/// Render a result set as an aligned text table, `NULL` for missing values
#[must_use]
pub fn render_table(outcome: &QueryOutcome) -> String {
    let elapsed = round_millis(outcome.elapsed);

    if outcome.columns.is_empty() {
        return format!("{} row(s) affected ({elapsed} ms)\n", outcome.rows_affected);
    }

    let cells: Vec<Vec<&str>> = outcome
        .rows
        .iter()
        .map(|row| row.iter().map(|v| v.as_deref().unwrap_or("NULL")).collect())
        .collect();

    let mut widths: Vec<usize> = outcome.columns.iter().map(|c| c.chars().count()).collect();
    for row in &cells {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.chars().count());
        }
    }

    let line = |values: &mut dyn Iterator<Item = &str>| -> String {
        values
            .zip(&widths)
            .map(|(value, &width)| format!("{value:<width$}"))
            .collect::<Vec<_>>()
            .join(" | ")
            .trim_end()
            .to_string()
    };

    let mut out = String::new();
    out.push_str(&line(&mut outcome.columns.iter().map(String::as_str)));
    out.push('\n');
    out.push_str(
        &widths
            .iter()
            .map(|w| "-".repeat(*w))
            .collect::<Vec<_>>()
            .join("-+-"),
    );
    out.push('\n');
    for row in &cells {
        out.push_str(&line(&mut row.iter().copied()));
        out.push('\n');
    }
    out.push_str(&format!("({} row(s), {elapsed} ms)\n", cells.len()));
    out
}
