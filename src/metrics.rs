//! Prometheus description of the last run, for the node_exporter textfile collector

use crate::report::ConnectionReport;
use prometheus::{
    Encoder, GaugeVec, IntGaugeVec, Registry, opts, register_gauge_vec_with_registry,
    register_int_gauge_vec_with_registry,
};
use std::{
    io,
    path::{Path, PathBuf},
    sync::LazyLock,
};

pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

trait ResultExt<T> {
    fn or_exit(self, context: &str) -> T;
}

impl<T, E> ResultExt<T> for Result<T, E>
where
    E: std::fmt::Display,
{
    fn or_exit(self, context: &str) -> T {
        match self {
            Ok(value) => value,
            Err(err) => {
                eprintln!("failed to initialize metric ({context}): {err}");
                std::process::exit(1);
            }
        }
    }
}

pub static UP: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    register_int_gauge_vec_with_registry!(
        opts!("dbreach_up", "1 if the last connectivity test succeeded, 0 otherwise"),
        &["target"],
        &REGISTRY
    )
    .or_exit("metric can be created")
});

pub static ATTEMPTS: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    register_int_gauge_vec_with_registry!(
        opts!("dbreach_attempts", "connection attempts made by the last test"),
        &["target"],
        &REGISTRY
    )
    .or_exit("metric can be created")
});

pub static RESPONSE_TIME: LazyLock<GaugeVec> = LazyLock::new(|| {
    register_gauge_vec_with_registry!(
        opts!(
            "dbreach_response_time_seconds",
            "duration of the last connectivity test in seconds"
        ),
        &["target"],
        &REGISTRY
    )
    .or_exit("metric can be created")
});

pub static FAILURE: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    register_int_gauge_vec_with_registry!(
        opts!(
            "dbreach_failure",
            "1 for the error kind of the last failed test"
        ),
        &["target", "kind"],
        &REGISTRY
    )
    .or_exit("metric can be created")
});

pub static TLS_INFO: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    register_int_gauge_vec_with_registry!(
        opts!(
            "dbreach_tls_info",
            "TLS connection info (version, cipher) - value is always 1"
        ),
        &["target", "version", "cipher"],
        &REGISTRY
    )
    .or_exit("metric can be created")
});

pub static TLS_CERT_EXPIRY_DAYS: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    register_int_gauge_vec_with_registry!(
        opts!(
            "dbreach_tls_cert_expiry_days",
            "days until the server certificate expires"
        ),
        &["target"],
        &REGISTRY
    )
    .or_exit("metric can be created")
});

pub static LAST_RUN: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    register_int_gauge_vec_with_registry!(
        opts!(
            "dbreach_last_run_timestamp_seconds",
            "unix timestamp of the last connectivity test"
        ),
        &["target"],
        &REGISTRY
    )
    .or_exit("metric can be created")
});

/// Update the gauges from a finished test
pub fn record(report: &ConnectionReport) {
    let target = report.target.as_str();

    UP.with_label_values(&[target]).set(i64::from(report.success));
    ATTEMPTS
        .with_label_values(&[target])
        .set(i64::from(report.attempts));
    RESPONSE_TIME
        .with_label_values(&[target])
        .set(report.response_time_ms / 1000.0);
    LAST_RUN
        .with_label_values(&[target])
        .set(chrono::Utc::now().timestamp());

    if let Some(kind) = report.error_kind {
        FAILURE.with_label_values(&[target, kind.as_str()]).set(1);
    }

    if let Some(tls) = &report.tls {
        TLS_INFO
            .with_label_values(&[
                target,
                tls.version.as_deref().unwrap_or("unknown"),
                tls.cipher.as_deref().unwrap_or("unknown"),
            ])
            .set(1);
        if let Some(days) = tls.cert_expiry_days {
            TLS_CERT_EXPIRY_DAYS.with_label_values(&[target]).set(days);
        }
    }
}

/// Encode the registry in the Prometheus text format
///
/// # Errors
///
/// Returns an error if metrics encoding fails
pub fn encode_metrics() -> Result<Vec<u8>, String> {
    let mut buffer = Vec::new();
    let encoder = prometheus::TextEncoder::new();

    encoder
        .encode(&REGISTRY.gather(), &mut buffer)
        .map_err(|e| format!("could not encode custom metrics: {e}"))?;

    Ok(buffer)
}

/// Write the metrics next to `path` and rename into place, so the collector
/// never reads a partial file
///
/// # Errors
///
/// Returns an error if encoding, writing or renaming fails
pub fn write_textfile(path: &Path) -> io::Result<()> {
    let buffer = encode_metrics().map_err(io::Error::other)?;

    let mut tmp = PathBuf::from(path);
    tmp.as_mut_os_string().push(".tmp");

    std::fs::write(&tmp, buffer)?;
    std::fs::rename(&tmp, path)
}
