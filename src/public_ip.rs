//! Public IPv4 lookup, so the operator knows which address to put on the
//! database access control list

use crate::tls::ensure_crypto_provider;
use anyhow::{Context, Result, anyhow, bail};
use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::{Request, StatusCode, header};
use hyper_util::rt::TokioIo;
use rustls::{ClientConfig, RootCertStore, pki_types::ServerName};
use std::{net::Ipv4Addr, sync::Arc, time::Duration};
use tokio::{net::TcpStream, time::timeout};
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

/// Services answering with the caller's IPv4 address as plain text
pub const IP_SERVICES: [&str; 3] = ["api4.ipify.org", "ipv4.seeip.org", "v4.ident.me"];

const LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Ask each service in turn and return the first valid IPv4 answer
///
/// # Errors
///
/// Returns an error if no service answered with an IPv4 address
pub async fn lookup() -> Result<Ipv4Addr> {
    ensure_crypto_provider();
    let roots: RootCertStore = webpki_roots::TLS_SERVER_ROOTS.iter().cloned().collect();
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(config));

    for host in IP_SERVICES {
        match timeout(LOOKUP_TIMEOUT, fetch(&connector, host)).await {
            Ok(Ok(body)) => match parse_ipv4(&body) {
                Some(ip) => {
                    debug!("{host} reported {ip}");
                    return Ok(ip);
                }
                None => warn!("{host} answered without an IPv4 address: {body:?}"),
            },
            Ok(Err(e)) => warn!("{host} lookup failed: {e:#}"),
            Err(_) => warn!("{host} did not answer within {LOOKUP_TIMEOUT:?}"),
        }
    }

    Err(anyhow!("could not determine the public IPv4 address"))
}

async fn fetch(connector: &TlsConnector, host: &str) -> Result<String> {
    let stream = TcpStream::connect((host, 443))
        .await
        .with_context(|| format!("failed to connect to {host}"))?;
    let server_name = ServerName::try_from(host.to_string())?;
    let tls = connector
        .connect(server_name, stream)
        .await
        .with_context(|| format!("TLS handshake with {host} failed"))?;

    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(tls))
        .await
        .context("HTTP handshake failed")?;

    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!("connection error: {e}");
        }
    });

    let req = Request::builder()
        .uri("/")
        .header(header::HOST, host)
        .header(header::USER_AGENT, concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
        .body(Empty::<Bytes>::new())
        .context("failed to build request")?;

    let res = sender
        .send_request(req)
        .await
        .context("failed to send request")?;

    if res.status() != StatusCode::OK {
        bail!("unexpected status {}", res.status());
    }

    let body = res.collect().await?.to_bytes();
    Ok(String::from_utf8_lossy(&body).to_string())
}

/// Trimmed body parsed as IPv4; IPv6 answers are rejected
#[must_use]
pub fn parse_ipv4(body: &str) -> Option<Ipv4Addr> {
    body.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ipv4() {
        assert_eq!(parse_ipv4("203.0.113.7\n"), Some(Ipv4Addr::new(203, 0, 113, 7)));
        assert_eq!(parse_ipv4("  198.51.100.1 "), Some(Ipv4Addr::new(198, 51, 100, 1)));
        assert_eq!(parse_ipv4("2001:db8::1"), None);
        assert_eq!(parse_ipv4("<html>"), None);
        assert_eq!(parse_ipv4(""), None);
    }

    #[tokio::test]
    #[ignore = "requires internet access"]
    async fn test_lookup() {
        assert!(lookup().await.is_ok());
    }
}
