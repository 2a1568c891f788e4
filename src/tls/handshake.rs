//! Transport probe: TCP connect, in-protocol STARTTLS, TLS handshake
//!
//! The probe runs before the database session so that trust failures are
//! reported with the certificate that was presented, and so that a plain
//! TCP endpoint is known to be reachable before authenticating.

use super::{CertCapturingVerifier, TlsConfig, TlsMetadata, verifier::metadata_from_der};
use crate::{descriptor::ConnectDescriptor, driver::Driver, error::ProbeError};
use rustls::{
    ClientConfig, ProtocolVersion, RootCertStore,
    pki_types::{CertificateDer, PrivateKeyDer, ServerName},
};
use rustls_pemfile::{certs, private_key};
use std::{
    io::{self, Cursor},
    net::IpAddr,
    path::Path,
    sync::{Arc, OnceLock},
};
use tokio::{
    fs,
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::{Instant, timeout_at},
};
use tokio_rustls::{TlsConnector, client::TlsStream};
use tracing::debug;

// PostgreSQL SSL handshake constants
const POSTGRES_SSL_REQUEST_CODE: i32 = 80_877_103;
const POSTGRES_SSL_REQUEST_LEN: i32 = 8;

// MySQL capability flags
const MYSQL_CLIENT_SSL: u32 = 0x0000_0800;
const MYSQL_CLIENT_PROTOCOL_41: u32 = 0x0000_0200;
const MYSQL_CLIENT_SECURE_CONNECTION: u32 = 0x0000_8000;
const MYSQL_CLIENT_LONG_FLAG: u32 = 0x0000_0004;
const MYSQL_CLIENT_PLUGIN_AUTH: u32 = 0x0008_0000;
// First byte of a MySQL ERR packet
const MYSQL_ERR_PACKET: u8 = 0xff;

static CRYPTO_PROVIDER_INIT: OnceLock<()> = OnceLock::new();

/// Install the ring crypto provider as the process default
///
/// Safe to call repeatedly; an already installed provider is kept.
pub fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.get_or_init(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            debug!("a rustls crypto provider was already installed");
        }
    });
}

/// Connect to the descriptor's address and, when TLS is enabled, negotiate
/// it the way the driver's wire protocol does.
///
/// Returns `None` for plain TCP descriptors. Every stage must finish before
/// `deadline`.
///
/// # Errors
///
/// Network errors for connect/read/write failures and timeouts, TLS errors
/// when the server refuses TLS or its certificate is not trusted
pub async fn probe(
    descriptor: &ConnectDescriptor,
    deadline: Instant,
) -> Result<Option<TlsMetadata>, ProbeError> {
    let address = descriptor.address();
    let network = |e: io::Error| ProbeError::network(address.clone(), e);

    let mut stream = timeout_at(
        deadline,
        TcpStream::connect((descriptor.host.as_str(), descriptor.port)),
    )
    .await
    .map_err(|_| descriptor.timed_out("TCP connect"))?
    .map_err(network)?;
    debug!("TCP connection to {address} established");

    if !descriptor.tls.mode.is_enabled() {
        stream.shutdown().await.ok();
        return Ok(None);
    }

    let handshake = async {
        match descriptor.driver {
            Driver::Postgres => send_postgres_ssl_request(&mut stream).await?,
            Driver::Mysql => perform_mysql_starttls(&mut stream).await?,
        }

        let (connector, verifier) = build_tls_connector(&descriptor.tls).await?;
        let server_name = server_name_from_host(&descriptor.host)?;
        let tls_stream = connector
            .connect(server_name, stream)
            .await
            .map_err(|e| handshake_error(e, &address, &verifier))?;

        let mut metadata = extract_metadata(&tls_stream);
        if metadata.cert_subject.is_none()
            && let Some(captured) = verifier.get_captured()
        {
            metadata = TlsMetadata {
                version: metadata.version,
                cipher: metadata.cipher,
                ..captured.into()
            };
        }

        let mut tls_stream = tls_stream;
        tls_stream.shutdown().await.ok();
        Ok::<_, ProbeError>(Some(metadata))
    };

    timeout_at(deadline, handshake)
        .await
        .map_err(|_| descriptor.timed_out("TLS negotiation"))?
}

/// A rustls rejection arrives as `InvalidData`; everything else is the network
fn handshake_error(err: io::Error, address: &str, verifier: &CertCapturingVerifier) -> ProbeError {
    if err.kind() != io::ErrorKind::InvalidData {
        return ProbeError::network(address, err);
    }

    match verifier.get_captured().and_then(|c| c.subject) {
        Some(subject) => ProbeError::Tls(format!(
            "handshake with {address} failed: {err} (server certificate: {subject})"
        )),
        None => ProbeError::Tls(format!("handshake with {address} failed: {err}")),
    }
}

async fn send_postgres_ssl_request(stream: &mut TcpStream) -> Result<(), ProbeError> {
    let address = peer(stream);
    let mut packet = Vec::with_capacity(8);
    packet.extend_from_slice(&POSTGRES_SSL_REQUEST_LEN.to_be_bytes());
    packet.extend_from_slice(&POSTGRES_SSL_REQUEST_CODE.to_be_bytes());

    stream
        .write_all(&packet)
        .await
        .map_err(|e| ProbeError::network(&address, e))?;

    let mut response = [0u8; 1];
    stream
        .read_exact(&mut response)
        .await
        .map_err(|e| ProbeError::network(&address, e))?;

    match response {
        [b'S'] => Ok(()),
        [b'N'] => Err(ProbeError::Tls(
            "PostgreSQL server does not accept TLS connections".to_string(),
        )),
        [other] => Err(ProbeError::Protocol(format!(
            "unexpected SSLRequest response byte 0x{other:02x}; is this a PostgreSQL server?"
        ))),
    }
}

async fn perform_mysql_starttls(stream: &mut TcpStream) -> Result<(), ProbeError> {
    let address = peer(stream);
    let mut header = [0u8; 4];
    stream
        .read_exact(&mut header)
        .await
        .map_err(|e| ProbeError::network(&address, e))?;
    let [len0, len1, len2, _sequence] = header;
    let payload_len = u32::from_le_bytes([len0, len1, len2, 0]);
    let mut payload = vec![0u8; payload_len as usize];
    stream
        .read_exact(&mut payload)
        .await
        .map_err(|e| ProbeError::network(&address, e))?;

    let (capabilities, charset) = parse_mysql_handshake(&payload)?;
    if capabilities & MYSQL_CLIENT_SSL == 0 {
        return Err(ProbeError::Tls(
            "MySQL server does not support TLS connections".to_string(),
        ));
    }

    let mut client_flags = MYSQL_CLIENT_PROTOCOL_41
        | MYSQL_CLIENT_SSL
        | MYSQL_CLIENT_SECURE_CONNECTION
        | MYSQL_CLIENT_LONG_FLAG
        | MYSQL_CLIENT_PLUGIN_AUTH;
    client_flags &= capabilities | MYSQL_CLIENT_SSL;

    stream
        .write_all(&mysql_ssl_request(client_flags, charset))
        .await
        .map_err(|e| ProbeError::network(&address, e))?;

    Ok(())
}

fn mysql_ssl_request(client_flags: u32, charset: u8) -> Vec<u8> {
    let max_packet = 16_777_216_u32;
    let collation = if charset == 0 { 0x21 } else { charset };

    let payload_len: u32 = 4 + 4 + 1 + 23;
    let mut packet = Vec::with_capacity(payload_len as usize + 4);
    packet.extend_from_slice(&payload_len.to_le_bytes()[..3]);
    packet.push(1);
    packet.extend_from_slice(&client_flags.to_le_bytes());
    packet.extend_from_slice(&max_packet.to_le_bytes());
    packet.push(collation);
    packet.extend_from_slice(&[0u8; 23]);
    packet
}

fn parse_mysql_handshake(payload: &[u8]) -> Result<(u32, u8), ProbeError> {
    let malformed = |what: &str| ProbeError::Protocol(format!("invalid MySQL handshake: {what}"));

    match payload.first() {
        None => return Err(malformed("empty payload")),
        Some(&MYSQL_ERR_PACKET) => {
            // host blocked, too many connections, ...
            let message = payload.get(3..).map(String::from_utf8_lossy).unwrap_or_default();
            return Err(ProbeError::Protocol(format!(
                "MySQL server refused the connection: {}",
                message.trim_start_matches('#')
            )));
        }
        Some(_) => {}
    }

    let mut cursor = 1; // protocol version

    let version_end = payload
        .get(cursor..)
        .and_then(|rest| rest.iter().position(|&b| b == 0))
        .ok_or_else(|| malformed("missing version terminator"))?;
    cursor += version_end + 1; // server version string + null

    if payload.len() < cursor + 4 + 8 + 1 + 2 {
        return Err(malformed("unexpectedly short payload"));
    }
    cursor += 4; // connection id
    cursor += 8; // auth plugin data part 1
    cursor += 1; // filler

    let mut capabilities = payload
        .get(cursor..cursor + 2)
        .and_then(|bytes| <[u8; 2]>::try_from(bytes).ok())
        .map(|bytes| u32::from(u16::from_le_bytes(bytes)))
        .ok_or_else(|| malformed("missing lower capabilities"))?;
    cursor += 2;

    let mut charset = 0u8;
    if let Some(&value) = payload.get(cursor) {
        charset = value;
        cursor += 1;
    }

    cursor += 2; // status flags
    if let Some(upper) = payload
        .get(cursor..cursor + 2)
        .and_then(|bytes| <[u8; 2]>::try_from(bytes).ok())
    {
        capabilities |= u32::from(u16::from_le_bytes(upper)) << 16;
    }

    Ok((capabilities, charset))
}

async fn build_tls_connector(
    tls: &TlsConfig,
) -> Result<(TlsConnector, CertCapturingVerifier), ProbeError> {
    ensure_crypto_provider();

    let roots = match &tls.ca {
        Some(ca) => load_root_store(ca).await?,
        None => webpki_roots::TLS_SERVER_ROOTS.iter().cloned().collect(),
    };
    let verifier = CertCapturingVerifier::new(tls.mode, roots, tls.server_cert_dn.clone())?;

    let builder = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier.clone()));

    let config = if let (Some(cert_path), Some(key_path)) = (&tls.cert, &tls.key) {
        let certs = load_cert_chain(cert_path).await?;
        let key = load_private_key(key_path).await?;
        builder
            .with_client_auth_cert(certs, key)
            .map_err(|e| ProbeError::Tls(format!("invalid client certificate: {e}")))?
    } else {
        builder.with_no_client_auth()
    };

    Ok((TlsConnector::from(Arc::new(config)), verifier))
}

async fn load_root_store(path: &Path) -> Result<RootCertStore, ProbeError> {
    let mut store = RootCertStore::empty();
    let (added, ignored) = store.add_parsable_certificates(load_cert_chain(path).await?);
    debug!("loaded {added} CA certificate(s) from {}, ignored {ignored}", path.display());
    if added == 0 {
        return Err(ProbeError::Tls(format!(
            "no usable CA certificates in {}",
            path.display()
        )));
    }
    Ok(store)
}

async fn load_cert_chain(path: &Path) -> Result<Vec<CertificateDer<'static>>, ProbeError> {
    let data = fs::read(path).await.map_err(|e| {
        ProbeError::Tls(format!("failed to read certificate {}: {e}", path.display()))
    })?;
    let mut reader = Cursor::new(data);
    let parsed = certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ProbeError::Tls(format!("invalid certificate PEM: {e}")))?;

    if parsed.is_empty() {
        return Err(ProbeError::Tls(format!(
            "no certificates found in {}",
            path.display()
        )));
    }

    Ok(parsed)
}

async fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, ProbeError> {
    let data = fs::read(path).await.map_err(|e| {
        ProbeError::Tls(format!("failed to read private key {}: {e}", path.display()))
    })?;

    let mut reader = Cursor::new(data);
    private_key(&mut reader)
        .map_err(|e| ProbeError::Tls(format!("invalid private key PEM: {e}")))?
        .ok_or_else(|| ProbeError::Tls(format!("no private key found in {}", path.display())))
}

fn server_name_from_host(host: &str) -> Result<ServerName<'static>, ProbeError> {
    host.parse::<IpAddr>().map_or_else(
        |_| {
            ServerName::try_from(host.to_string())
                .map_err(|_| ProbeError::InvalidDescriptor(format!("invalid server name: {host}")))
        },
        |ip| Ok(ServerName::from(ip)),
    )
}

fn peer(stream: &TcpStream) -> String {
    stream
        .peer_addr()
        .map_or_else(|_| "unknown peer".to_string(), |addr| addr.to_string())
}

fn protocol_name(version: ProtocolVersion) -> String {
    match version {
        ProtocolVersion::TLSv1_3 => "TLSv1.3".to_string(),
        ProtocolVersion::TLSv1_2 => "TLSv1.2".to_string(),
        other => format!("{other:?}"),
    }
}

fn extract_metadata(stream: &TlsStream<TcpStream>) -> TlsMetadata {
    let (_, connection) = stream.get_ref();

    let mut metadata = connection
        .peer_certificates()
        .and_then(<[_]>::first)
        .and_then(|cert| metadata_from_der(cert.as_ref()))
        .map(TlsMetadata::from)
        .unwrap_or_default();

    metadata.version = connection.protocol_version().map(protocol_name);
    metadata.cipher = connection
        .negotiated_cipher_suite()
        .map(|suite| format!("{:?}", suite.suite()));
    metadata
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, clippy::indexing_slicing)]

    use super::*;
    use crate::error::ErrorKind;
    use std::time::Duration;
    use tokio::net::TcpListener;

    fn mysql_greeting(capabilities: u16) -> Vec<u8> {
        let mut payload = vec![10u8]; // protocol version
        payload.extend_from_slice(b"8.0.36\0");
        payload.extend_from_slice(&[0u8; 4]); // connection id
        payload.extend_from_slice(&[0u8; 8]); // auth plugin data part 1
        payload.push(0); // filler
        payload.extend_from_slice(&capabilities.to_le_bytes());
        payload
    }

    fn descriptor(url: &str) -> ConnectDescriptor {
        ConnectDescriptor::parse(url, Driver::Postgres).unwrap()
    }

    #[test]
    fn test_crypto_provider_init() {
        ensure_crypto_provider();
        ensure_crypto_provider();
    }

    #[test]
    fn test_server_name_from_host() {
        assert!(server_name_from_host("db.example.com").is_ok());
        assert!(server_name_from_host("127.0.0.1").is_ok());
        assert!(server_name_from_host("2001:db8::1").is_ok());
        assert!(server_name_from_host("").is_err());
        assert!(server_name_from_host("invalid host name with spaces").is_err());
    }

    #[test]
    fn test_parse_mysql_handshake() {
        let (capabilities, charset) = parse_mysql_handshake(&mysql_greeting(0x0800)).unwrap();
        assert!(capabilities & MYSQL_CLIENT_SSL != 0);
        assert_eq!(charset, 0);

        assert!(parse_mysql_handshake(&[]).is_err());
        assert!(parse_mysql_handshake(&[10u8]).is_err());
    }

    #[test]
    fn test_parse_mysql_handshake_upper_capabilities() {
        let mut payload = mysql_greeting(0x0800);
        payload.push(0x2d); // charset
        payload.extend_from_slice(&[0x02, 0x00]); // status flags
        payload.extend_from_slice(&0x0008u16.to_le_bytes()); // CLIENT_PLUGIN_AUTH >> 16
        let (capabilities, charset) = parse_mysql_handshake(&payload).unwrap();
        assert_eq!(charset, 0x2d);
        assert!(capabilities & MYSQL_CLIENT_PLUGIN_AUTH != 0);
    }

    #[test]
    fn test_parse_mysql_error_packet() {
        let mut payload = vec![0xff, 0x69, 0x04];
        payload.extend_from_slice(b"#HY000Host '10.0.0.1' is blocked");
        let err = parse_mysql_handshake(&payload).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
        assert!(err.to_string().contains("is blocked"));
    }

    #[test]
    fn test_mysql_ssl_request_layout() {
        let packet = mysql_ssl_request(MYSQL_CLIENT_SSL | MYSQL_CLIENT_PROTOCOL_41, 0);
        assert_eq!(packet.len(), 36);
        assert_eq!(&packet[..4], &[32, 0, 0, 1]);
        assert_eq!(packet[12], 0x21);
    }

    #[test]
    fn test_protocol_name() {
        assert_eq!(protocol_name(ProtocolVersion::TLSv1_3), "TLSv1.3");
        assert_eq!(protocol_name(ProtocolVersion::TLSv1_2), "TLSv1.2");
    }

    #[tokio::test]
    async fn test_plain_tcp_reachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let d = descriptor(&format!("postgres://u:p@tcp(127.0.0.1:{port})/db?sslmode=disable"));
        assert_eq!(probe(&d, d.attempt_deadline()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_postgres_refusing_tls() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 8];
            socket.read_exact(&mut request).await.unwrap();
            socket.write_all(b"N").await.unwrap();
        });

        let d = descriptor(&format!("postgres://u:p@tcp(127.0.0.1:{port})/db?sslmode=require"));
        let err = probe(&d, d.attempt_deadline()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Tls);
    }

    #[tokio::test]
    async fn test_closed_port_is_network_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut d = descriptor(&format!("postgres://u:p@tcp(127.0.0.1:{port})/db?sslmode=require"));
        d.connect_timeout = Duration::from_secs(2);
        let err = probe(&d, d.attempt_deadline()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Network);
        assert!(err.is_transient());
    }
}
