use super::{TlsMetadata, TlsMode};
use crate::error::ProbeError;
use chrono::Utc;
use rustls::{
    CertificateError, DigitallySignedStruct, Error as TlsError, RootCertStore, SignatureScheme,
    client::{
        WebPkiServerVerifier,
        danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    },
    crypto::{WebPkiSupportedAlgorithms, verify_tls12_signature, verify_tls13_signature},
    pki_types::{CertificateDer, ServerName, UnixTime},
};
use std::{
    collections::BTreeSet,
    fmt,
    sync::{Arc, Mutex},
};
use x509_parser::prelude::{FromDer, X509Certificate};

/// Certificate metadata captured during TLS handshake
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedCertMetadata {
    pub subject: Option<String>,
    pub issuer: Option<String>,
    pub expiry_days: Option<i64>,
}

impl From<CapturedCertMetadata> for TlsMetadata {
    fn from(captured: CapturedCertMetadata) -> Self {
        Self {
            cert_subject: captured.subject,
            cert_issuer: captured.issuer,
            cert_expiry_days: captured.expiry_days,
            ..Default::default()
        }
    }
}

/// Server certificate verifier applying the descriptor's trust policy while
/// capturing the presented certificate's metadata.
///
/// - `require`: only handshake signatures are checked, any certificate is accepted
///   unless an expected DN is configured, in which case the subject must match
/// - `verify-ca`: the chain must lead to a trusted root, the hostname is not checked
/// - `verify-full`: chain and hostname, or chain and subject DN when an expected
///   DN is configured
#[derive(Clone)]
pub struct CertCapturingVerifier {
    mode: TlsMode,
    /// Captured certificate metadata (shared with the caller)
    captured: Arc<Mutex<Option<CapturedCertMetadata>>>,
    /// Chain validation, absent in `require` mode
    inner_verifier: Option<Arc<WebPkiServerVerifier>>,
    algorithms: WebPkiSupportedAlgorithms,
    expected_dn: Option<String>,
}

impl fmt::Debug for CertCapturingVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertCapturingVerifier")
            .field("mode", &self.mode)
            .field("captured", &self.captured)
            .field("expected_dn", &self.expected_dn)
            .finish_non_exhaustive()
    }
}

impl CertCapturingVerifier {
    /// # Errors
    ///
    /// Returns a TLS error if the `WebPKI` verifier cannot be built (e.g. no usable roots)
    pub fn new(
        mode: TlsMode,
        roots: RootCertStore,
        expected_dn: Option<String>,
    ) -> Result<Self, ProbeError> {
        let provider = rustls::crypto::ring::default_provider();
        let algorithms = provider.signature_verification_algorithms;

        let inner_verifier = if mode.verifies_chain() {
            let verifier =
                WebPkiServerVerifier::builder_with_provider(Arc::new(roots), Arc::new(provider))
                    .build()
                    .map_err(|e| ProbeError::Tls(format!("failed to build WebPKI verifier: {e}")))?;
            Some(verifier)
        } else {
            None
        };

        Ok(Self {
            mode,
            captured: Arc::new(Mutex::new(None)),
            inner_verifier,
            algorithms,
            expected_dn,
        })
    }

    /// Metadata of the last certificate presented, `None` before the handshake
    #[must_use]
    pub fn get_captured(&self) -> Option<CapturedCertMetadata> {
        self.captured.lock().ok()?.clone()
    }

    fn check_expected_dn(&self, subject: Option<&str>) -> Result<(), TlsError> {
        let Some(expected) = &self.expected_dn else {
            return Ok(());
        };
        match subject {
            Some(subject) if dn_matches(expected, subject) => Ok(()),
            Some(subject) => Err(TlsError::General(format!(
                "server certificate subject \"{subject}\" does not match ssl_server_cert_dn \"{expected}\""
            ))),
            None => Err(TlsError::General(
                "server certificate subject could not be read".to_string(),
            )),
        }
    }
}

/// Subject, issuer and days to expiry of a DER-encoded certificate
pub(crate) fn metadata_from_der(cert_der: &[u8]) -> Option<CapturedCertMetadata> {
    let (_, cert) = X509Certificate::from_der(cert_der).ok()?;

    let raw = cert.validity().not_after.to_datetime();
    let expiry_days =
        chrono::DateTime::<Utc>::from_timestamp(raw.unix_timestamp(), raw.nanosecond())
            .map(|not_after| (not_after - Utc::now()).num_days());

    Some(CapturedCertMetadata {
        subject: Some(cert.subject().to_string()),
        issuer: Some(cert.issuer().to_string()),
        expiry_days,
    })
}

/// Hostname mismatches are tolerated when the name is not what we verify
fn is_name_mismatch(err: &TlsError) -> bool {
    matches!(
        err,
        TlsError::InvalidCertificate(
            CertificateError::NotValidForName | CertificateError::NotValidForNameContext { .. }
        )
    )
}

/// Compare two distinguished names as sets of `TYPE=value` components
///
/// Order, spacing and attribute type case are ignored, so
/// `CN=db,O=Example,C=US` matches `C=US, O=Example, CN=db`.
#[must_use]
pub fn dn_matches(expected: &str, actual: &str) -> bool {
    let expected = dn_components(expected);
    !expected.is_empty() && expected == dn_components(actual)
}

fn dn_components(dn: &str) -> BTreeSet<(String, String)> {
    dn.split([',', '+'])
        .filter_map(|component| {
            let (key, value) = component.split_once('=')?;
            Some((key.trim().to_uppercase(), value.trim().to_string()))
        })
        .collect()
}

impl ServerCertVerifier for CertCapturingVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, TlsError> {
        let metadata = metadata_from_der(end_entity.as_ref());
        let subject = metadata.as_ref().and_then(|m| m.subject.clone());
        if let Ok(mut captured) = self.captured.lock() {
            *captured = metadata;
        }

        let Some(inner) = &self.inner_verifier else {
            self.check_expected_dn(subject.as_deref())?;
            return Ok(ServerCertVerified::assertion());
        };

        let skip_hostname = self.mode == TlsMode::VerifyCA || self.expected_dn.is_some();
        match inner.verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
        {
            Ok(verified) => {
                self.check_expected_dn(subject.as_deref())?;
                Ok(verified)
            }
            Err(err) if skip_hostname && is_name_mismatch(&err) => {
                self.check_expected_dn(subject.as_deref())?;
                Ok(ServerCertVerified::assertion())
            }
            Err(err) => Err(err),
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    const SERVER_PEM: &[u8] = include_bytes!("../../tests/fixtures/server.pem");

    fn web_roots() -> RootCertStore {
        webpki_roots::TLS_SERVER_ROOTS.iter().cloned().collect()
    }

    fn server_cert() -> CertificateDer<'static> {
        let mut reader = SERVER_PEM;
        rustls_pemfile::certs(&mut reader).next().unwrap().unwrap()
    }

    fn verify(verifier: &CertCapturingVerifier) -> Result<ServerCertVerified, TlsError> {
        let name = ServerName::try_from("localhost").unwrap();
        verifier.verify_server_cert(&server_cert(), &[], &name, &[], UnixTime::now())
    }

    #[test]
    fn test_verifier_creation_per_mode() {
        for mode in [TlsMode::Require, TlsMode::VerifyCA, TlsMode::VerifyFull] {
            let verifier = CertCapturingVerifier::new(mode, web_roots(), None).unwrap();
            assert_eq!(verifier.inner_verifier.is_some(), mode.verifies_chain());
            assert!(!verifier.supported_verify_schemes().is_empty());
        }
    }

    #[test]
    fn test_require_mode_needs_no_roots() {
        assert!(CertCapturingVerifier::new(TlsMode::Require, RootCertStore::empty(), None).is_ok());
        assert!(
            CertCapturingVerifier::new(TlsMode::VerifyFull, RootCertStore::empty(), None).is_err()
        );
    }

    #[test]
    fn test_captured_initially_none() {
        let verifier = CertCapturingVerifier::new(TlsMode::Require, web_roots(), None).unwrap();
        assert!(verifier.get_captured().is_none());
    }

    #[test]
    fn test_garbage_certificate_yields_no_metadata() {
        assert!(metadata_from_der(b"not a certificate").is_none());
    }

    #[test]
    fn test_metadata_conversion() {
        let captured = CapturedCertMetadata {
            subject: Some("CN=example.com".to_string()),
            issuer: Some("CN=CA".to_string()),
            expiry_days: Some(90),
        };

        let tls_metadata: TlsMetadata = captured.clone().into();
        assert_eq!(tls_metadata.cert_subject, captured.subject);
        assert_eq!(tls_metadata.cert_issuer, captured.issuer);
        assert_eq!(tls_metadata.cert_expiry_days, captured.expiry_days);
        assert!(tls_metadata.version.is_none());
    }

    #[test]
    fn test_dn_matches_ignores_order_and_spacing() {
        assert!(dn_matches(
            "CN=adb.example.com,OU=Database,O=Example Corp,C=US",
            "C=US, O=Example Corp, OU=Database, CN=adb.example.com"
        ));
        assert!(dn_matches("cn=db", "CN=db"));
        assert!(!dn_matches("CN=db,O=Example", "CN=db"));
        assert!(!dn_matches("CN=db", "CN=other"));
        assert!(!dn_matches("", "CN=db"));
    }

    #[test]
    fn test_expected_dn_check() {
        let verifier = CertCapturingVerifier::new(
            TlsMode::VerifyFull,
            web_roots(),
            Some("CN=db,O=Example".to_string()),
        )
        .unwrap();
        assert!(verifier.check_expected_dn(Some("O=Example, CN=db")).is_ok());
        assert!(verifier.check_expected_dn(Some("CN=evil")).is_err());
        assert!(verifier.check_expected_dn(None).is_err());

        let verifier = CertCapturingVerifier::new(TlsMode::VerifyFull, web_roots(), None).unwrap();
        assert!(verifier.check_expected_dn(None).is_ok());
    }

    #[test]
    fn test_name_mismatch_detection() {
        assert!(is_name_mismatch(&TlsError::InvalidCertificate(
            CertificateError::NotValidForName
        )));
        assert!(!is_name_mismatch(&TlsError::InvalidCertificate(
            CertificateError::UnknownIssuer
        )));
    }

    #[test]
    fn test_require_mode_enforces_expected_dn() {
        let verifier = CertCapturingVerifier::new(
            TlsMode::Require,
            RootCertStore::empty(),
            Some("CN=db.example.com".to_string()),
        )
        .unwrap();
        let err = verify(&verifier).unwrap_err();
        assert!(err.to_string().contains("CN=db.example.com"));
        assert_eq!(
            verifier.get_captured().and_then(|c| c.subject).as_deref(),
            Some("C=US, O=dbreach tests, CN=localhost")
        );

        let verifier = CertCapturingVerifier::new(
            TlsMode::Require,
            RootCertStore::empty(),
            Some("CN=localhost, O=dbreach tests, C=US".to_string()),
        )
        .unwrap();
        assert!(verify(&verifier).is_ok());
    }

    #[test]
    fn test_require_mode_accepts_untrusted_certificate() {
        let verifier =
            CertCapturingVerifier::new(TlsMode::Require, RootCertStore::empty(), None).unwrap();
        assert!(verify(&verifier).is_ok());

        let verifier = CertCapturingVerifier::new(TlsMode::VerifyFull, web_roots(), None).unwrap();
        assert!(matches!(
            verify(&verifier),
            Err(TlsError::InvalidCertificate(CertificateError::UnknownIssuer))
        ));
    }
}
