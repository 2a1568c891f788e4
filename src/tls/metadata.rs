use serde::Serialize;

/// TLS session metadata captured during the transport handshake
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TlsMetadata {
    /// TLS protocol version (e.g., "TLSv1.3")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Cipher suite used (e.g., `TLS13_AES_256_GCM_SHA384`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cipher: Option<String>,
    /// Certificate subject DN
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cert_subject: Option<String>,
    /// Certificate issuer DN
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cert_issuer: Option<String>,
    /// Days until certificate expiration (negative if expired)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cert_expiry_days: Option<i64>,
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn test_tls_metadata_default() {
        let metadata = TlsMetadata::default();
        assert!(metadata.version.is_none());
        assert!(metadata.cipher.is_none());
        assert!(metadata.cert_subject.is_none());
        assert!(metadata.cert_issuer.is_none());
        assert!(metadata.cert_expiry_days.is_none());
    }

    #[test]
    fn test_tls_metadata_serialize_skips_missing() {
        let metadata = TlsMetadata {
            version: Some("TLSv1.3".to_string()),
            cert_expiry_days: Some(90),
            ..Default::default()
        };

        let json = serde_json::to_value(&metadata).unwrap();
        assert_eq!(json["version"], "TLSv1.3");
        assert_eq!(json["cert_expiry_days"], 90);
        assert!(json.get("cipher").is_none());
    }
}
