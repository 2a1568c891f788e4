//! TLS trust policy and transport probing
//!
//! - `config` - trust modes and certificate files
//! - `metadata` - what the handshake negotiated
//! - `verifier` - certificate verifier applying the trust mode
//! - `handshake` - TCP connect, STARTTLS and TLS handshake

pub mod config;
pub mod handshake;
pub mod metadata;
pub mod verifier;

pub use config::{TlsConfig, TlsMode};
pub use handshake::{ensure_crypto_provider, probe};
pub use metadata::TlsMetadata;
pub use verifier::{CapturedCertMetadata, CertCapturingVerifier, dn_matches};
