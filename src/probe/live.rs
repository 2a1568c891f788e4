use super::{Connected, Connector};
use crate::{
    credentials::Credentials, descriptor::ConnectDescriptor, driver::DbSession, error::ProbeError,
    tls,
};
use secrecy::ExposeSecret;
use tracing::debug;

/// Connector reaching a real database: transport probe, then a `sqlx` session
///
/// Both stages of an attempt share one `connect_timeout` budget.
#[derive(Debug, Clone, Copy, Default)]
pub struct LiveConnector;

impl Connector for LiveConnector {
    type Session = DbSession;

    async fn connect(
        &self,
        descriptor: &ConnectDescriptor,
        credentials: &Credentials,
    ) -> Result<Connected<DbSession>, ProbeError> {
        let deadline = descriptor.attempt_deadline();
        let tls = tls::probe(descriptor, deadline).await?;
        if let Some(metadata) = &tls {
            debug!(
                version = metadata.version.as_deref().unwrap_or("unknown"),
                cipher = metadata.cipher.as_deref().unwrap_or("unknown"),
                "TLS negotiated with {}",
                descriptor.address()
            );
        }

        let session = DbSession::open(
            descriptor,
            &credentials.username,
            credentials.password.expose_secret(),
            deadline,
        )
        .await?;

        Ok(Connected { session, tls })
    }
}
