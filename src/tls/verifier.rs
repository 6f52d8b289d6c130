//! Peer certificate policy: request a certificate, check it, never reject on it.
//!
//! Clients may present self-signed or otherwise unverifiable certificates and
//! still complete the handshake. The chain check is run anyway so its outcome
//! can be logged and reported through [`PeerVerification`]. Handshake
//! signatures are still checked by the engine: a peer must hold the key for
//! the certificate it presents.

use std::sync::Arc;

use rustls::{
    DigitallySignedStruct, DistinguishedName, Error as TlsError, RootCertStore, SignatureScheme,
    client::danger::HandshakeSignatureValid,
    crypto::CryptoProvider,
    pki_types::{CertificateDer, UnixTime},
    server::{
        WebPkiClientVerifier,
        danger::{ClientCertVerified, ClientCertVerifier},
    },
};
use tracing::{debug, warn};

use crate::tls::{credentials::Credentials, error::SetupError};

/// Outcome of checking the peer's certificate against the trust anchors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerVerification {
    /// The peer sent no certificate.
    NotPresented,
    /// The peer's chain leads to one of the trust anchors.
    Verified,
    /// The peer's chain did not verify. The handshake went ahead regardless.
    Unverified(String),
}

/// Client certificate verifier that reports failures instead of aborting the handshake.
#[derive(Debug)]
pub struct OptionalClientVerifier {
    inner: Arc<dyn ClientCertVerifier>,
}

impl OptionalClientVerifier {
    /// Builds a verifier whose trust anchors are the server's own certificate chain.
    ///
    /// # Errors
    ///
    /// Returns a `SetupError` if no certificate in the chain can serve as a trust anchor.
    pub fn new(credentials: &Credentials, provider: Arc<CryptoProvider>) -> Result<Self, SetupError> {
        let mut roots = RootCertStore::empty();
        let (added, ignored) = roots.add_parsable_certificates(credentials.chain().iter().cloned());
        if ignored > 0 {
            warn!(added, ignored, "Some chain certificates are unusable as trust anchors");
        }
        let inner = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider)
            .allow_unauthenticated()
            .build()?;
        Ok(Self { inner })
    }

    /// Re-runs the chain check on a completed handshake's peer certificates.
    #[must_use]
    pub fn assess(&self, peer_chain: Option<&[CertificateDer<'_>]>) -> PeerVerification {
        let Some((end_entity, intermediates)) = peer_chain.and_then(<[_]>::split_first) else {
            return PeerVerification::NotPresented;
        };
        match self
            .inner
            .verify_client_cert(end_entity, intermediates, UnixTime::now())
        {
            Ok(_) => PeerVerification::Verified,
            Err(error) => PeerVerification::Unverified(error.to_string()),
        }
    }
}

impl ClientCertVerifier for OptionalClientVerifier {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        false
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        self.inner.root_hint_subjects()
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> Result<ClientCertVerified, TlsError> {
        // Self-signed and unknown issuers are accepted.
        if let Err(error) = self.inner.verify_client_cert(end_entity, intermediates, now) {
            debug!(%error, "Accepting unverified peer certificate");
        }
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}
