use crate::{
    runtime::server::ServerError,
    tls::{connection::ConnectionId, fingerprint::Fingerprint, verifier::PeerVerification},
};

/// What the server knows about the peer once its handshake is complete.
#[derive(Debug, Clone)]
pub struct Peer {
    /// The connection's log identifier.
    pub id: ConnectionId,
    /// Fingerprint of the peer's certificate, if it sent one.
    pub fingerprint: Option<Fingerprint>,
    /// How the peer's certificate fared against the trust anchors.
    pub verification: PeerVerification,
}

/// A trait that determines what the server does with decrypted application data.
pub trait Handler: Send + Sync {
    /// Handles one chunk of plaintext from `peer`.
    ///
    /// Returns the bytes to send back, or `None` to close the connection.
    ///
    /// # Errors
    /// Returns a `ServerError` if processing fails. The connection is then closed.
    fn call(
        &self,
        peer: &Peer,
        data: &[u8],
    ) -> impl Future<Output = Result<Option<Vec<u8>>, ServerError>> + Send;
}
