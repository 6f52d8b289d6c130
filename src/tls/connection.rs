use std::{
    fmt,
    io::{self, Read, Write},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use rustls::{
    CipherSuite, ProtocolVersion, ServerConfig, ServerConnection, server::StoresServerSessions,
};
use tracing::{debug, info, trace, warn};

use crate::tls::{
    error::{HandshakeFailure, RecordError},
    fingerprint::Fingerprint,
    handshake::{HandshakeState, HandshakeStatus, Step},
    verifier::{OptionalClientVerifier, PeerVerification},
};

static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Process-unique connection identifier, used to correlate log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub(crate) fn next() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Outcome of a single Record I/O call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoStatus {
    /// This many plaintext bytes were read or accepted for sending.
    Transferred(usize),
    /// No plaintext is available and the transport has nothing to read. Retry once it is readable.
    WouldBlockRead,
    /// The transport cannot take more ciphertext. Retry once it is writable.
    WouldBlockWrite,
    /// The peer ended the stream with a close notification.
    Closed,
}

/// Parameters agreed during the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiated {
    /// The protocol version in use.
    pub version: ProtocolVersion,
    /// The cipher suite in use.
    pub suite: CipherSuite,
    /// The host name the client asked for, if it sent one.
    pub server_name: Option<String>,
}

/// A server-side TLS connection over a caller-owned, non-blocking transport.
///
/// Owns the configuration snapshot, the session record, the engine context
/// and the transport. None of them are reachable on their own, and
/// [`TlsConnection::destroy`] consumes the connection, so teardown happens
/// exactly once and nothing can use the connection afterwards.
pub struct TlsConnection<T: Read + Write> {
    id: ConnectionId,
    config: Arc<ServerConfig>,
    session: Arc<dyn StoresServerSessions + Send + Sync>,
    context: ServerConnection,
    verifier: Arc<OptionalClientVerifier>,
    transport: T,
    state: HandshakeState,
    failure: Option<HandshakeFailure>,
    peer: Option<PeerVerification>,
}

impl<T: Read + Write> fmt::Debug for TlsConnection<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConnection")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("failure", &self.failure)
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

impl<T: Read + Write> TlsConnection<T> {
    pub(crate) fn new(
        config: Arc<ServerConfig>,
        verifier: Arc<OptionalClientVerifier>,
        transport: T,
    ) -> Result<Self, rustls::Error> {
        let context = ServerConnection::new(Arc::clone(&config))?;
        let session = Arc::clone(&config.session_storage);
        Ok(Self {
            id: ConnectionId::next(),
            config,
            session,
            context,
            verifier,
            transport,
            state: HandshakeState::NotStarted,
            failure: None,
            peer: None,
        })
    }

    /// The connection's log identifier.
    #[must_use]
    pub const fn id(&self) -> ConnectionId {
        self.id
    }

    /// Where the handshake currently stands.
    #[must_use]
    pub const fn state(&self) -> HandshakeState {
        self.state
    }

    /// Why the handshake failed, once it has.
    #[must_use]
    pub const fn failure(&self) -> Option<&HandshakeFailure> {
        self.failure.as_ref()
    }

    /// The transport the connection reads from and writes to.
    #[must_use]
    pub const fn transport(&self) -> &T {
        &self.transport
    }

    #[cfg(test)]
    pub(crate) const fn config(&self) -> &Arc<ServerConfig> {
        &self.config
    }

    /// Makes as much handshake progress as the transport allows without blocking.
    ///
    /// Once the connection is established or failed, further calls return the
    /// same status and change nothing.
    pub fn advance(&mut self) -> HandshakeStatus {
        if let Some(status) = self.state.settled() {
            return status;
        }
        let step = match self.drive_handshake() {
            Ok(true) => Step::Complete,
            Ok(false) => Step::NeedsIo,
            Err(failure) => Step::Fatal(failure),
        };
        let (state, status) = self.state.apply(&step);
        self.state = state;

        match step {
            Step::NeedsIo => trace!(conn = %self.id, "Handshake would block"),
            Step::Complete => self.on_established(),
            Step::Fatal(failure) => {
                warn!(conn = %self.id, error = %failure, "Handshake failed");
                self.failure = Some(failure);
            }
        }
        status
    }

    /// Returns `Ok(true)` once the engine is done and its output has been sent.
    fn drive_handshake(&mut self) -> Result<bool, HandshakeFailure> {
        loop {
            if !self.push_ciphertext()? {
                return Ok(false);
            }
            if !self.context.is_handshaking() {
                return Ok(true);
            }
            match self.context.read_tls(&mut self.transport) {
                Ok(0) => return Err(HandshakeFailure::PeerClosed),
                Ok(_) => self.process()?,
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
                Err(error) => return Err(error.into()),
            }
        }
    }

    fn on_established(&mut self) {
        let peer = self.verifier.assess(self.context.peer_certificates());
        if let PeerVerification::Unverified(reason) = &peer {
            debug!(conn = %self.id, %reason, "Peer certificate did not verify; continuing");
        }
        info!(
            conn = %self.id,
            version = ?self.context.protocol_version(),
            suite = ?self.context.negotiated_cipher_suite().map(|s| s.suite()),
            peer = ?peer,
            "Handshake complete"
        );
        self.peer = Some(peer);
    }

    /// Runs the engine over newly received ciphertext. On failure the engine's
    /// alert is sent on a best-effort basis.
    fn process(&mut self) -> Result<(), rustls::Error> {
        match self.context.process_new_packets() {
            Ok(_) => Ok(()),
            Err(error) => {
                let _ = self.context.write_tls(&mut self.transport);
                Err(error)
            }
        }
    }

    /// Writes queued ciphertext until none is left (`true`) or the transport would block (`false`).
    fn push_ciphertext(&mut self) -> io::Result<bool> {
        while self.context.wants_write() {
            match self.context.write_tls(&mut self.transport) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(_) => {}
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
                Err(error) => return Err(error),
            }
        }
        Ok(true)
    }

    const fn ensure_established(&self) -> Result<(), RecordError> {
        match self.state {
            HandshakeState::Established => Ok(()),
            state => Err(RecordError::NotEstablished(state)),
        }
    }

    /// Reads decrypted application data into `buffer`.
    ///
    /// # Errors
    ///
    /// Returns a `RecordError` if the connection is not established, the peer
    /// sent bad records, the transport failed, or the peer dropped the
    /// transport without a close notification.
    pub fn read(&mut self, buffer: &mut [u8]) -> Result<IoStatus, RecordError> {
        self.ensure_established()?;
        if buffer.is_empty() {
            return Ok(IoStatus::Transferred(0));
        }
        loop {
            match self.context.reader().read(buffer) {
                Ok(0) => return Ok(IoStatus::Closed),
                Ok(read) => return Ok(IoStatus::Transferred(read)),
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => {}
                Err(error) => return Err(error.into()),
            }
            match self.context.read_tls(&mut self.transport) {
                Ok(_) => {
                    self.process()?;
                    // Replies the engine owes the peer, such as key updates.
                    self.push_ciphertext()?;
                }
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(IoStatus::WouldBlockRead);
                }
                Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
                Err(error) => return Err(error.into()),
            }
        }
    }

    /// Encrypts `data` and sends as much ciphertext as the transport accepts.
    ///
    /// Ciphertext left over from an earlier call goes out first; while any of
    /// it is still stuck, no new plaintext is taken and `WouldBlockWrite` is returned.
    ///
    /// # Errors
    ///
    /// Returns a `RecordError` if the connection is not established or the transport failed.
    pub fn write(&mut self, data: &[u8]) -> Result<IoStatus, RecordError> {
        self.ensure_established()?;
        if !self.push_ciphertext()? {
            return Ok(IoStatus::WouldBlockWrite);
        }
        let accepted = self.context.writer().write(data)?;
        if accepted == 0 && !data.is_empty() {
            return Ok(IoStatus::WouldBlockWrite);
        }
        self.push_ciphertext()?;
        Ok(IoStatus::Transferred(accepted))
    }

    /// Sends ciphertext queued by earlier writes. Reports `Transferred(0)` once nothing is left.
    ///
    /// # Errors
    ///
    /// Returns a `RecordError` if the connection is not established or the transport failed.
    pub fn flush(&mut self) -> Result<IoStatus, RecordError> {
        self.ensure_established()?;
        if self.push_ciphertext()? {
            Ok(IoStatus::Transferred(0))
        } else {
            Ok(IoStatus::WouldBlockWrite)
        }
    }

    /// Whether decrypted application data is already buffered, so a `read`
    /// would return it without touching the transport.
    pub fn has_pending_data(&mut self) -> bool {
        if self.state != HandshakeState::Established {
            return false;
        }
        match self.context.process_new_packets() {
            Ok(io) => io.plaintext_bytes_to_read() > 0,
            Err(error) => {
                debug!(conn = %self.id, %error, "Buffered records rejected; the next read reports it");
                false
            }
        }
    }

    /// Whether ciphertext is waiting for the transport to become writable.
    #[must_use]
    pub fn wants_write(&self) -> bool {
        self.context.wants_write()
    }

    /// SHA-1 of the peer's leaf certificate, or `None` if the peer presented none.
    #[must_use]
    pub fn fingerprint(&self) -> Option<Fingerprint> {
        self.context
            .peer_certificates()
            .and_then(<[_]>::first)
            .map(|leaf| Fingerprint::of(leaf))
    }

    /// How the peer's certificate fared against the trust anchors. `None` until established.
    #[must_use]
    pub const fn peer_verification(&self) -> Option<&PeerVerification> {
        self.peer.as_ref()
    }

    /// Version, cipher suite and requested host name. `None` until established.
    #[must_use]
    pub fn negotiated(&self) -> Option<Negotiated> {
        if self.state != HandshakeState::Established {
            return None;
        }
        Some(Negotiated {
            version: self.context.protocol_version()?,
            suite: self.context.negotiated_cipher_suite()?.suite(),
            server_name: self.context.server_name().map(str::to_owned),
        })
    }

    /// Queues a close notification and makes one attempt to send it.
    ///
    /// Returns whether everything queued reached the transport.
    pub fn shutdown(&mut self) -> bool {
        self.context.send_close_notify();
        match self.push_ciphertext() {
            Ok(flushed) => flushed,
            Err(error) => {
                debug!(conn = %self.id, %error, "Close notification not sent");
                false
            }
        }
    }

    /// Releases the configuration, the session record and the engine context,
    /// in that order, and hands back the transport.
    pub fn destroy(self) -> T {
        let Self {
            id,
            config,
            session,
            context,
            verifier,
            transport,
            ..
        } = self;
        drop(config);
        drop(session);
        drop(context);
        drop(verifier);
        debug!(conn = %id, "Connection destroyed");
        transport
    }
}
