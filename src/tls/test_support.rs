use std::{
    collections::VecDeque,
    fs,
    io::{self, Read, Write},
    path::PathBuf,
    process,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use rcgen::{CertificateParams, KeyPair};
use rustls::{
    ClientConfig, ClientConnection, DEFAULT_VERSIONS, RootCertStore, SupportedProtocolVersion,
    crypto::ring,
    pki_types::{CertificateDer, PrivateKeyDer, ServerName},
};

use crate::tls::credentials::Credentials;

/// A freshly generated self-signed certificate and its key, in every encoding the tests need.
pub(crate) struct Identity {
    pub cert_der: CertificateDer<'static>,
    pub cert_pem: String,
    pub key_der: PrivateKeyDer<'static>,
    pub key_pem: String,
}

impl Identity {
    pub(crate) fn generate(name: &str) -> Self {
        let key = KeyPair::generate().unwrap();
        let cert = CertificateParams::new(vec![name.to_owned()])
            .unwrap()
            .self_signed(&key)
            .unwrap();
        Self {
            cert_der: cert.der().clone(),
            cert_pem: cert.pem(),
            key_der: PrivateKeyDer::Pkcs8(key.serialize_der().into()),
            key_pem: key.serialize_pem(),
        }
    }

    /// The RSA pair under `testcert/`.
    pub(crate) fn rsa() -> Self {
        let cert_pem = include_str!("testcert/cert.pem").to_owned();
        let key_pem = include_str!("testcert/key.pem").to_owned();
        let cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
            .next()
            .unwrap()
            .unwrap();
        let key_der = rustls_pemfile::private_key(&mut key_pem.as_bytes())
            .unwrap()
            .unwrap();
        Self {
            cert_der,
            cert_pem,
            key_der,
            key_pem,
        }
    }

    pub(crate) fn credentials(&self) -> Credentials {
        Credentials::from_der(vec![self.cert_der.clone()], self.key_der.clone_key()).unwrap()
    }
}

/// Writes `bytes` to a fresh file under the temp directory and returns its path.
pub(crate) fn write_temp(name: &str, bytes: &[u8]) -> PathBuf {
    static NEXT: AtomicUsize = AtomicUsize::new(0);
    let dir = std::env::temp_dir().join(format!(
        "tlsterm-{}-{}",
        process::id(),
        NEXT.fetch_add(1, Ordering::Relaxed)
    ));
    fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    fs::write(&path, bytes).unwrap();
    path
}

#[derive(Debug, Default)]
struct Channel {
    bytes: VecDeque<u8>,
    closed: bool,
    capacity: Option<usize>,
}

/// One end of an in-memory, non-blocking byte pipe.
///
/// Reads on an empty, open channel and writes into a full channel report
/// `WouldBlock` the way a non-blocking socket does.
#[derive(Debug, Clone)]
pub(crate) struct PipeEnd {
    inbound: Arc<Mutex<Channel>>,
    outbound: Arc<Mutex<Channel>>,
}

/// An unbounded pipe.
pub(crate) fn pipe() -> (PipeEnd, PipeEnd) {
    let forward = Arc::new(Mutex::new(Channel::default()));
    let backward = Arc::new(Mutex::new(Channel::default()));
    (
        PipeEnd {
            inbound: Arc::clone(&forward),
            outbound: Arc::clone(&backward),
        },
        PipeEnd {
            inbound: backward,
            outbound: forward,
        },
    )
}

impl PipeEnd {
    /// Signals end-of-stream to the other end.
    pub(crate) fn close(&self) {
        self.outbound.lock().unwrap().closed = true;
    }

    /// Caps how many unread bytes the other end may queue towards this one.
    pub(crate) fn limit_inbound(&self, capacity: Option<usize>) {
        self.inbound.lock().unwrap().capacity = capacity;
    }

    /// Pushes raw bytes towards the other end, bypassing any cap.
    pub(crate) fn inject(&self, bytes: &[u8]) {
        self.outbound.lock().unwrap().bytes.extend(bytes);
    }
}

impl Read for PipeEnd {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut channel = self.inbound.lock().unwrap();
        if channel.bytes.is_empty() {
            if channel.closed {
                return Ok(0);
            }
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let n = buf.len().min(channel.bytes.len());
        for (slot, byte) in buf.iter_mut().zip(channel.bytes.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for PipeEnd {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut channel = self.outbound.lock().unwrap();
        if channel.closed {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        let room = channel
            .capacity
            .map_or(buf.len(), |cap| cap.saturating_sub(channel.bytes.len()));
        if room == 0 && !buf.is_empty() {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let n = room.min(buf.len());
        channel.bytes.extend(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Client configuration that trusts `server` and optionally authenticates as `identity`.
pub(crate) fn client_config(server: &Identity, identity: Option<&Identity>) -> Arc<ClientConfig> {
    client_config_with_versions(server, identity, DEFAULT_VERSIONS)
}

/// Like [`client_config`], restricted to `versions`.
pub(crate) fn client_config_with_versions(
    server: &Identity,
    identity: Option<&Identity>,
    versions: &[&'static SupportedProtocolVersion],
) -> Arc<ClientConfig> {
    let mut roots = RootCertStore::empty();
    roots.add(server.cert_der.clone()).unwrap();
    let builder = ClientConfig::builder_with_provider(Arc::new(ring::default_provider()))
        .with_protocol_versions(versions)
        .unwrap()
        .with_root_certificates(roots);
    let config = match identity {
        Some(id) => builder
            .with_client_auth_cert(vec![id.cert_der.clone()], id.key_der.clone_key())
            .unwrap(),
        None => builder.with_no_client_auth(),
    };
    Arc::new(config)
}

/// A rustls client driven by hand over a [`PipeEnd`].
pub(crate) struct Client {
    pub conn: ClientConnection,
    pub end: PipeEnd,
}

impl Client {
    /// A client that trusts `server` and optionally authenticates as `identity`.
    pub(crate) fn new(server: &Identity, identity: Option<&Identity>, end: PipeEnd) -> Self {
        Self::with_config(client_config(server, identity), end)
    }

    /// A client using a prepared configuration.
    pub(crate) fn with_config(config: Arc<ClientConfig>, end: PipeEnd) -> Self {
        let name = ServerName::try_from("localhost").unwrap();
        Self {
            conn: ClientConnection::new(config, name).unwrap(),
            end,
        }
    }

    /// Moves whatever can move in both directions without blocking.
    pub(crate) fn pump(&mut self) -> Result<(), rustls::Error> {
        while self.conn.wants_write() {
            match self.conn.write_tls(&mut self.end) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => panic!("client write failed: {e}"),
            }
        }
        loop {
            match self.conn.read_tls(&mut self.end) {
                Ok(0) => break,
                Ok(_) => {
                    self.conn.process_new_packets()?;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => panic!("client read failed: {e}"),
            }
        }
        while self.conn.wants_write() {
            match self.conn.write_tls(&mut self.end) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => panic!("client write failed: {e}"),
            }
        }
        Ok(())
    }

    /// Queues plaintext and pushes it onto the pipe.
    pub(crate) fn send(&mut self, data: &[u8]) {
        self.conn.writer().write_all(data).unwrap();
        self.pump().unwrap();
    }

    /// Drains all plaintext the client has decrypted so far.
    pub(crate) fn received(&mut self) -> Vec<u8> {
        self.pump().unwrap();
        let mut out = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            match self.conn.reader().read(&mut buf) {
                Ok(0) => break,
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => panic!("client plaintext read failed: {e}"),
            }
        }
        out
    }
}
