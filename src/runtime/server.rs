use std::{
    io,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use thiserror::Error;
use tokio::{
    io::Interest,
    net::{TcpListener, TcpStream},
    sync::Notify,
    task::JoinHandle,
    time::{sleep, timeout},
};
use tracing::{debug, info, warn};

use crate::{
    runtime::{
        handler::{Handler, Peer},
        transport::TokioTransport,
    },
    settings::ServerSettings,
    tls::{
        acceptor::TlsAcceptor,
        connection::{IoStatus, TlsConnection},
        error::{RecordError, SetupError},
        handshake::HandshakeStatus,
        verifier::PeerVerification,
    },
};

const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Represents the kind of error that can end a single connection.
#[derive(Error, Debug)]
pub enum ServerError {
    /// The socket failed.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// The acceptor could not build the connection.
    #[error("connection setup failed: {0}")]
    Setup(#[from] SetupError),

    /// The handshake failed. The cause has already been logged.
    #[error("handshake failed")]
    Handshake,

    /// The client did not finish its handshake in time.
    #[error("handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    /// Record I/O failed after the handshake.
    #[error("record error: {0}")]
    Record(#[from] RecordError),

    /// The handler gave up on the connection.
    #[error("handler error: {0}")]
    Handler(String),
}

/// A struct representing a running server, containing the state of the server.
#[derive(Debug)]
pub struct Server<H: Handler> {
    state: Arc<ServerState<H>>,
    local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
}

/// A struct representing the state of a server with the associated listener, whether or not the server has been closed and the handler.
#[derive(Debug)]
struct ServerState<H: Handler> {
    listener: TcpListener,
    closed: AtomicBool,
    wake: Notify,
    acceptor: Arc<TlsAcceptor>,
    handler: Arc<H>,
    handshake_timeout: Duration,
}

impl<H: Handler> Server<H> {
    /// Stops accepting new connections. Connections already accepted run to completion.
    pub fn close(&self) {
        self.state.closed.store(true, Ordering::SeqCst);
        self.state.wake.notify_one();
    }

    /// Waits for the accept loop to finish after [`Server::close`].
    pub async fn stopped(self) {
        if let Err(error) = self.accept_task.await {
            warn!(%error, "Accept loop ended abnormally");
        }
    }

    /// The address the listener is bound to.
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl<H: Handler + 'static> ServerState<H> {
    /// Accepts connections until the server is closed.
    async fn listen(self: Arc<Self>) {
        loop {
            if self.closed.load(Ordering::SeqCst) {
                info!("Server closed; no longer accepting connections");
                return;
            }
            let accepted = tokio::select! {
                () = self.wake.notified() => continue,
                accepted = self.listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, addr)) => {
                    debug!(%addr, "Accepted a new connection");
                    let state = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(error) = state.handle(stream).await {
                            debug!(%addr, %error, "Connection ended with an error");
                        }
                    });
                }
                Err(error) => {
                    if self.closed.load(Ordering::SeqCst) {
                        break;
                    }
                    warn!(%error, "Encountered error accepting connection");
                    sleep(Duration::from_millis(50)).await;
                }
            }
        }
    }

    /// Runs one connection: handshake under the timeout, then the handler loop, then teardown.
    async fn handle(&self, stream: TcpStream) -> Result<(), ServerError> {
        let mut conn = self.acceptor.create(TokioTransport::new(stream))?;

        let result = match timeout(self.handshake_timeout, handshake(&mut conn)).await {
            Ok(Ok(())) => {
                let result = exchange(&mut conn, &*self.handler).await;
                conn.shutdown();
                result
            }
            Ok(Err(error)) => Err(error),
            Err(_elapsed) => {
                warn!(conn = %conn.id(), timeout = ?self.handshake_timeout, "Handshake timed out");
                Err(ServerError::HandshakeTimeout(self.handshake_timeout))
            }
        };
        drop(conn.destroy());
        result
    }
}

/// Serves TLS connections on `settings.bind`, handing decrypted data to `handler`.
///
/// # Errors
///
/// Returns an `io::Error` if binding the TCP listener fails.
pub async fn serve<H: Handler + 'static>(
    settings: &ServerSettings,
    acceptor: Arc<TlsAcceptor>,
    handler: Arc<H>,
) -> Result<Server<H>, io::Error> {
    let listener = TcpListener::bind(settings.bind).await?;
    let local_addr = listener.local_addr()?;
    let state = Arc::new(ServerState {
        listener,
        closed: AtomicBool::new(false),
        wake: Notify::new(),
        acceptor,
        handler,
        handshake_timeout: settings.handshake_timeout(),
    });
    let state_for_task = Arc::clone(&state);
    let accept_task = tokio::spawn(async move {
        state_for_task.listen().await;
    });
    info!(%local_addr, "Listening");
    Ok(Server {
        state,
        local_addr,
        accept_task,
    })
}

/// Drives the handshake, waiting on the socket whenever it would block.
async fn handshake(conn: &mut TlsConnection<TokioTransport>) -> Result<(), ServerError> {
    loop {
        match conn.advance() {
            HandshakeStatus::Established => return Ok(()),
            HandshakeStatus::Failed => return Err(ServerError::Handshake),
            HandshakeStatus::WouldBlock => {
                let interest = if conn.wants_write() {
                    Interest::WRITABLE
                } else {
                    Interest::READABLE
                };
                conn.transport().ready(interest).await?;
            }
        }
    }
}

/// Feeds plaintext to the handler and writes its replies until either side closes.
async fn exchange<H: Handler>(
    conn: &mut TlsConnection<TokioTransport>,
    handler: &H,
) -> Result<(), ServerError> {
    let peer = Peer {
        id: conn.id(),
        fingerprint: conn.fingerprint(),
        verification: conn
            .peer_verification()
            .cloned()
            .unwrap_or(PeerVerification::NotPresented),
    };
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];

    loop {
        if !conn.has_pending_data() {
            conn.transport().ready(Interest::READABLE).await?;
        }
        match conn.read(&mut buffer)? {
            IoStatus::Transferred(n) => {
                let Some(reply) = handler.call(&peer, &buffer[..n]).await? else {
                    debug!(conn = %peer.id, "Handler closed the connection");
                    return Ok(());
                };
                write_all(conn, &reply).await?;
            }
            IoStatus::WouldBlockRead => {}
            IoStatus::WouldBlockWrite => conn.transport().ready(Interest::WRITABLE).await?,
            IoStatus::Closed => {
                debug!(conn = %peer.id, "Peer closed the connection");
                return Ok(());
            }
        }
    }
}

async fn write_all(
    conn: &mut TlsConnection<TokioTransport>,
    mut data: &[u8],
) -> Result<(), ServerError> {
    while !data.is_empty() {
        match conn.write(data)? {
            IoStatus::Transferred(n) => data = &data[n..],
            IoStatus::Closed => return Ok(()),
            IoStatus::WouldBlockWrite | IoStatus::WouldBlockRead => {
                conn.transport().ready(Interest::WRITABLE).await?;
            }
        }
    }
    while conn.flush()? == IoStatus::WouldBlockWrite {
        conn.transport().ready(Interest::WRITABLE).await?;
    }
    Ok(())
}
