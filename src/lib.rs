//! # tlsterm
//!
//! Server-side TLS termination over caller-owned, non-blocking sockets.
//!
//! The [`tls`] module holds the server identity, builds one TLS connection per
//! accepted socket and drives its handshake and record I/O without blocking.
//! Would-block is reported as a status, never as an error or a byte count.
//!
//! Refer to the included binary for a complete echo server built on [`runtime`].

/// Module containing the startup configuration
pub mod settings;
/// Module containing the credential store, connection factory and connection driver
pub mod tls;
/// Module containing a tokio server built on the connection driver
pub mod runtime;
