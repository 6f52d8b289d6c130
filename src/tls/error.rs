use std::{io, path::PathBuf};

use rustls::{CipherSuite, NamedGroup, server::VerifierBuilderError};
use thiserror::Error;

use crate::tls::handshake::HandshakeState;

/// Represents the kind of error that can occur while opening or reading the entropy source.
#[derive(Error, Debug)]
pub enum EntropyError {
    /// The random-byte device could not be opened at startup.
    #[error("cannot open entropy device {path}: {source}")]
    Unavailable {
        /// The device that was configured.
        path: PathBuf,
        /// The underlying IO error.
        source: io::Error,
    },

    /// The source could not supply the requested bytes.
    #[error("entropy source failed to supply {requested} bytes")]
    Exhausted {
        /// The number of bytes that were asked for.
        requested: usize,
    },
}

/// Represents the kind of error that can occur while loading the server identity.
#[derive(Error, Debug)]
pub enum CredentialError {
    /// No certificate file was configured and no fallback is compiled in.
    #[error("no certificate file specified")]
    MissingCertificatePath,

    /// No key file was configured.
    #[error("no key file specified")]
    MissingKeyPath,

    /// A credential file could not be read.
    #[error("could not read {path}: {source}")]
    Read {
        /// The file that failed.
        path: PathBuf,
        /// The underlying IO error.
        source: io::Error,
    },

    /// The certificate file contained no certificate.
    #[error("no certificate found in {0}")]
    NoCertificate(PathBuf),

    /// The leaf certificate is not valid X.509.
    #[error("cannot parse certificate in {path}: {source}")]
    BadCertificate {
        /// The file that failed.
        path: PathBuf,
        /// The parser's error.
        source: rustls::Error,
    },

    /// An in-memory identity was assembled from an empty chain.
    #[error("certificate chain is empty")]
    EmptyChain,

    /// The key file contained no private key.
    #[error("no private key found in {0}")]
    NoPrivateKey(PathBuf),

    /// The private key is of a type the engine cannot sign with.
    #[error("unsupported private key: {0}")]
    UnsupportedKey(#[source] rustls::Error),

    /// The private key does not belong to the certificate's public key.
    #[error("private key does not match the certificate: {0}")]
    KeyMismatch(#[source] rustls::Error),

    /// The compiled-in test credentials failed to parse.
    #[error("could not parse built-in test {0}")]
    BuiltIn(&'static str),
}

/// Fatal startup error. The process must not start serving when one of these is returned.
#[derive(Error, Debug)]
pub enum SetupError {
    /// The entropy source is unavailable.
    #[error("entropy: {0}")]
    Entropy(#[from] EntropyError),

    /// The server identity could not be loaded.
    #[error("credentials: {0}")]
    Credentials(#[from] CredentialError),

    /// The static cipher policy lists no suites.
    #[error("cipher policy is empty")]
    EmptyCipherPolicy,

    /// The static cipher policy names a suite the engine does not implement.
    #[error("cipher policy names unsupported suite {0:?}")]
    UnknownCipherSuite(CipherSuite),

    /// The static key-exchange parameters name a group the engine does not implement.
    #[error("key exchange policy names unsupported group {0:?}")]
    UnknownKeyExchangeGroup(NamedGroup),

    /// The peer verifier could not be built from the credential chain.
    #[error("peer verifier setup failed: {0}")]
    Verifier(#[from] VerifierBuilderError),

    /// The engine rejected the assembled configuration.
    #[error("TLS engine setup failed: {0}")]
    Engine(#[from] rustls::Error),
}

/// Why a handshake was abandoned.
#[derive(Error, Debug)]
pub enum HandshakeFailure {
    /// The engine rejected the peer's messages.
    #[error("TLS engine error: {0}")]
    Engine(#[from] rustls::Error),

    /// The transport failed with something other than would-block.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    /// The peer closed the transport before the handshake completed.
    #[error("peer closed the connection during the handshake")]
    PeerClosed,
}

/// Represents the kind of error that can occur during Record I/O.
#[derive(Error, Debug)]
pub enum RecordError {
    /// Record I/O was attempted on a connection that is not established.
    #[error("connection is not established (state: {0:?})")]
    NotEstablished(HandshakeState),

    /// The engine rejected incoming records.
    #[error("TLS engine error: {0}")]
    Engine(#[from] rustls::Error),

    /// The transport failed with something other than would-block.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),
}
