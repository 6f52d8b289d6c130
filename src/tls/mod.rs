/// Module containing the connection factory
pub mod acceptor;
/// Module containing a single TLS connection and its record I/O
pub mod connection;
/// Module containing the server identity
pub mod credentials;
/// Module containing the entropy sources
pub mod entropy;
/// Module containing the error types
pub mod error;
/// Module containing the peer certificate fingerprint
pub mod fingerprint;
/// Module containing the handshake state machine
pub mod handshake;
/// Module containing the static cipher and key-exchange policy
pub mod policy;
/// Module containing the peer certificate policy
pub mod verifier;

#[cfg(test)]
pub(crate) mod test_support;
