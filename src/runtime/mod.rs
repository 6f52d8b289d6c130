/// Module containing the handler
pub mod handler;
/// Module containing the logic for the server
pub mod server;
/// Module containing the socket adapter for TLS connections
pub mod transport;
