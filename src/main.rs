//! # tlsterm
//!
//! This binary runs a TLS echo server on top of the library in this crate.
//!
//! Configuration comes from an optional TOML file given as the only argument,
//! overridden by `TLSTERM__*` environment variables.
use std::{path::PathBuf, process::ExitCode, sync::Arc};

use tlsterm::{
    runtime::{
        handler::{Handler, Peer},
        server::{ServerError, serve},
    },
    settings::Settings,
    tls::acceptor::TlsAcceptor,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

struct Echo;

impl Handler for Echo {
    async fn call(&self, peer: &Peer, data: &[u8]) -> Result<Option<Vec<u8>>, ServerError> {
        tracing::trace!(conn = %peer.id, bytes = data.len(), "Echoing");
        Ok(Some(data.to_vec()))
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tlsterm=info")),
        )
        .init();

    let file = std::env::args_os().nth(1).map(PathBuf::from);
    let settings = match Settings::load(file.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            error!(error = %e, "Could not read configuration");
            return ExitCode::FAILURE;
        }
    };

    let acceptor = match TlsAcceptor::from_settings(&settings.tls) {
        Ok(acceptor) => Arc::new(acceptor),
        Err(e) => {
            error!(error = %e, "TLS setup failed; not serving");
            return ExitCode::FAILURE;
        }
    };

    let server = match serve(&settings.server, Arc::clone(&acceptor), Arc::new(Echo)).await {
        Ok(server) => server,
        Err(e) => {
            error!(error = %e, bind = %settings.server.bind, "Could not bind listener");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Could not wait for Ctrl-C");
    }
    info!("Shutting down");
    server.close();
    server.stopped().await;
    match Arc::try_unwrap(acceptor) {
        Ok(acceptor) => acceptor.release(),
        Err(_) => info!("Connections still running; credentials are released when they finish"),
    }
    ExitCode::SUCCESS
}
