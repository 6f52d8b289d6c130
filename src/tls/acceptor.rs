use std::{
    io::{Read, Write},
    sync::Arc,
};

use rustls::{
    ServerConfig,
    crypto::CryptoProvider,
    server::{ResolvesServerCert, ServerSessionMemoryCache, danger::ClientCertVerifier},
};
use serde::Deserialize;
use tracing::{debug, info};

use crate::{
    settings::TlsSettings,
    tls::{
        connection::TlsConnection,
        credentials::Credentials,
        entropy::EntropySource,
        error::SetupError,
        policy::{CipherPolicy, PROTOCOL_VERSIONS},
        verifier::OptionalClientVerifier,
    },
};

/// Whether connections get their own configuration snapshot or share one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigSharing {
    /// A fresh configuration and session record for every connection.
    #[default]
    PerConnection,
    /// One immutable configuration and session cache for all connections.
    Shared,
}

/// Builds handshake-ready connections bound to one server identity.
#[derive(Debug)]
pub struct TlsAcceptor {
    credentials: Arc<Credentials>,
    entropy: EntropySource,
    provider: Arc<CryptoProvider>,
    verifier: Arc<OptionalClientVerifier>,
    sharing: ConfigSharing,
    session_cache_size: usize,
    shared: Option<Arc<ServerConfig>>,
}

impl TlsAcceptor {
    /// Validates the policy and credentials against the engine and prepares the acceptor.
    ///
    /// One configuration is assembled up front even when sharing is off, so a
    /// bad policy is reported here and not on the first connection.
    ///
    /// # Errors
    ///
    /// Returns a `SetupError` if the cipher policy, the verifier or the engine configuration is unusable.
    pub fn new(
        credentials: Arc<Credentials>,
        entropy: EntropySource,
        policy: CipherPolicy,
        sharing: ConfigSharing,
        session_cache_size: usize,
    ) -> Result<Self, SetupError> {
        let provider = policy.provider(&entropy)?;
        let verifier = Arc::new(OptionalClientVerifier::new(
            &credentials,
            Arc::clone(&provider),
        )?);
        let mut acceptor = Self {
            credentials,
            entropy,
            provider,
            verifier,
            sharing,
            session_cache_size,
            shared: None,
        };
        let template = acceptor.build_config()?;
        if sharing == ConfigSharing::Shared {
            acceptor.shared = Some(template);
        }

        info!(
            engine = "rustls",
            versions = ?PROTOCOL_VERSIONS.iter().map(|v| v.version).collect::<Vec<_>>(),
            suites = acceptor.provider.cipher_suites.len(),
            groups = acceptor.provider.kx_groups.len(),
            entropy = ?acceptor.entropy.kind(),
            ?sharing,
            "TLS engine ready"
        );
        Ok(acceptor)
    }

    /// Loads entropy and credentials as configured and builds an acceptor with the static policy.
    ///
    /// # Errors
    ///
    /// Returns a `SetupError` if any startup step fails. The process must not serve in that case.
    pub fn from_settings(settings: &TlsSettings) -> Result<Self, SetupError> {
        let entropy = EntropySource::open(settings.entropy, &settings.entropy_device)?;
        let credentials =
            Credentials::load(settings.certificate.as_deref(), settings.key.as_deref())?;
        Self::new(
            Arc::new(credentials),
            entropy,
            CipherPolicy::default(),
            settings.config_sharing,
            settings.session_cache_size,
        )
    }

    fn build_config(&self) -> Result<Arc<ServerConfig>, SetupError> {
        let verifier: Arc<dyn ClientCertVerifier> = self.verifier.clone();
        let resolver: Arc<dyn ResolvesServerCert> = self.credentials.clone();
        let mut config = ServerConfig::builder_with_provider(Arc::clone(&self.provider))
            .with_protocol_versions(PROTOCOL_VERSIONS)?
            .with_client_cert_verifier(verifier)
            .with_cert_resolver(resolver);
        config.session_storage = ServerSessionMemoryCache::new(self.session_cache_size);
        config.ignore_client_order = true;
        Ok(Arc::new(config))
    }

    /// Wraps `transport` in a connection that has not started its handshake.
    ///
    /// # Errors
    ///
    /// Returns a `SetupError` if the engine refuses the configuration.
    pub fn create<T: Read + Write>(&self, transport: T) -> Result<TlsConnection<T>, SetupError> {
        let config = match &self.shared {
            Some(shared) => Arc::clone(shared),
            None => self.build_config()?,
        };
        let connection = TlsConnection::new(config, Arc::clone(&self.verifier), transport)?;
        debug!(conn = %connection.id(), "Connection created");
        Ok(connection)
    }

    /// The identity every connection presents.
    #[must_use]
    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// How configurations are handed out.
    #[must_use]
    pub const fn sharing(&self) -> ConfigSharing {
        self.sharing
    }

    /// Drops the acceptor's hold on the credentials. They are freed once the
    /// last connection still using them is destroyed.
    pub fn release(self) {
        let Self {
            credentials,
            shared,
            verifier,
            ..
        } = self;
        drop(shared);
        drop(verifier);
        let outstanding = Arc::strong_count(&credentials) - 1;
        drop(credentials);
        info!(outstanding, "Released server credentials");
    }
}
