use std::sync::Arc;

use rustls::{
    CipherSuite, NamedGroup, SupportedCipherSuite, SupportedProtocolVersion,
    crypto::{CryptoProvider, SupportedKxGroup, ring},
};

use crate::tls::{entropy::EntropySource, error::SetupError};

/// Suites the server accepts, in preference order. Nothing outside this list is negotiated.
pub const CIPHER_SUITES: &[CipherSuite] = &[
    CipherSuite::TLS13_AES_256_GCM_SHA384,
    CipherSuite::TLS13_AES_128_GCM_SHA256,
    CipherSuite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
    CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
    CipherSuite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
    CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
];

/// Groups offered for ephemeral key exchange, in preference order.
pub const KEY_EXCHANGE_GROUPS: &[NamedGroup] =
    &[NamedGroup::X25519, NamedGroup::secp384r1, NamedGroup::secp256r1];

/// Protocol versions enabled on every connection.
pub const PROTOCOL_VERSIONS: &[&SupportedProtocolVersion] =
    &[&rustls::version::TLS13, &rustls::version::TLS12];

/// The build-time negotiation policy: which cipher suites and key-exchange
/// groups a handshake may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CipherPolicy {
    suites: &'static [CipherSuite],
    groups: &'static [NamedGroup],
}

impl Default for CipherPolicy {
    fn default() -> Self {
        Self::new(CIPHER_SUITES, KEY_EXCHANGE_GROUPS)
    }
}

impl CipherPolicy {
    /// Creates a policy from static allow-lists. Validation happens in [`CipherPolicy::provider`].
    #[must_use]
    pub const fn new(suites: &'static [CipherSuite], groups: &'static [NamedGroup]) -> Self {
        Self { suites, groups }
    }

    /// The allowed suites, in preference order.
    #[must_use]
    pub const fn suites(&self) -> &'static [CipherSuite] {
        self.suites
    }

    /// The allowed key-exchange groups, in preference order.
    #[must_use]
    pub const fn groups(&self) -> &'static [NamedGroup] {
        self.groups
    }

    /// Builds the engine's crypto provider restricted to this policy and bound to `entropy`.
    ///
    /// # Errors
    ///
    /// Returns a `SetupError` if the policy is empty or names a suite or group the engine lacks.
    pub fn provider(&self, entropy: &EntropySource) -> Result<Arc<CryptoProvider>, SetupError> {
        if self.suites.is_empty() {
            return Err(SetupError::EmptyCipherPolicy);
        }
        let cipher_suites = self
            .suites
            .iter()
            .map(|wanted| resolve_suite(*wanted))
            .collect::<Result<Vec<_>, _>>()?;
        let kx_groups = self
            .groups
            .iter()
            .map(|wanted| resolve_group(*wanted))
            .collect::<Result<Vec<_>, _>>()?;

        let engine = base_provider();
        Ok(Arc::new(CryptoProvider {
            cipher_suites,
            kx_groups,
            signature_verification_algorithms: engine.signature_verification_algorithms,
            secure_random: entropy.as_secure_random(),
            key_provider: engine.key_provider,
        }))
    }
}

/// The unrestricted engine provider that policies are carved out of.
pub(crate) fn base_provider() -> CryptoProvider {
    ring::default_provider()
}

fn resolve_suite(wanted: CipherSuite) -> Result<SupportedCipherSuite, SetupError> {
    ring::ALL_CIPHER_SUITES
        .iter()
        .find(|suite| suite.suite() == wanted)
        .copied()
        .ok_or(SetupError::UnknownCipherSuite(wanted))
}

fn resolve_group(wanted: NamedGroup) -> Result<&'static dyn SupportedKxGroup, SetupError> {
    ring::ALL_KX_GROUPS
        .iter()
        .find(|group| group.name() == wanted)
        .copied()
        .ok_or(SetupError::UnknownKeyExchangeGroup(wanted))
}
