use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use rustls::{
    InconsistentKeys,
    pki_types::{CertificateDer, PrivateKeyDer},
    server::{ClientHello, ParsedCertificate, ResolvesServerCert},
    sign::CertifiedKey,
};
use tracing::{debug, info};

use crate::tls::{error::CredentialError, policy::base_provider};

/// Where the loaded identity came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialOrigin {
    /// Certificate and key files named in the configuration.
    File,
    /// The compiled-in test pair. Shared by every build, so not secret.
    InsecureTestCertificate,
}

/// The server identity: certificate chain (leaf first) and the matching private key.
///
/// Immutable once built and safe to share between any number of connections.
/// Dropping the last reference releases the chain and key.
#[derive(Debug)]
pub struct Credentials {
    identity: Arc<CertifiedKey>,
    origin: CredentialOrigin,
}

impl Credentials {
    /// Loads the certificate chain and then the private key.
    ///
    /// A missing or unreadable certificate falls back to the compiled-in test
    /// pair when the `insecure-test-certificate` feature is enabled, in which
    /// case `key` is not read at all.
    ///
    /// # Errors
    ///
    /// Returns a `CredentialError` if either half is missing or unusable, or if
    /// the key does not belong to the certificate.
    pub fn load(certificate: Option<&Path>, key: Option<&Path>) -> Result<Self, CredentialError> {
        match load_certificate(certificate)? {
            CertificateSource::File(chain) => {
                let key = load_key(key)?;
                Self::assemble(chain, key, CredentialOrigin::File)
            }
            #[cfg(feature = "insecure-test-certificate")]
            CertificateSource::BuiltIn => built_in::credentials(),
        }
    }

    /// Builds credentials from already-decoded material.
    ///
    /// # Errors
    ///
    /// Returns a `CredentialError` if the chain is empty, the key type is
    /// unsupported, or the key does not match the leaf certificate.
    pub fn from_der(
        chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> Result<Self, CredentialError> {
        Self::assemble(chain, key, CredentialOrigin::File)
    }

    fn assemble(
        chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
        origin: CredentialOrigin,
    ) -> Result<Self, CredentialError> {
        if chain.is_empty() {
            return Err(CredentialError::EmptyChain);
        }
        let signing_key = base_provider()
            .key_provider
            .load_private_key(key)
            .map_err(CredentialError::UnsupportedKey)?;
        let identity = CertifiedKey::new(chain, signing_key);

        match identity.keys_match() {
            Ok(()) => {}
            Err(rustls::Error::InconsistentKeys(InconsistentKeys::Unknown)) => {
                debug!("Engine cannot derive the public key; skipping key/certificate comparison");
            }
            Err(error) => return Err(CredentialError::KeyMismatch(error)),
        }

        info!(
            algorithm = ?identity.key.algorithm(),
            chain_len = identity.cert.len(),
            ?origin,
            "Loaded server identity"
        );
        Ok(Self {
            identity: Arc::new(identity),
            origin,
        })
    }

    /// The certificate chain, leaf first.
    #[must_use]
    pub fn chain(&self) -> &[CertificateDer<'static>] {
        &self.identity.cert
    }

    /// Where the identity came from.
    #[must_use]
    pub const fn origin(&self) -> CredentialOrigin {
        self.origin
    }

    /// Whether the identity is the shared, compiled-in test pair.
    #[must_use]
    pub fn is_insecure(&self) -> bool {
        self.origin == CredentialOrigin::InsecureTestCertificate
    }
}

impl ResolvesServerCert for Credentials {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(Arc::clone(&self.identity))
    }
}

enum CertificateSource {
    File(Vec<CertificateDer<'static>>),
    #[cfg(feature = "insecure-test-certificate")]
    BuiltIn,
}

fn load_certificate(path: Option<&Path>) -> Result<CertificateSource, CredentialError> {
    let Some(path) = path else {
        return fall_back(CredentialError::MissingCertificatePath);
    };
    match read_certificates(path) {
        Ok(chain) => Ok(CertificateSource::File(chain)),
        Err(error) => fall_back(error),
    }
}

#[cfg(feature = "insecure-test-certificate")]
#[allow(clippy::unnecessary_wraps)]
fn fall_back(reason: CredentialError) -> Result<CertificateSource, CredentialError> {
    tracing::warn!(%reason, "Falling back to the built-in test certificate");
    Ok(CertificateSource::BuiltIn)
}

#[cfg(not(feature = "insecure-test-certificate"))]
fn fall_back(reason: CredentialError) -> Result<CertificateSource, CredentialError> {
    Err(reason)
}

fn load_key(path: Option<&Path>) -> Result<PrivateKeyDer<'static>, CredentialError> {
    let path = path.ok_or(CredentialError::MissingKeyPath)?;
    let bytes = read(path)?;
    let pem = rustls_pemfile::private_key(&mut bytes.as_slice()).map_err(|source| {
        CredentialError::Read {
            path: path.to_path_buf(),
            source,
        }
    })?;
    if let Some(key) = pem {
        return Ok(key);
    }
    if looks_like_der(&bytes) {
        return PrivateKeyDer::try_from(bytes)
            .map_err(|_| CredentialError::NoPrivateKey(path.to_path_buf()));
    }
    Err(CredentialError::NoPrivateKey(path.to_path_buf()))
}

/// Reads a PEM bundle, or a single DER certificate, and parses the leaf.
fn read_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>, CredentialError> {
    let bytes = read(path)?;
    let mut chain = rustls_pemfile::certs(&mut bytes.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| CredentialError::Read {
            path: path.to_path_buf(),
            source,
        })?;
    if chain.is_empty() {
        if !looks_like_der(&bytes) {
            return Err(CredentialError::NoCertificate(path.to_path_buf()));
        }
        chain.push(CertificateDer::from(bytes));
    }
    if let Some(leaf) = chain.first() {
        ParsedCertificate::try_from(leaf).map_err(|source| CredentialError::BadCertificate {
            path: path.to_path_buf(),
            source,
        })?;
    }
    Ok(chain)
}

fn read(path: &Path) -> Result<Vec<u8>, CredentialError> {
    fs::read(path).map_err(|source| CredentialError::Read {
        path: PathBuf::from(path),
        source,
    })
}

/// DER structures start with a SEQUENCE tag.
fn looks_like_der(bytes: &[u8]) -> bool {
    bytes.first() == Some(&0x30)
}

#[cfg(feature = "insecure-test-certificate")]
mod built_in {
    use tracing::warn;

    use super::{CredentialOrigin, Credentials};
    use crate::tls::error::CredentialError;

    const CERTIFICATE: &str = include_str!("testcert/cert.pem");
    const KEY: &str = include_str!("testcert/key.pem");

    pub(super) fn credentials() -> Result<Credentials, CredentialError> {
        warn!("*** Using built-in test certificate and key ***");
        warn!(
            "*** This is not secure! Configure a CA-signed certificate or create a key and self-signed certificate ***"
        );
        let chain = rustls_pemfile::certs(&mut CERTIFICATE.as_bytes())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| CredentialError::BuiltIn("certificate"))?;
        let key = rustls_pemfile::private_key(&mut KEY.as_bytes())
            .ok()
            .flatten()
            .ok_or(CredentialError::BuiltIn("key"))?;
        Credentials::assemble(chain, key, CredentialOrigin::InsecureTestCertificate)
    }
}

#[cfg(test)]
mod tests {
    use std::{path::Path, sync::Arc};

    use rustls::pki_types::PrivateKeyDer;

    use super::{CredentialOrigin, Credentials};
    use crate::tls::{
        error::CredentialError,
        test_support::{Identity, write_temp},
    };

    #[test]
    fn loads_pem_certificate_and_key() {
        let id = Identity::generate("localhost");
        let cert = write_temp("cert.pem", id.cert_pem.as_bytes());
        let key = write_temp("key.pem", id.key_pem.as_bytes());

        let credentials = Credentials::load(Some(cert.as_path()), Some(key.as_path())).unwrap();

        assert_eq!(credentials.origin(), CredentialOrigin::File);
        assert!(!credentials.is_insecure());
        assert_eq!(credentials.chain(), &[id.cert_der]);
    }

    #[test]
    fn loads_der_certificate_and_key() {
        let id = Identity::generate("localhost");
        let cert = write_temp("cert.der", id.cert_der.as_ref());
        let key = write_temp("key.der", id.key_der.secret_der());

        let credentials = Credentials::load(Some(cert.as_path()), Some(key.as_path())).unwrap();

        assert_eq!(credentials.chain().len(), 1);
    }

    #[test]
    fn keeps_the_whole_chain_in_order() {
        let leaf = Identity::generate("localhost");
        let other = Identity::generate("intermediate.test");
        let bundle = format!("{}{}", leaf.cert_pem, other.cert_pem);
        let cert = write_temp("chain.pem", bundle.as_bytes());
        let key = write_temp("key.pem", leaf.key_pem.as_bytes());

        let credentials = Credentials::load(Some(cert.as_path()), Some(key.as_path())).unwrap();

        assert_eq!(credentials.chain(), &[leaf.cert_der, other.cert_der]);
    }

    #[test]
    fn mismatched_key_is_fatal() {
        let cert_owner = Identity::generate("localhost");
        let stranger = Identity::generate("localhost");

        let result = Credentials::from_der(vec![cert_owner.cert_der], stranger.key_der);

        assert!(matches!(result, Err(CredentialError::KeyMismatch(_))));
    }

    #[test]
    fn garbage_key_is_rejected() {
        let id = Identity::generate("localhost");
        let cert = write_temp("cert.pem", id.cert_pem.as_bytes());
        let key = write_temp("key.pem", b"this is not a key");

        let result = Credentials::load(Some(cert.as_path()), Some(key.as_path()));

        assert!(matches!(result, Err(CredentialError::NoPrivateKey(_))));
    }

    #[test]
    fn missing_key_path_is_fatal() {
        let id = Identity::generate("localhost");
        let cert = write_temp("cert.pem", id.cert_pem.as_bytes());

        let result = Credentials::load(Some(cert.as_path()), None);

        assert!(matches!(result, Err(CredentialError::MissingKeyPath)));
    }

    #[test]
    fn empty_chain_is_rejected() {
        let id = Identity::generate("localhost");

        let result = Credentials::from_der(Vec::new(), id.key_der);

        assert!(matches!(result, Err(CredentialError::EmptyChain)));
    }

    #[test]
    fn unsupported_key_bytes_are_rejected() {
        let id = Identity::generate("localhost");
        let key = PrivateKeyDer::Pkcs8(vec![0x30, 0x03, 0x02, 0x01, 0x00].into());

        let result = Credentials::from_der(vec![id.cert_der], key);

        assert!(matches!(result, Err(CredentialError::UnsupportedKey(_))));
    }

    #[test]
    fn credentials_are_shareable_across_threads() {
        let id = Identity::generate("localhost");
        let credentials = Arc::new(Credentials::from_der(vec![id.cert_der], id.key_der).unwrap());

        let lens: Vec<usize> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let credentials = Arc::clone(&credentials);
                    scope.spawn(move || credentials.chain().len())
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(lens, vec![1; 4]);
    }

    /// A PEM block whose body is a DER SEQUENCE but not a certificate.
    const MALFORMED_CERTIFICATE: &[u8] =
        b"-----BEGIN CERTIFICATE-----\nMAMCAQA=\n-----END CERTIFICATE-----\n";

    #[cfg(not(feature = "insecure-test-certificate"))]
    #[test]
    fn malformed_certificate_without_fallback_is_fatal() {
        let id = Identity::generate("localhost");
        let cert = write_temp("cert.pem", MALFORMED_CERTIFICATE);
        let key = write_temp("key.pem", id.key_pem.as_bytes());

        let result = Credentials::load(Some(cert.as_path()), Some(key.as_path()));

        assert!(matches!(result, Err(CredentialError::BadCertificate { .. })));
    }

    #[cfg(not(feature = "insecure-test-certificate"))]
    #[test]
    fn malformed_der_certificate_is_fatal() {
        let cert = write_temp("cert.der", &[0x30, 0x03, 0x02, 0x01, 0x00]);

        let result = Credentials::load(Some(cert.as_path()), None);

        assert!(matches!(result, Err(CredentialError::BadCertificate { .. })));
    }

    #[cfg(not(feature = "insecure-test-certificate"))]
    #[test]
    fn missing_certificate_without_fallback_is_fatal() {
        let result = Credentials::load(None, None);

        assert!(matches!(result, Err(CredentialError::MissingCertificatePath)));
    }

    #[cfg(not(feature = "insecure-test-certificate"))]
    #[test]
    fn unreadable_certificate_without_fallback_is_fatal() {
        let result = Credentials::load(Some(Path::new("/nonexistent/cert.pem")), None);

        assert!(matches!(result, Err(CredentialError::Read { .. })));
    }

    #[cfg(feature = "insecure-test-certificate")]
    #[test]
    #[tracing_test::traced_test]
    fn missing_certificate_falls_back_to_test_pair() {
        let credentials = Credentials::load(None, None).unwrap();

        assert!(credentials.is_insecure());
        assert!(logs_contain("Using built-in test certificate"));
    }

    #[cfg(feature = "insecure-test-certificate")]
    #[test]
    fn unreadable_certificate_falls_back_and_skips_the_key_file() {
        let credentials = Credentials::load(
            Some(Path::new("/nonexistent/cert.pem")),
            Some(Path::new("/nonexistent/key.pem")),
        )
        .unwrap();

        assert_eq!(credentials.origin(), CredentialOrigin::InsecureTestCertificate);
    }

    #[cfg(feature = "insecure-test-certificate")]
    #[test]
    fn malformed_certificate_falls_back_to_test_pair() {
        let cert = write_temp("cert.pem", MALFORMED_CERTIFICATE);

        let credentials = Credentials::load(Some(cert.as_path()), None).unwrap();

        assert!(credentials.is_insecure());
    }
}
