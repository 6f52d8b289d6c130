use std::fmt;

use sha1::{Digest, Sha1};

/// SHA-1 digest of a certificate's DER encoding. An identity correlator only, never a trust decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 20]);

impl Fingerprint {
    /// Digests the raw encoded certificate.
    #[must_use]
    pub fn of(der: &[u8]) -> Self {
        let mut digest = [0u8; 20];
        digest.copy_from_slice(&Sha1::digest(der));
        Self(digest)
    }

    /// The 20 digest bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}
