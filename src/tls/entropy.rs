use std::{
    fs::File,
    io::{self, Read},
    path::{Path, PathBuf},
};

use rustls::crypto::{GetRandomFailed, SecureRandom};
use serde::Deserialize;
use tracing::{debug, info};

use crate::tls::error::EntropyError;

/// Which strategy supplies random bytes to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntropyKind {
    /// The engine's own entropy collector, seeded by the operating system.
    #[default]
    System,
    /// A blocking read loop over a random-byte device such as `/dev/urandom`.
    Device,
}

/// Handle to the process-wide entropy source handed to every connection.
///
/// The handle is `Copy`; all copies refer to the same source, which tolerates
/// concurrent calls from any number of connections.
#[derive(Debug, Clone, Copy)]
pub struct EntropySource {
    kind: EntropyKind,
    inner: &'static dyn SecureRandom,
}

impl EntropySource {
    /// Opens the source selected by `kind`.
    ///
    /// # Errors
    ///
    /// Returns an `EntropyError` if the source cannot produce bytes.
    pub fn open(kind: EntropyKind, device: &Path) -> Result<Self, EntropyError> {
        match kind {
            EntropyKind::System => Self::system(),
            EntropyKind::Device => Self::device(device),
        }
    }

    /// Uses the engine's entropy collector. One probe read is made so a
    /// broken collector is reported at startup rather than mid-handshake.
    ///
    /// # Errors
    ///
    /// Returns `EntropyError::Exhausted` if the probe read fails.
    pub fn system() -> Result<Self, EntropyError> {
        let source = Self {
            kind: EntropyKind::System,
            inner: rustls::crypto::ring::default_provider().secure_random,
        };
        source.next_bytes(&mut [0u8; 16])?;
        info!("Using engine entropy collector");
        Ok(source)
    }

    /// Opens a random-byte device. The device stays open for the rest of the process.
    ///
    /// # Errors
    ///
    /// Returns `EntropyError::Unavailable` if the device cannot be opened.
    pub fn device(path: &Path) -> Result<Self, EntropyError> {
        let device = File::open(path).map_err(|source| EntropyError::Unavailable {
            path: path.to_path_buf(),
            source,
        })?;
        info!(device = %path.display(), "Using entropy device");
        let inner: &'static DeviceEntropy = Box::leak(Box::new(DeviceEntropy {
            device,
            path: path.to_path_buf(),
        }));
        Ok(Self {
            kind: EntropyKind::Device,
            inner,
        })
    }

    /// The strategy behind this handle.
    #[must_use]
    pub const fn kind(&self) -> EntropyKind {
        self.kind
    }

    /// Fills `buffer` completely. Output is never partial.
    ///
    /// # Errors
    ///
    /// Returns `EntropyError::Exhausted` if the source failed; `buffer` must then be discarded.
    pub fn next_bytes(&self, buffer: &mut [u8]) -> Result<(), EntropyError> {
        let requested = buffer.len();
        self.inner
            .fill(buffer)
            .map_err(|GetRandomFailed| EntropyError::Exhausted { requested })
    }

    pub(crate) const fn as_secure_random(&self) -> &'static dyn SecureRandom {
        self.inner
    }
}

/// Reads from an open random-byte device.
#[derive(Debug)]
struct DeviceEntropy {
    device: File,
    path: PathBuf,
}

impl SecureRandom for DeviceEntropy {
    fn fill(&self, buf: &mut [u8]) -> Result<(), GetRandomFailed> {
        // `&File` is `Read`, so concurrent callers each get their own kernel read.
        fill_from(&mut &self.device, buf).map_err(|error| {
            debug!(device = %self.path.display(), %error, "Entropy device read failed");
            GetRandomFailed
        })
    }
}

/// Reads until `buf` is full, retrying short reads and interrupts.
fn fill_from<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(read) => filled += read,
            Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
            Err(error) => return Err(error),
        }
    }
    Ok(())
}
