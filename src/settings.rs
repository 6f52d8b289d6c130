use std::{
    net::{Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
    time::Duration,
};

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use thiserror::Error;

use crate::tls::{acceptor::ConfigSharing, entropy::EntropyKind};

/// Prefix of the environment variables that override file settings, e.g. `TLSTERM__TLS__CERTIFICATE`.
pub const ENV_PREFIX: &str = "TLSTERM";

/// Represents the kind of error that can occur while reading the configuration.
#[derive(Error, Debug)]
pub enum SettingsError {
    /// A source could not be read or a value has the wrong type.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

/// Everything the process reads at startup.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Settings {
    /// Identity and engine settings.
    pub tls: TlsSettings,
    /// Listener settings for the bundled server.
    pub server: ServerSettings,
}

/// Settings consumed by the acceptor.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TlsSettings {
    /// Certificate chain file, PEM or DER, leaf first.
    pub certificate: Option<PathBuf>,
    /// Private key file, PEM or DER.
    pub key: Option<PathBuf>,
    /// Entropy strategy.
    pub entropy: EntropyKind,
    /// Device read when `entropy` is `device`.
    pub entropy_device: PathBuf,
    /// Whether connections share one configuration.
    pub config_sharing: ConfigSharing,
    /// Capacity of each session cache.
    pub session_cache_size: usize,
}

impl Default for TlsSettings {
    fn default() -> Self {
        Self {
            certificate: None,
            key: None,
            entropy: EntropyKind::default(),
            entropy_device: PathBuf::from("/dev/urandom"),
            config_sharing: ConfigSharing::default(),
            session_cache_size: 256,
        }
    }
}

/// Settings for the bundled server.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerSettings {
    /// Address to listen on.
    pub bind: SocketAddr,
    /// Seconds a client gets to finish its handshake.
    pub handshake_timeout_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from((Ipv4Addr::LOCALHOST, 64738)),
            handshake_timeout_secs: 30,
        }
    }
}

impl ServerSettings {
    /// The handshake timeout as a `Duration`.
    #[must_use]
    pub const fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

impl Settings {
    /// Reads the optional TOML file, then `TLSTERM__*` environment variables on top.
    ///
    /// # Errors
    ///
    /// Returns a `SettingsError` if the file is unreadable or a value does not parse.
    pub fn load(file: Option<&Path>) -> Result<Self, SettingsError> {
        Self::from_sources(file, environment())
    }

    fn from_sources(file: Option<&Path>, env: Environment) -> Result<Self, SettingsError> {
        let mut builder = Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(File::from(path).required(true));
        }
        let settings = builder.add_source(env).build()?.try_deserialize()?;
        Ok(settings)
    }
}

fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("__")
        .separator("__")
        .try_parsing(true)
}
