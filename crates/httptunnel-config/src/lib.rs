//! TOML configuration for both ends of the tunnel, plus the logging setup it drives.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

mod logging;

pub use logging::{init_tracing, LoggingConfig};

const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_REFRESH_INTERVAL_MS: u64 = 30_000;
const DEFAULT_MAX_FRAME_LEN: u32 = 64 << 20;

/// Everything one process needs. A process may run an origin, a terminus, or both.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TunnelConfig {
    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub origin: Option<OriginConfig>,

    #[serde(default)]
    pub terminus: Option<TerminusConfig>,
}

impl TunnelConfig {
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(text) => Self::load_from_str(&text),
            Err(source) => Err(ConfigError::Io {
                path: path.display().to_string(),
                source,
            }),
        }
    }

    pub fn load_from_str(text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|err| ConfigError::Toml(err.message().to_owned()))
    }
}

/// The forwarding side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OriginConfig {
    /// Where the termini live. Accepts `svc[.ns[.domain]]:port`, `kubernetes://svc...:port`,
    /// `direct://host:port` and already canonical `scheme:///endpoint` forms.
    pub address: String,

    /// Deadline for calls whose request carries none.
    #[serde(default)]
    pub request_timeout_ms: Option<u64>,

    /// Limit for dialing and handshaking with one terminus instance.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// How often the terminus address is resolved again, so instances that come and go are
    /// picked up without a restart.
    #[serde(default = "default_refresh_interval_ms")]
    pub refresh_interval_ms: u64,
}

fn default_connect_timeout_ms() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_MS
}

fn default_refresh_interval_ms() -> u64 {
    DEFAULT_REFRESH_INTERVAL_MS
}

impl OriginConfig {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            request_timeout_ms: None,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            refresh_interval_ms: DEFAULT_REFRESH_INTERVAL_MS,
        }
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }
}

/// The serving side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TerminusConfig {
    pub listen: SocketAddr,

    /// Upper bound offered during the handshake; each connection uses the smaller of this
    /// and what the origin offers.
    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: u32,
}

fn default_max_frame_len() -> u32 {
    DEFAULT_MAX_FRAME_LEN
}

impl TerminusConfig {
    pub fn new(listen: SocketAddr) -> Self {
        Self {
            listen,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    /// Only the parser's message; the source snippet toml adds to `Display` is dropped.
    #[error("invalid config: {0}")]
    Toml(String),
}
