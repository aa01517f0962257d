//! Server settings and the options that adjust them.
//!
//! `Settings::default()` holds the defaults. Each `ServerOption` is applied
//! over them in the order given to `Server::new`, before the server binds.

use std::time::Duration;
use tokio::sync::Semaphore;

pub const DEFAULT_SERVER_VERSION: &str = "0.0";
pub const DEFAULT_TIME_ZONE: &str = "UTC";
pub const DEFAULT_HOST: &str = "0.0.0.0";

/// Maximum number of concurrent sessions
pub const DEFAULT_MAX_CONNECTIONS: usize = 10000;

/// Largest accepted frame, length field included
pub const DEFAULT_MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

/// Per-operation read/write deadline
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(300);

/// Process-wide settings, immutable once the server starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub host: String,
    pub port: u16,
    /// Reported as the `server_version` parameter.
    pub server_version: String,
    /// Reported as the `TimeZone` parameter.
    pub time_zone: String,
    /// `None` disables the deadline.
    pub io_timeout: Option<Duration>,
    pub max_connections: usize,
    pub max_frame_len: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: 0,
            server_version: DEFAULT_SERVER_VERSION.to_string(),
            time_zone: DEFAULT_TIME_ZONE.to_string(),
            io_timeout: Some(DEFAULT_IO_TIMEOUT),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

impl Settings {
    /// Parameters reported during the handshake, in emission order.
    pub fn parameters(&self) -> [(&'static str, &str); 2] {
        [
            ("TimeZone", self.time_zone.as_str()),
            ("server_version", self.server_version.as_str()),
        ]
    }

    /// Apply `options` in order.
    pub fn apply<I>(mut self, options: I) -> Self
    where
        I: IntoIterator<Item = ServerOption>,
    {
        for option in options {
            option(&mut self);
        }
        self
    }
}

/// A named adjustment to `Settings`.
pub type ServerOption = Box<dyn FnOnce(&mut Settings) + Send>;

pub fn with_server_version(version: impl Into<String>) -> ServerOption {
    let version = version.into();
    Box::new(move |s| s.server_version = version)
}

pub fn with_time_zone(time_zone: impl Into<String>) -> ServerOption {
    let time_zone = time_zone.into();
    Box::new(move |s| s.time_zone = time_zone)
}

pub fn with_host(host: impl Into<String>) -> ServerOption {
    let host = host.into();
    Box::new(move |s| s.host = host)
}

pub fn with_io_timeout(timeout: Option<Duration>) -> ServerOption {
    Box::new(move |s| s.io_timeout = timeout)
}

/// Clamped to `1..=Semaphore::MAX_PERMITS`.
pub fn with_max_connections(max: usize) -> ServerOption {
    Box::new(move |s| s.max_connections = max.clamp(1, Semaphore::MAX_PERMITS))
}

pub fn with_max_frame_len(max: u32) -> ServerOption {
    Box::new(move |s| s.max_frame_len = max)
}
