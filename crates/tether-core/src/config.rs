//! Centralized configuration for tether.
//!
//! Wire limits, timeouts, reserved descriptor numbers and pool sizing live here
//! as associated constants, grouped by the subsystem that consumes them.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Framing limits for the stream protocol.
pub struct WireConfig;

impl WireConfig {
    /// Six big-endian u32 fields.
    pub const HEADER_LEN: usize = 24;
    pub const MAX_MESSAGE_SIZE: usize = 128 * 1_048_576; // 128MiB
    pub const CHUNK_SIZE: usize = 131_072;
}

/// Broker I/O loop configuration.
pub struct BrokerConfig;

impl BrokerConfig {
    /// Grace period for streams to close during shutdown in child contexts.
    pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(3);
    /// Grace period used by the master, which usually owns more children.
    pub const MASTER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);
    pub const WAKER_DRAIN_SIZE: usize = 128;
    pub const THREAD_NAME: &'static str = "tether-broker";
}

/// Child bootstrap and connection establishment.
pub struct ConnectConfig;

impl ConnectConfig {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
    /// Emitted by the first stage once it is ready for the compressed preamble.
    pub const EC0_MARKER: &'static [u8] = b"MITO000\n";
    /// Emitted by the first stage once the preamble has been handed over.
    pub const EC1_MARKER: &'static [u8] = b"MITO001\n";
    /// Descriptor the first stage moves the parent transport to.
    pub const IN_FD: i32 = 100;
    /// Descriptor carrying the decompressed second-stage payload.
    pub const CORE_SRC_FD: i32 = 101;
    pub const OUT_FD: i32 = 1;
    /// Bytes of child output kept for EOF diagnostics.
    pub const EOF_TAIL_LEN: usize = 300;
    pub const DETACH_DRAIN_ATTEMPTS: u32 = 20;
    pub const DETACH_DRAIN_INTERVAL: Duration = Duration::from_millis(50);
    pub const FIRST_STAGE_COMMAND: &'static str = "first-stage";
    pub const SECOND_STAGE_COMMAND: &'static str = "second-stage";
}

/// Context ids and handle numbering.
pub struct IdConfig;

impl IdConfig {
    pub const MASTER_ID: u32 = 0;
    /// Ids handed to a child per ALLOCATE_ID request.
    pub const BLOCK_SIZE: u32 = 1000;
    /// First handle given to application receivers.
    pub const FIRST_APP_HANDLE: u32 = 1000;
    /// Longest context name accepted from a payload.
    pub const MAX_NAME_LEN: usize = 100;
}

/// Service pool sizing.
pub struct PoolConfig;

impl PoolConfig {
    pub const DEFAULT_POOL_SIZE: usize = 16;
    pub const THREAD_PREFIX: &'static str = "tether-pool";
}

/// Readiness back-end driving the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PollerKind {
    Epoll,
    Kqueue,
    Poll,
}

impl PollerKind {
    /// Best mechanism available on this host.
    pub fn preferred() -> Self {
        #[cfg(any(target_os = "linux", target_os = "android"))]
        {
            PollerKind::Epoll
        }
        #[cfg(any(
            target_os = "macos",
            target_os = "ios",
            target_os = "freebsd",
            target_os = "netbsd",
            target_os = "openbsd",
            target_os = "dragonfly"
        ))]
        {
            PollerKind::Kqueue
        }
        #[cfg(not(any(
            target_os = "linux",
            target_os = "android",
            target_os = "macos",
            target_os = "ios",
            target_os = "freebsd",
            target_os = "netbsd",
            target_os = "openbsd",
            target_os = "dragonfly"
        )))]
        {
            PollerKind::Poll
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PollerKind::Epoll => "epoll",
            PollerKind::Kqueue => "kqueue",
            PollerKind::Poll => "poll",
        }
    }
}

impl Default for PollerKind {
    fn default() -> Self {
        Self::preferred()
    }
}

impl FromStr for PollerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "epoll" => Ok(PollerKind::Epoll),
            "kqueue" => Ok(PollerKind::Kqueue),
            "poll" | "select" => Ok(PollerKind::Poll),
            _ => Err(format!("Unknown poller: {}", s)),
        }
    }
}

impl fmt::Display for PollerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poller_kind_from_str() {
        assert_eq!("epoll".parse::<PollerKind>(), Ok(PollerKind::Epoll));
        assert_eq!("KQUEUE".parse::<PollerKind>(), Ok(PollerKind::Kqueue));
        assert_eq!("select".parse::<PollerKind>(), Ok(PollerKind::Poll));
        assert!("iocp".parse::<PollerKind>().is_err());
    }

    #[test]
    fn test_poller_kind_display() {
        assert_eq!(PollerKind::Poll.to_string(), "poll");
    }

    #[test]
    fn test_markers_are_fixed_width() {
        assert_eq!(ConnectConfig::EC0_MARKER.len(), 8);
        assert_eq!(ConnectConfig::EC1_MARKER.len(), 8);
        assert_ne!(ConnectConfig::EC0_MARKER, ConnectConfig::EC1_MARKER);
    }
}
