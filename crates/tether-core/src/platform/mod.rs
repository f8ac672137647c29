//! Platform-specific process handling.
//!
//! All `#[cfg]` blocks for OS behavior live here rather than in the broker
//! or the connectors.
//!
//! # Supported Platforms
//!
//! - **Linux**: epoll broker, full support
//! - **macOS / BSD**: kqueue broker
//! - Other Unix: poll(2) broker

pub mod process;

pub use process::{is_process_alive, reap_child, terminate_process};

/// Returns the current platform name.
pub fn current_platform() -> &'static str {
    #[cfg(target_os = "linux")]
    {
        "linux"
    }
    #[cfg(target_os = "macos")]
    {
        "macos"
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        "unix"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_platform() {
        assert!(["linux", "macos", "unix"].contains(&current_platform()));
    }
}
