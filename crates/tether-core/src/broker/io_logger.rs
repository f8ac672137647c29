//! Capture of a child's stdout/stderr into tracing.

use super::poller::Token;
use super::side::{IoOutcome, Side};
use crate::error::Result;
use std::net::Shutdown;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use tracing::{info, warn};

/// Which standard descriptor a logger captures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdioKind {
    Stdout,
    Stderr,
}

impl StdioKind {
    pub fn fd(&self) -> RawFd {
        match self {
            StdioKind::Stdout => 1,
            StdioKind::Stderr => 2,
        }
    }
}

/// Drains lines written to one standard descriptor and logs them.
pub(crate) struct IoLogger {
    pub token: Token,
    pub kind: StdioKind,
    pub side: Side,
    wsock: UnixStream,
    buf: String,
}

impl IoLogger {
    /// Point `kind`'s descriptor at a fresh socket pair and keep its read end.
    pub(crate) fn install(token: Token, kind: StdioKind) -> Result<Self> {
        let (rsock, wsock) = UnixStream::pair()?;
        nix::unistd::dup2(wsock.as_raw_fd(), kind.fd())?;
        Ok(Self {
            token,
            kind,
            side: Side::new(OwnedFd::from(rsock), true)?,
            wsock,
            buf: String::new(),
        })
    }

    fn log_line(&self, line: &str) {
        match self.kind {
            StdioKind::Stdout => info!(target: "tether::stdout", "{}", line),
            StdioKind::Stderr => info!(target: "tether::stderr", "{}", line),
        }
    }

    fn log_lines(&mut self) {
        while let Some(pos) = self.buf.find('\n') {
            let line: String = self.buf.drain(..=pos).collect();
            self.log_line(line.trim_end_matches(['\r', '\n']));
        }
    }

    /// Returns false once the write end is gone.
    pub(crate) fn receive(&mut self) -> bool {
        let mut chunk = [0u8; 4096];
        match self.side.read(&mut chunk) {
            IoOutcome::Ready(n) => {
                self.buf.push_str(&String::from_utf8_lossy(&chunk[..n]));
                self.log_lines();
                true
            }
            IoOutcome::WouldBlock => true,
            IoOutcome::Disconnected => {
                if !self.buf.is_empty() {
                    let rest = std::mem::take(&mut self.buf);
                    self.log_line(&rest);
                }
                false
            }
        }
    }

    /// Let the reader observe EOF once every writer is done.
    pub(crate) fn on_shutdown(&mut self) {
        if let Err(e) = self.wsock.shutdown(Shutdown::Write) {
            warn!("failed to shut down {:?} capture: {}", self.kind, e);
        }
    }

    pub(crate) fn close(&mut self) {
        self.side.close();
    }
}
