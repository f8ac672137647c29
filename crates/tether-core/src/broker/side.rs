//! One direction of a stream's OS descriptor.

use crate::error::Result;
use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};

/// Result of a non-blocking read or write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IoOutcome {
    Ready(usize),
    WouldBlock,
    Disconnected,
}

/// Owns a descriptor in non-blocking mode and folds the disconnect-style
/// errno values into [`IoOutcome::Disconnected`].
#[derive(Debug)]
pub(crate) struct Side {
    file: Option<File>,
    fd: RawFd,
    /// Whether this side holds the broker open during shutdown.
    pub keep_alive: bool,
}

pub(crate) fn set_nonblock(fd: RawFd) -> Result<()> {
    let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
    fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    Ok(())
}

pub(crate) fn set_block(fd: RawFd) -> Result<()> {
    let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
    fcntl(fd, FcntlArg::F_SETFL(flags & !OFlag::O_NONBLOCK))?;
    Ok(())
}

pub(crate) fn set_cloexec(fd: RawFd) -> Result<()> {
    let flags = FdFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFD)?);
    fcntl(fd, FcntlArg::F_SETFD(flags | FdFlag::FD_CLOEXEC))?;
    Ok(())
}

fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EIO) | Some(libc::ECONNRESET) | Some(libc::EPIPE)
    )
}

impl Side {
    pub(crate) fn new(fd: OwnedFd, keep_alive: bool) -> Result<Self> {
        let raw = fd.as_raw_fd();
        set_nonblock(raw)?;
        set_cloexec(raw)?;
        Ok(Self {
            file: Some(File::from(fd)),
            fd: raw,
            keep_alive,
        })
    }

    /// The descriptor number, or `None` once closed.
    pub(crate) fn fd(&self) -> Option<RawFd> {
        self.file.as_ref().map(|_| self.fd)
    }

    pub(crate) fn closed(&self) -> bool {
        self.file.is_none()
    }

    pub(crate) fn read(&mut self, buf: &mut [u8]) -> IoOutcome {
        let Some(file) = self.file.as_mut() else {
            return IoOutcome::Disconnected;
        };
        loop {
            match file.read(buf) {
                Ok(0) => return IoOutcome::Disconnected,
                Ok(n) => return IoOutcome::Ready(n),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return IoOutcome::WouldBlock,
                Err(e) => {
                    if !is_disconnect(&e) {
                        tracing::debug!(target: "tether::io", "read on fd {} failed: {}", self.fd, e);
                    }
                    return IoOutcome::Disconnected;
                }
            }
        }
    }

    pub(crate) fn write(&mut self, buf: &[u8]) -> IoOutcome {
        let Some(file) = self.file.as_mut() else {
            return IoOutcome::Disconnected;
        };
        loop {
            match file.write(buf) {
                Ok(n) => return IoOutcome::Ready(n),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return IoOutcome::WouldBlock,
                Err(e) => {
                    if !is_disconnect(&e) {
                        tracing::debug!(target: "tether::io", "write on fd {} failed: {}", self.fd, e);
                    }
                    return IoOutcome::Disconnected;
                }
            }
        }
    }

    /// Close the descriptor. Closing twice is a no-op.
    pub(crate) fn close(&mut self) {
        if self.file.take().is_some() {
            tracing::trace!(target: "tether::io", "closed fd {}", self.fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixStream;

    #[test]
    fn test_side_reports_would_block_then_disconnect() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut side = Side::new(OwnedFd::from(a), true).unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(side.read(&mut buf), IoOutcome::WouldBlock);

        (&b).write_all(b"hi").unwrap();
        assert_eq!(side.read(&mut buf), IoOutcome::Ready(2));

        drop(b);
        assert_eq!(side.read(&mut buf), IoOutcome::Disconnected);
        assert_eq!(side.write(b"x"), IoOutcome::Disconnected);
    }

    #[test]
    fn test_double_close_is_noop() {
        let (a, _b) = UnixStream::pair().unwrap();
        let mut side = Side::new(OwnedFd::from(a), false).unwrap();
        assert!(side.fd().is_some());
        side.close();
        side.close();
        assert!(side.closed());
        assert_eq!(side.fd(), None);
    }
}
