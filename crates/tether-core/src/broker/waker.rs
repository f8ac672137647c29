//! Self-pipe used to hand closures to the I/O thread.

use super::Io;
use crate::config::BrokerConfig;
use parking_lot::Mutex;
use std::io::{self, Read, Write};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};

/// Work shipped to the I/O thread.
pub type Deferred = Box<dyn FnOnce(&mut Io) + Send>;

/// Write half of the waker, shared by every thread holding a broker handle.
pub(crate) struct Waker {
    queue: Mutex<Vec<Deferred>>,
    wsock: UnixStream,
    closed: AtomicBool,
}

impl Waker {
    /// Create the waker and the read half the I/O thread polls.
    pub(crate) fn pair() -> io::Result<(Waker, UnixStream)> {
        let (rsock, wsock) = UnixStream::pair()?;
        rsock.set_nonblocking(true)?;
        wsock.set_nonblocking(true)?;
        Ok((
            Waker {
                queue: Mutex::new(Vec::new()),
                wsock,
                closed: AtomicBool::new(false),
            },
            rsock,
        ))
    }

    /// Queue `func`. Returns false, dropping `func`, once the broker is gone.
    pub(crate) fn push(&self, func: Deferred) -> bool {
        let mut queue = self.queue.lock();
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        queue.push(func);
        true
    }

    /// Write one byte to interrupt the I/O thread's poll.
    pub(crate) fn wake(&self) {
        match (&self.wsock).write(b"\x00") {
            Ok(_) => {}
            // A full buffer already guarantees a wakeup.
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e)
                if matches!(
                    e.raw_os_error(),
                    Some(libc::EBADF) | Some(libc::EPIPE) | Some(libc::ECONNRESET)
                ) => {}
            Err(e) => tracing::warn!("failed to wake broker: {}", e),
        }
    }

    pub(crate) fn take(&self) -> Vec<Deferred> {
        std::mem::take(&mut *self.queue.lock())
    }

    /// Deferred calls not yet run; these hold the broker open during shutdown.
    pub(crate) fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    /// Refuse further work and return whatever was still queued.
    pub(crate) fn close(&self) -> Vec<Deferred> {
        let mut queue = self.queue.lock();
        self.closed.store(true, Ordering::Release);
        std::mem::take(&mut *queue)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Swallow pending wake bytes on the read half.
pub(crate) fn drain(rsock: &UnixStream) {
    let mut buf = [0u8; BrokerConfig::WAKER_DRAIN_SIZE];
    loop {
        match (&*rsock).read(&mut buf) {
            Ok(0) => return,
            Ok(_) => continue,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(_) => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::poller::wait_readable;
    use std::os::unix::io::AsRawFd;
    use std::time::Duration;

    #[test]
    fn test_wake_makes_read_half_readable() {
        let (waker, rsock) = Waker::pair().unwrap();
        assert!(!wait_readable(rsock.as_raw_fd(), Some(Duration::from_millis(10))).unwrap());
        waker.wake();
        assert!(wait_readable(rsock.as_raw_fd(), Some(Duration::from_secs(1))).unwrap());
        drain(&rsock);
        assert!(!wait_readable(rsock.as_raw_fd(), Some(Duration::from_millis(10))).unwrap());
    }

    #[test]
    fn test_closed_waker_drops_work() {
        let (waker, _rsock) = Waker::pair().unwrap();
        assert!(waker.push(Box::new(|_| {})));
        assert_eq!(waker.pending(), 1);
        assert_eq!(waker.close().len(), 1);
        assert!(!waker.push(Box::new(|_| {})));
        assert!(waker.is_closed());
        assert_eq!(waker.pending(), 0);
    }
}
