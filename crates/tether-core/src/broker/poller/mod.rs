//! Readiness multiplexers driving the broker.
//!
//! Back-ends expose the same small surface: start/stop receive and transmit
//! interest for a descriptor, `poll`, and `close`. Every registration records
//! the generation it was made in; [`Poller::resolve`] only reports readiness
//! for registrations older than the current `poll` call, so a descriptor
//! registered while a batch is being dispatched never fires within that batch.

#![allow(unsafe_code)]

#[cfg(any(target_os = "linux", target_os = "android"))]
mod epoll;
#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
mod kqueue;
mod poll;

use crate::config::PollerKind;
use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

pub use poll::PollPoller;

/// Opaque registration key handed back on readiness.
pub type Token = u64;

/// Direction a descriptor became ready for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Readiness {
    Read,
    Write,
}

/// Common interface over epoll, kqueue and poll(2).
pub trait Poller: Send {
    fn name(&self) -> &'static str;

    fn start_receive(&mut self, fd: RawFd, token: Token) -> io::Result<()>;
    fn stop_receive(&mut self, fd: RawFd);
    fn start_transmit(&mut self, fd: RawFd, token: Token) -> io::Result<()>;
    fn stop_transmit(&mut self, fd: RawFd);

    /// Block until at least one registered descriptor is ready or `timeout`
    /// passes. Starts a new generation.
    fn poll(&mut self, timeout: Option<Duration>) -> io::Result<Vec<(RawFd, Readiness)>>;

    /// Map a reported event to the token registered for it, if that
    /// registration still exists and predates the current generation.
    fn resolve(&self, fd: RawFd, readiness: Readiness) -> Option<Token>;

    /// Tokens with receive interest.
    fn readers(&self) -> Vec<Token>;
    /// Tokens with transmit interest.
    fn writers(&self) -> Vec<Token>;

    fn close(&mut self);
}

/// Build the poller for `kind`, falling back to poll(2) when the requested
/// mechanism does not exist on this platform.
pub fn create(kind: PollerKind) -> io::Result<Box<dyn Poller>> {
    match kind {
        #[cfg(any(target_os = "linux", target_os = "android"))]
        PollerKind::Epoll => Ok(Box::new(epoll::EpollPoller::new()?)),
        #[cfg(any(
            target_os = "macos",
            target_os = "ios",
            target_os = "freebsd",
            target_os = "openbsd",
            target_os = "dragonfly"
        ))]
        PollerKind::Kqueue => Ok(Box::new(kqueue::KqueuePoller::new()?)),
        _ => Ok(Box::new(PollPoller::new())),
    }
}

/// Registration bookkeeping shared by every back-end.
#[derive(Debug, Default)]
pub(crate) struct Registrations {
    generation: u64,
    rfds: HashMap<RawFd, (Token, u64)>,
    wfds: HashMap<RawFd, (Token, u64)>,
}

impl Registrations {
    pub(crate) fn new() -> Self {
        Self {
            generation: 1,
            ..Default::default()
        }
    }

    pub(crate) fn next_generation(&mut self) {
        self.generation += 1;
    }

    /// Returns true when the descriptor had no interest in either direction
    /// before this call.
    pub(crate) fn add(&mut self, fd: RawFd, token: Token, readiness: Readiness) -> bool {
        let fresh = !self.rfds.contains_key(&fd) && !self.wfds.contains_key(&fd);
        let entry = (token, self.generation);
        match readiness {
            Readiness::Read => self.rfds.insert(fd, entry),
            Readiness::Write => self.wfds.insert(fd, entry),
        };
        fresh
    }

    /// Returns true when the descriptor still has interest in some direction.
    pub(crate) fn remove(&mut self, fd: RawFd, readiness: Readiness) -> bool {
        match readiness {
            Readiness::Read => self.rfds.remove(&fd),
            Readiness::Write => self.wfds.remove(&fd),
        };
        self.rfds.contains_key(&fd) || self.wfds.contains_key(&fd)
    }

    pub(crate) fn has(&self, fd: RawFd, readiness: Readiness) -> bool {
        match readiness {
            Readiness::Read => self.rfds.contains_key(&fd),
            Readiness::Write => self.wfds.contains_key(&fd),
        }
    }

    pub(crate) fn resolve(&self, fd: RawFd, readiness: Readiness) -> Option<Token> {
        let map = match readiness {
            Readiness::Read => &self.rfds,
            Readiness::Write => &self.wfds,
        };
        match map.get(&fd) {
            Some(&(token, gen)) if gen < self.generation => Some(token),
            _ => None,
        }
    }

    pub(crate) fn readers(&self) -> Vec<Token> {
        self.rfds.values().map(|(token, _)| *token).collect()
    }

    pub(crate) fn writers(&self) -> Vec<Token> {
        self.wfds.values().map(|(token, _)| *token).collect()
    }

    pub(crate) fn fds(&self) -> impl Iterator<Item = RawFd> + '_ {
        let mut fds: Vec<RawFd> = self.rfds.keys().chain(self.wfds.keys()).copied().collect();
        fds.sort_unstable();
        fds.dedup();
        fds.into_iter()
    }

    pub(crate) fn clear(&mut self) {
        self.rfds.clear();
        self.wfds.clear();
    }
}

/// Milliseconds for a poll-style timeout argument; -1 blocks forever.
pub(crate) fn timeout_millis(timeout: Option<Duration>) -> i32 {
    match timeout {
        None => -1,
        Some(t) => {
            // Round up so a sub-millisecond remainder does not spin.
            let ms = t.as_micros().div_ceil(1000);
            i32::try_from(ms).unwrap_or(i32::MAX)
        }
    }
}

fn wait_for(fd: RawFd, events: libc::c_short, timeout: Option<Duration>) -> io::Result<bool> {
    let deadline = timeout.map(|t| Instant::now() + t);
    loop {
        let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
        let mut pfd = libc::pollfd {
            fd,
            events,
            revents: 0,
        };
        // SAFETY: pfd is a single valid pollfd and nfds is 1.
        let rc = unsafe { libc::poll(&mut pfd, 1, timeout_millis(remaining)) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        return Ok(rc > 0);
    }
}

/// Sleep until `fd` is readable, hung up, or `timeout` passes. Returns false on
/// timeout.
pub(crate) fn wait_readable(fd: RawFd, timeout: Option<Duration>) -> io::Result<bool> {
    wait_for(fd, libc::POLLIN, timeout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn test_registration_made_this_generation_is_hidden() {
        let mut regs = Registrations::new();
        regs.add(5, 11, Readiness::Read);
        assert_eq!(regs.resolve(5, Readiness::Read), None);
        regs.next_generation();
        assert_eq!(regs.resolve(5, Readiness::Read), Some(11));

        // Re-registering during dispatch hides it again until the next poll.
        regs.remove(5, Readiness::Read);
        regs.add(5, 12, Readiness::Read);
        assert_eq!(regs.resolve(5, Readiness::Read), None);
    }

    #[test]
    fn test_registration_tracks_both_directions() {
        let mut regs = Registrations::new();
        assert!(regs.add(7, 1, Readiness::Read));
        assert!(!regs.add(7, 1, Readiness::Write));
        assert!(regs.remove(7, Readiness::Read));
        assert!(!regs.remove(7, Readiness::Write));
    }

    #[test]
    fn test_timeout_millis_rounds_up() {
        assert_eq!(timeout_millis(None), -1);
        assert_eq!(timeout_millis(Some(Duration::from_micros(1))), 1);
        assert_eq!(timeout_millis(Some(Duration::from_millis(250))), 250);
    }

    fn exercise(mut poller: Box<dyn Poller>) {
        let (a, mut b) = UnixStream::pair().unwrap();
        poller.start_receive(a.as_raw_fd(), 3).unwrap();
        assert!(poller.poll(Some(Duration::from_millis(10))).unwrap().is_empty());

        b.write_all(b"x").unwrap();
        let events = poller.poll(Some(Duration::from_secs(5))).unwrap();
        let tokens: Vec<_> = events
            .iter()
            .filter_map(|(fd, r)| poller.resolve(*fd, *r))
            .collect();
        assert_eq!(tokens, vec![3]);

        poller.start_transmit(a.as_raw_fd(), 3).unwrap();
        let events = poller.poll(Some(Duration::from_secs(5))).unwrap();
        assert!(events.contains(&(a.as_raw_fd(), Readiness::Write)));
        assert_eq!(poller.writers(), vec![3]);

        poller.stop_transmit(a.as_raw_fd());
        poller.stop_receive(a.as_raw_fd());
        assert!(poller.readers().is_empty());
        poller.close();
    }

    #[test]
    fn test_poll_backend() {
        exercise(Box::new(PollPoller::new()));
    }

    #[test]
    fn test_preferred_backend() {
        exercise(create(PollerKind::preferred()).unwrap());
    }

    #[test]
    fn test_wait_readable_times_out() {
        let (a, mut b) = UnixStream::pair().unwrap();
        assert!(!wait_readable(a.as_raw_fd(), Some(Duration::from_millis(20))).unwrap());
        b.write_all(b"y").unwrap();
        assert!(wait_readable(a.as_raw_fd(), None).unwrap());
    }
}
