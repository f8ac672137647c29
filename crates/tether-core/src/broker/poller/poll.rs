//! Portable poll(2) back-end.

use super::{timeout_millis, Poller, Readiness, Registrations, Token};
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

#[derive(Debug)]
pub struct PollPoller {
    regs: Registrations,
}

impl PollPoller {
    pub fn new() -> Self {
        Self {
            regs: Registrations::new(),
        }
    }
}

impl Default for PollPoller {
    fn default() -> Self {
        Self::new()
    }
}

impl Poller for PollPoller {
    fn name(&self) -> &'static str {
        "poll"
    }

    fn start_receive(&mut self, fd: RawFd, token: Token) -> io::Result<()> {
        self.regs.add(fd, token, Readiness::Read);
        Ok(())
    }

    fn stop_receive(&mut self, fd: RawFd) {
        self.regs.remove(fd, Readiness::Read);
    }

    fn start_transmit(&mut self, fd: RawFd, token: Token) -> io::Result<()> {
        self.regs.add(fd, token, Readiness::Write);
        Ok(())
    }

    fn stop_transmit(&mut self, fd: RawFd) {
        self.regs.remove(fd, Readiness::Write);
    }

    fn poll(&mut self, timeout: Option<Duration>) -> io::Result<Vec<(RawFd, Readiness)>> {
        self.regs.next_generation();

        let mut pfds: Vec<libc::pollfd> = self
            .regs
            .fds()
            .map(|fd| {
                let mut events = 0;
                if self.regs.has(fd, Readiness::Read) {
                    events |= libc::POLLIN;
                }
                if self.regs.has(fd, Readiness::Write) {
                    events |= libc::POLLOUT;
                }
                libc::pollfd {
                    fd,
                    events,
                    revents: 0,
                }
            })
            .collect();

        // SAFETY: nfds matches the length of the pollfd vector.
        let rc = unsafe {
            libc::poll(
                pfds.as_mut_ptr(),
                pfds.len() as libc::nfds_t,
                timeout_millis(timeout),
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(Vec::new());
            }
            return Err(err);
        }

        let mut ready = Vec::new();
        for pfd in pfds.iter().filter(|p| p.revents != 0) {
            let hangup = pfd.revents & (libc::POLLHUP | libc::POLLERR | libc::POLLNVAL) != 0;
            if pfd.revents & libc::POLLIN != 0 || (hangup && pfd.events & libc::POLLIN != 0) {
                ready.push((pfd.fd, Readiness::Read));
            }
            if pfd.revents & libc::POLLOUT != 0 || (hangup && pfd.events & libc::POLLOUT != 0) {
                ready.push((pfd.fd, Readiness::Write));
            }
        }
        Ok(ready)
    }

    fn resolve(&self, fd: RawFd, readiness: Readiness) -> Option<Token> {
        self.regs.resolve(fd, readiness)
    }

    fn readers(&self) -> Vec<Token> {
        self.regs.readers()
    }

    fn writers(&self) -> Vec<Token> {
        self.regs.writers()
    }

    fn close(&mut self) {
        self.regs.clear();
    }
}
