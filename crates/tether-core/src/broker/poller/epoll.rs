//! Level-triggered epoll back-end.

use super::{timeout_millis, Poller, Readiness, Registrations, Token};
use std::fs::File;
use std::io;
use std::os::unix::prelude::*;
use std::time::Duration;

const MAX_EVENTS: usize = 64;

#[derive(Debug)]
pub struct EpollPoller {
    epfd: Option<File>,
    regs: Registrations,
}

impl EpollPoller {
    pub fn new() -> io::Result<Self> {
        // SAFETY: epoll_create1 creates a new, uniquely owned fd.
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: fd was just returned by epoll_create1 and is owned by nobody else.
        let epfd = unsafe { File::from_raw_fd(fd) };
        Ok(Self {
            epfd: Some(epfd),
            regs: Registrations::new(),
        })
    }

    fn mask(&self, fd: RawFd) -> u32 {
        let mut mask = 0;
        if self.regs.has(fd, Readiness::Read) {
            mask |= (libc::EPOLLIN | libc::EPOLLHUP) as u32;
        }
        if self.regs.has(fd, Readiness::Write) {
            mask |= libc::EPOLLOUT as u32;
        }
        mask
    }

    fn ctl(&self, op: i32, fd: RawFd, events: u32) -> io::Result<()> {
        let Some(epfd) = &self.epfd else {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "poller closed"));
        };
        let mut event = libc::epoll_event {
            events,
            u64: fd as u64,
        };
        // SAFETY: safe to call with any fd; event outlives the call.
        let rc = unsafe { libc::epoll_ctl(epfd.as_raw_fd(), op, fd, &mut event) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn start(&mut self, fd: RawFd, token: Token, readiness: Readiness) -> io::Result<()> {
        let fresh = self.regs.add(fd, token, readiness);
        let op = if fresh {
            libc::EPOLL_CTL_ADD
        } else {
            libc::EPOLL_CTL_MOD
        };
        let result = self.ctl(op, fd, self.mask(fd));
        if result.is_err() {
            self.regs.remove(fd, readiness);
        }
        result
    }

    fn stop(&mut self, fd: RawFd, readiness: Readiness) {
        if !self.regs.has(fd, readiness) {
            return;
        }
        let result = if self.regs.remove(fd, readiness) {
            self.ctl(libc::EPOLL_CTL_MOD, fd, self.mask(fd))
        } else {
            self.ctl(libc::EPOLL_CTL_DEL, fd, 0)
        };
        if let Err(e) = result {
            tracing::debug!(target: "tether::io", "epoll_ctl on fd {} failed: {}", fd, e);
        }
    }
}

impl Poller for EpollPoller {
    fn name(&self) -> &'static str {
        "epoll"
    }

    fn start_receive(&mut self, fd: RawFd, token: Token) -> io::Result<()> {
        self.start(fd, token, Readiness::Read)
    }

    fn stop_receive(&mut self, fd: RawFd) {
        self.stop(fd, Readiness::Read)
    }

    fn start_transmit(&mut self, fd: RawFd, token: Token) -> io::Result<()> {
        self.start(fd, token, Readiness::Write)
    }

    fn stop_transmit(&mut self, fd: RawFd) {
        self.stop(fd, Readiness::Write)
    }

    fn poll(&mut self, timeout: Option<Duration>) -> io::Result<Vec<(RawFd, Readiness)>> {
        self.regs.next_generation();
        let Some(epfd) = &self.epfd else {
            return Ok(Vec::new());
        };

        let mut events = [libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];
        // SAFETY: maxevents matches the length of the events slice.
        let n = unsafe {
            libc::epoll_wait(
                epfd.as_raw_fd(),
                events.as_mut_ptr(),
                MAX_EVENTS as i32,
                timeout_millis(timeout),
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(Vec::new());
            }
            return Err(err);
        }

        let mut ready = Vec::with_capacity(n as usize);
        for event in &events[..n as usize] {
            let fd = event.u64 as RawFd;
            let bits = event.events;
            let hangup = bits & (libc::EPOLLHUP | libc::EPOLLERR) as u32 != 0;
            if bits & libc::EPOLLIN as u32 != 0 || (hangup && self.regs.has(fd, Readiness::Read)) {
                ready.push((fd, Readiness::Read));
            }
            if bits & libc::EPOLLOUT as u32 != 0
                || (hangup && self.regs.has(fd, Readiness::Write))
            {
                ready.push((fd, Readiness::Write));
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
        self.epfd = None;
    }
}
