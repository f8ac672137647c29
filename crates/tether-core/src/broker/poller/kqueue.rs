//! kqueue back-end for macOS and the BSDs.

use super::{Poller, Readiness, Registrations, Token};
use std::fs::File;
use std::io;
use std::os::unix::prelude::*;
use std::time::Duration;

const MAX_EVENTS: usize = 64;

#[derive(Debug)]
pub struct KqueuePoller {
    kqfd: Option<File>,
    regs: Registrations,
}

fn make_event(fd: RawFd, filter: Readiness, flags: u16) -> libc::kevent {
    // SAFETY: kevent is a plain C struct; all-zero is a valid value.
    let mut ev: libc::kevent = unsafe { std::mem::zeroed() };
    ev.ident = fd as _;
    ev.filter = match filter {
        Readiness::Read => libc::EVFILT_READ,
        Readiness::Write => libc::EVFILT_WRITE,
    };
    ev.flags = flags as _;
    ev
}

impl KqueuePoller {
    pub fn new() -> io::Result<Self> {
        // SAFETY: kqueue creates a new, uniquely owned fd.
        let fd = unsafe { libc::kqueue() };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: fd was just returned by kqueue and is owned by nobody else.
        let kqfd = unsafe { File::from_raw_fd(fd) };
        Ok(Self {
            kqfd: Some(kqfd),
            regs: Registrations::new(),
        })
    }

    fn control(&self, change: libc::kevent) -> io::Result<()> {
        let Some(kqfd) = &self.kqfd else {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "poller closed"));
        };
        // SAFETY: one change is passed and no events are requested.
        let rc = unsafe {
            libc::kevent(
                kqfd.as_raw_fd(),
                &change,
                1,
                std::ptr::null_mut(),
                0,
                std::ptr::null(),
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn start(&mut self, fd: RawFd, token: Token, readiness: Readiness) -> io::Result<()> {
        if self.regs.has(fd, readiness) {
            self.regs.add(fd, token, readiness);
            return Ok(());
        }
        self.control(make_event(fd, readiness, libc::EV_ADD as u16))?;
        self.regs.add(fd, token, readiness);
        Ok(())
    }

    fn stop(&mut self, fd: RawFd, readiness: Readiness) {
        if !self.regs.has(fd, readiness) {
            return;
        }
        self.regs.remove(fd, readiness);
        if let Err(e) = self.control(make_event(fd, readiness, libc::EV_DELETE as u16)) {
            tracing::debug!(target: "tether::io", "kevent delete on fd {} failed: {}", fd, e);
        }
    }
}

impl Poller for KqueuePoller {
    fn name(&self) -> &'static str {
        "kqueue"
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
        let Some(kqfd) = &self.kqfd else {
            return Ok(Vec::new());
        };

        let ts = timeout.map(|t| libc::timespec {
            tv_sec: t.as_secs() as _,
            tv_nsec: t.subsec_nanos() as _,
        });
        let ts_ptr = ts
            .as_ref()
            .map_or(std::ptr::null(), |t| t as *const libc::timespec);

        // SAFETY: kevent is a plain C struct; all-zero is a valid value.
        let mut events: [libc::kevent; MAX_EVENTS] = unsafe { std::mem::zeroed() };
        // SAFETY: the event list length matches the array and ts_ptr is null or
        // points at a timespec living until the call returns.
        let n = unsafe {
            libc::kevent(
                kqfd.as_raw_fd(),
                std::ptr::null(),
                0,
                events.as_mut_ptr(),
                MAX_EVENTS as _,
                ts_ptr,
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
            let fd = event.ident as RawFd;
            if event.filter == libc::EVFILT_READ {
                ready.push((fd, Readiness::Read));
            } else if event.filter == libc::EVFILT_WRITE {
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
        self.kqfd = None;
    }
}
