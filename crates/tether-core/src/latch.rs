//! Interruptible cross-thread queue.
//!
//! A thread that must wait parks on the read end of a socket pair dedicated to
//! it while it sleeps, so waiting is an ordinary readiness wait. `put` hands
//! the item at queue position `i` to sleeper `i` by writing that sleeper's
//! cookie to its socket pair. Socket pairs are pooled per process and the pool
//! is discarded after `fork`.
//!
//! Invariants, all under the state lock:
//! - the first `waking` sleepers have been woken and each owns the queue item
//!   at its own index;
//! - `waking <= queue.len()` unless the latch is closed;
//! - a cookie is written only while the lock is held, so a sleeper that
//!   finds itself woken always finds its cookie already buffered.

use crate::broker::poller::wait_readable;
use crate::error::{Result, TetherError};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Read, Write};
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};

const COOKIE_SIZE: usize = 33;

static NEXT_LATCH_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_SLEEP_ID: AtomicU64 = AtomicU64::new(1);

type SocketPair = (UnixStream, Arc<UnixStream>);

struct IdlePairs {
    pid: u32,
    pairs: Vec<SocketPair>,
}

static IDLE_PAIRS: Mutex<IdlePairs> = parking_lot::const_mutex(IdlePairs {
    pid: 0,
    pairs: Vec::new(),
});

fn take_socketpair() -> io::Result<SocketPair> {
    {
        let mut idle = IDLE_PAIRS.lock();
        let pid = std::process::id();
        if idle.pid != pid {
            idle.pairs.clear();
            idle.pid = pid;
        }
        if let Some(pair) = idle.pairs.pop() {
            return Ok(pair);
        }
    }
    let (rsock, wsock) = UnixStream::pair()?;
    rsock.set_nonblocking(true)?;
    wsock.set_nonblocking(true)?;
    Ok((rsock, Arc::new(wsock)))
}

fn release_socketpair(pair: SocketPair) {
    let mut idle = IDLE_PAIRS.lock();
    if idle.pid == std::process::id() {
        idle.pairs.push(pair);
    }
}

struct Sleeper {
    wsock: Arc<UnixStream>,
    cookie: [u8; COOKIE_SIZE],
}

impl Sleeper {
    fn wake(&self) {
        if let Err(e) = (&*self.wsock).write_all(&self.cookie) {
            error!("latch failed to wake sleeper: {}", e);
        }
    }
}

struct LatchState<T> {
    queue: VecDeque<T>,
    sleeping: Vec<Sleeper>,
    waking: usize,
    closed: bool,
}

struct LatchInner<T> {
    id: u64,
    state: Mutex<LatchState<T>>,
}

/// Multi-producer multi-consumer queue whose consumers sleep on OS sockets.
pub struct Latch<T> {
    inner: Arc<LatchInner<T>>,
}

impl<T> Clone for Latch<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send> Default for Latch<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send> Latch<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(LatchInner {
                id: NEXT_LATCH_ID.fetch_add(1, Ordering::Relaxed),
                state: Mutex::new(LatchState {
                    queue: VecDeque::new(),
                    sleeping: Vec::new(),
                    waking: 0,
                    closed: false,
                }),
            }),
        }
    }

    /// Forget pooled socket pairs. Call in a child right after `fork`; the pool
    /// also notices a changed pid on its own.
    pub fn on_fork() {
        let mut idle = IDLE_PAIRS.lock();
        idle.pairs.clear();
        idle.pid = std::process::id();
    }

    fn make_cookie(&self) -> [u8; COOKIE_SIZE] {
        let seq = NEXT_SLEEP_ID.fetch_add(1, Ordering::Relaxed);
        let text = format!("{:016x}-{:016x}", self.inner.id, seq);
        let mut cookie = [0u8; COOKIE_SIZE];
        cookie.copy_from_slice(&text.as_bytes()[..COOKIE_SIZE]);
        cookie
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Number of queued items.
    pub fn size(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Close the latch, waking every sleeper with [`TetherError::LatchClosed`].
    pub fn close(&self) {
        let mut state = self.inner.state.lock();
        state.closed = true;
        while state.waking < state.sleeping.len() {
            let i = state.waking;
            state.sleeping[i].wake();
            state.waking += 1;
        }
    }

    /// Enqueue `item`, waking one sleeper if any is not yet woken.
    pub fn put(&self, item: T) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.closed {
            return Err(TetherError::LatchClosed);
        }
        state.queue.push_back(item);
        if state.waking < state.sleeping.len() {
            let i = state.waking;
            state.sleeping[i].wake();
            state.waking += 1;
        }
        Ok(())
    }

    /// Block until an item is available or `timeout` passes.
    pub fn get(&self, timeout: Option<Duration>) -> Result<T> {
        self.get_with(timeout, true)
    }

    /// Take an item without blocking.
    pub fn try_get(&self) -> Result<T> {
        self.get_with(None, false)
    }

    /// Return the next item. With `block` false, an empty latch raises
    /// [`TetherError::Timeout`] immediately.
    pub fn get_with(&self, timeout: Option<Duration>, block: bool) -> Result<T> {
        let (pair, cookie) = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(TetherError::LatchClosed);
            }
            let i = state.sleeping.len();
            if state.queue.len() > i {
                if let Some(item) = state.queue.remove(i) {
                    return Ok(item);
                }
            }
            if !block {
                return Err(TetherError::Timeout);
            }
            let pair = take_socketpair()?;
            let cookie = self.make_cookie();
            state.sleeping.push(Sleeper {
                wsock: pair.1.clone(),
                cookie,
            });
            (pair, cookie)
        };

        let wait = wait_readable(pair.0.as_raw_fd(), timeout);
        self.finish_sleep(pair, cookie, wait)
    }

    fn finish_sleep(
        &self,
        pair: SocketPair,
        cookie: [u8; COOKIE_SIZE],
        wait: io::Result<bool>,
    ) -> Result<T> {
        let mut state = self.inner.state.lock();
        let Some(i) = state.sleeping.iter().position(|s| s.cookie == cookie) else {
            return Err(TetherError::Other("latch sleeper vanished".into()));
        };
        state.sleeping.remove(i);

        let woken = i < state.waking;
        if woken {
            let mut got = [0u8; COOKIE_SIZE];
            match (&pair.0).read_exact(&mut got) {
                Ok(()) if got == cookie => {}
                Ok(()) => error!("latch woken with a foreign cookie"),
                Err(e) => error!("latch wake cookie missing: {}", e),
            }
        }
        release_socketpair(pair);

        if !woken {
            return match wait {
                Err(e) => Err(e.into()),
                Ok(_) => Err(TetherError::Timeout),
            };
        }
        if let Err(e) = wait {
            warn!("latch poll failed after wakeup: {}", e);
        }

        state.waking -= 1;
        if state.closed {
            return Err(TetherError::LatchClosed);
        }
        state
            .queue
            .remove(i)
            .ok_or_else(|| TetherError::Other("latch woken without an item".into()))
    }
}

impl<T> fmt::Debug for Latch<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        write!(
            f,
            "Latch({}, size={}, sleeping={}, closed={})",
            self.inner.id,
            state.queue.len(),
            state.sleeping.len(),
            state.closed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_put_then_get() {
        let latch = Latch::new();
        latch.put(1).unwrap();
        latch.put(2).unwrap();
        assert_eq!(latch.size(), 2);
        assert_eq!(latch.get(None).unwrap(), 1);
        assert_eq!(latch.try_get().unwrap(), 2);
        assert!(matches!(latch.try_get(), Err(TetherError::Timeout)));
    }

    #[test]
    fn test_get_times_out() {
        let latch: Latch<u32> = Latch::new();
        let start = Instant::now();
        let err = latch.get(Some(Duration::from_millis(50))).unwrap_err();
        assert!(err.is_timeout());
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn test_close_wakes_sleepers() {
        let latch: Latch<u32> = Latch::new();
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let latch = latch.clone();
                thread::spawn(move || latch.get(None))
            })
            .collect();
        thread::sleep(Duration::from_millis(50));
        latch.close();
        for waiter in waiters {
            assert!(matches!(waiter.join().unwrap(), Err(TetherError::LatchClosed)));
        }
        assert!(matches!(latch.put(1), Err(TetherError::LatchClosed)));
    }

    #[test]
    fn test_sleeper_receives_put() {
        let latch = Latch::new();
        let reader = {
            let latch = latch.clone();
            thread::spawn(move || latch.get(Some(Duration::from_secs(10))))
        };
        thread::sleep(Duration::from_millis(30));
        latch.put("hello").unwrap();
        assert_eq!(reader.join().unwrap().unwrap(), "hello");
    }

    #[test]
    fn test_many_producers_many_consumers() {
        const PRODUCERS: usize = 8;
        const PER_PRODUCER: usize = 50;
        const CONSUMERS: usize = 6;
        let total = PRODUCERS * PER_PRODUCER;

        let latch = Latch::new();
        let consumers: Vec<_> = (0..CONSUMERS)
            .map(|c| {
                let latch = latch.clone();
                let share = total / CONSUMERS + usize::from(c < total % CONSUMERS);
                thread::spawn(move || {
                    (0..share)
                        .map(|_| latch.get(Some(Duration::from_secs(20))).unwrap())
                        .collect::<Vec<usize>>()
                })
            })
            .collect();
        let producers: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let latch = latch.clone();
                thread::spawn(move || {
                    for i in 0..PER_PRODUCER {
                        latch.put(p * PER_PRODUCER + i).unwrap();
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }

        let mut seen = HashSet::new();
        for consumer in consumers {
            for item in consumer.join().unwrap() {
                assert!(seen.insert(item), "item {} delivered twice", item);
            }
        }
        assert_eq!(seen.len(), total);
        assert!(latch.is_empty());
    }

    #[test]
    fn test_timed_out_sleeper_leaves_item_for_others() {
        let latch = Latch::new();
        assert!(latch.get(Some(Duration::from_millis(10))).is_err());
        latch.put(7).unwrap();
        assert_eq!(latch.get(Some(Duration::from_secs(1))).unwrap(), 7);
    }
}
