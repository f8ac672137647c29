//! The broker owns the single I/O thread.
//!
//! Every stream buffer, the route table and the handler table live in [`Io`],
//! which only the broker thread touches. Other threads reach it through
//! [`Broker::defer`], which queues a closure and writes a byte to the waker
//! socket so a sleeping `poll` returns promptly.
//!
//! Shutdown runs in phases:
//!
//! ```text
//! alive = false -> 'shutdown' listeners -> per-stream on_shutdown
//!   -> loop until nothing keeps the broker alive or the grace period ends
//!   -> force-disconnect stragglers -> dead-letter every handler -> 'exit'
//! ```

pub(crate) mod io_logger;
pub mod poller;
pub(crate) mod side;
pub(crate) mod stream;
pub(crate) mod waker;

pub use io_logger::StdioKind;
pub use poller::{Readiness, Token};
pub use stream::StreamRole;
pub use waker::Deferred;

use crate::config::{BrokerConfig, PollerKind};
use crate::error::{Result, TetherError};
use crate::latch::Latch;
use crate::message::{Message, SHUTDOWN};
use crate::router::RouterCore;
use io_logger::IoLogger;
use parking_lot::{Condvar, Mutex};
use poller::Poller;
use std::collections::HashMap;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};
use stream::{Stream, Transmitted};
use tracing::{debug, error, trace, warn};
use waker::Waker;

const WAKER_TOKEN: Token = 0;

type Listener = Box<dyn FnOnce() + Send>;

/// Anything the I/O thread polls besides the waker.
pub(crate) enum Endpoint {
    Stream(Stream),
    Logger(IoLogger),
}

#[derive(Default)]
struct Lifecycle {
    shutdown_fired: bool,
    exited: bool,
}

struct BrokerShared {
    waker: Waker,
    io_thread: Mutex<Option<ThreadId>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    alive: AtomicBool,
    lifecycle: Mutex<Lifecycle>,
    exited_cond: Condvar,
    shutdown_listeners: Mutex<Vec<Listener>>,
    exit_listeners: Mutex<Vec<Listener>>,
    shutdown_timeout: Duration,
}

/// Handle to the I/O thread. Cheap to clone.
#[derive(Clone)]
pub struct Broker {
    shared: Arc<BrokerShared>,
}

/// Resources the I/O thread takes ownership of when it starts.
pub(crate) struct BrokerSeed {
    poller: Box<dyn Poller>,
    rsock: UnixStream,
}

/// Runs a deferred closure's result back to the caller of `defer_sync`, or
/// closes the latch if the closure is dropped unrun.
struct ReplyGuard<T: Send + 'static> {
    latch: Option<Latch<T>>,
}

impl<T: Send + 'static> ReplyGuard<T> {
    fn finish(mut self, value: T) {
        if let Some(latch) = self.latch.take() {
            let _ = latch.put(value);
        }
    }
}

impl<T: Send + 'static> Drop for ReplyGuard<T> {
    fn drop(&mut self) {
        if let Some(latch) = self.latch.take() {
            latch.close();
        }
    }
}

impl Broker {
    pub(crate) fn new(kind: PollerKind, shutdown_timeout: Duration) -> Result<(Broker, BrokerSeed)> {
        let (waker, rsock) = Waker::pair()?;
        let poller = poller::create(kind)?;
        debug!("broker using {} poller", poller.name());
        let broker = Broker {
            shared: Arc::new(BrokerShared {
                waker,
                io_thread: Mutex::new(None),
                handle: Mutex::new(None),
                alive: AtomicBool::new(true),
                lifecycle: Mutex::new(Lifecycle::default()),
                exited_cond: Condvar::new(),
                shutdown_listeners: Mutex::new(Vec::new()),
                exit_listeners: Mutex::new(Vec::new()),
                shutdown_timeout,
            }),
        };
        Ok((broker, BrokerSeed { poller, rsock }))
    }

    /// Spawn the I/O thread around `router`.
    pub(crate) fn start(&self, seed: BrokerSeed, router: RouterCore) -> Result<()> {
        let broker = self.clone();
        let handle = thread::Builder::new()
            .name(BrokerConfig::THREAD_NAME.to_string())
            .spawn(move || {
                *broker.shared.io_thread.lock() = Some(thread::current().id());
                match Io::new(broker.clone(), seed, router) {
                    Ok(io) => io.run(),
                    Err(e) => {
                        error!("broker failed to start: {}", e);
                        broker.finish_exit();
                    }
                }
            })?;
        *self.shared.handle.lock() = Some(handle);
        Ok(())
    }

    /// True when called from the I/O thread.
    pub fn on_io_thread(&self) -> bool {
        *self.shared.io_thread.lock() == Some(thread::current().id())
    }

    pub fn is_alive(&self) -> bool {
        self.shared.alive.load(Ordering::Acquire)
    }

    pub fn has_exited(&self) -> bool {
        self.shared.lifecycle.lock().exited
    }

    /// Run `func` on the I/O thread.
    ///
    /// From the I/O thread itself the call is queued without a wake byte and
    /// runs as soon as the current callback returns, before the next poll.
    /// So inside a handler, a `Router::route` (which defers) lands after any
    /// direct `Io::route` or `Io::reply` made by the same handler.
    /// After the broker has exited `func` is dropped unrun and false is
    /// returned.
    pub fn defer<F>(&self, func: F) -> bool
    where
        F: FnOnce(&mut Io) + Send + 'static,
    {
        if !self.shared.waker.push(Box::new(func)) {
            debug!("broker has exited; dropping deferred call");
            return false;
        }
        if !self.on_io_thread() {
            self.shared.waker.wake();
        }
        true
    }

    /// Run `func` on the I/O thread and block until it returns its result.
    pub fn defer_sync<T, F>(&self, func: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Io) -> T + Send + 'static,
    {
        if self.on_io_thread() {
            return Err(TetherError::Other(
                "defer_sync() cannot be called from the I/O thread".into(),
            ));
        }
        let latch = Latch::new();
        let guard = ReplyGuard {
            latch: Some(latch.clone()),
        };
        self.defer(move |io| guard.finish(func(io)));
        latch.get(None).map_err(|e| match e {
            TetherError::LatchClosed => TetherError::Stream("broker exited before running call".into()),
            other => other,
        })
    }

    /// Ask the I/O thread to begin its shutdown sequence.
    pub fn shutdown(&self) {
        if self.shared.alive.swap(false, Ordering::AcqRel) {
            debug!("broker shutdown requested");
            self.shared.waker.wake();
        }
    }

    /// Wait for the I/O thread to exit.
    pub fn join(&self) -> Result<()> {
        if self.on_io_thread() {
            return Err(TetherError::Other("join() called from the I/O thread".into()));
        }
        let handle = self.shared.handle.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("broker thread panicked");
            }
            return Ok(());
        }
        let mut lifecycle = self.shared.lifecycle.lock();
        while !lifecycle.exited {
            self.shared.exited_cond.wait(&mut lifecycle);
        }
        Ok(())
    }

    /// Register `func` to run on the I/O thread when shutdown begins. Runs
    /// immediately if shutdown already began.
    pub fn on_shutdown<F: FnOnce() + Send + 'static>(&self, func: F) {
        let fired = self.shared.lifecycle.lock().shutdown_fired;
        if fired {
            func();
        } else {
            self.shared.shutdown_listeners.lock().push(Box::new(func));
        }
    }

    /// Register `func` to run once the I/O thread is about to exit. Runs
    /// immediately if it already exited.
    pub fn on_exit<F: FnOnce() + Send + 'static>(&self, func: F) {
        let exited = self.shared.lifecycle.lock().exited;
        if exited {
            func();
        } else {
            self.shared.exit_listeners.lock().push(Box::new(func));
        }
    }

    fn fire_shutdown(&self) {
        self.shared.lifecycle.lock().shutdown_fired = true;
        let listeners = std::mem::take(&mut *self.shared.shutdown_listeners.lock());
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(listener)).is_err() {
                error!("broker shutdown listener panicked");
            }
        }
    }

    fn finish_exit(&self) {
        self.shared.alive.store(false, Ordering::Release);
        drop(self.shared.waker.close());
        {
            let mut lifecycle = self.shared.lifecycle.lock();
            lifecycle.shutdown_fired = true;
            lifecycle.exited = true;
        }
        self.shared.exited_cond.notify_all();
        let listeners = std::mem::take(&mut *self.shared.exit_listeners.lock());
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(listener)).is_err() {
                error!("broker exit listener panicked");
            }
        }
    }

    fn shutdown_timeout(&self) -> Duration {
        self.shared.shutdown_timeout
    }
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Broker(alive={})", self.is_alive())
    }
}

/// State owned by the I/O thread.
pub struct Io {
    broker: Broker,
    pub(crate) poller: Box<dyn Poller>,
    waker_rsock: UnixStream,
    pub(crate) endpoints: HashMap<Token, Endpoint>,
    next_token: Token,
    pub(crate) router: RouterCore,
}

impl Io {
    fn new(broker: Broker, seed: BrokerSeed, router: RouterCore) -> Result<Self> {
        let mut poller = seed.poller;
        poller.start_receive(seed.rsock.as_raw_fd(), WAKER_TOKEN)?;
        Ok(Self {
            broker,
            poller,
            waker_rsock: seed.rsock,
            endpoints: HashMap::new(),
            next_token: WAKER_TOKEN + 1,
            router,
        })
    }

    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    /// Number of streams and stdio captures currently registered.
    pub fn endpoint_count(&self) -> usize {
        self.endpoints.len()
    }

    pub(crate) fn alloc_token(&mut self) -> Token {
        let token = self.next_token;
        self.next_token += 1;
        token
    }

    pub(crate) fn stream(&self, token: Token) -> Option<&Stream> {
        match self.endpoints.get(&token) {
            Some(Endpoint::Stream(s)) => Some(s),
            _ => None,
        }
    }

    pub(crate) fn stream_mut(&mut self, token: Token) -> Option<&mut Stream> {
        match self.endpoints.get_mut(&token) {
            Some(Endpoint::Stream(s)) => Some(s),
            _ => None,
        }
    }

    pub(crate) fn streams(&self) -> impl Iterator<Item = &Stream> {
        self.endpoints.values().filter_map(|e| match e {
            Endpoint::Stream(s) => Some(s),
            Endpoint::Logger(_) => None,
        })
    }

    pub(crate) fn insert_stream(&mut self, stream: Stream) {
        self.endpoints.insert(stream.token, Endpoint::Stream(stream));
    }

    /// Capture `kind` into tracing for the rest of the broker's life.
    pub(crate) fn add_logger(&mut self, kind: StdioKind) -> Result<()> {
        let token = self.alloc_token();
        let logger = IoLogger::install(token, kind)?;
        let fd = logger.side.fd();
        self.endpoints.insert(token, Endpoint::Logger(logger));
        if let Some(fd) = fd {
            self.poller.start_receive(fd, token)?;
        }
        Ok(())
    }

    pub(crate) fn start_receive(&mut self, token: Token) -> Result<()> {
        let fd = match self.endpoints.get(&token) {
            Some(Endpoint::Stream(s)) => s.receive_side.fd(),
            Some(Endpoint::Logger(l)) => l.side.fd(),
            None => None,
        };
        match fd {
            Some(fd) => Ok(self.poller.start_receive(fd, token)?),
            None => Err(TetherError::Stream(format!("no open stream for token {}", token))),
        }
    }

    /// Queue `msg` on a stream, arming transmit interest if the buffer was
    /// empty.
    pub(crate) fn send_on(&mut self, token: Token, msg: &Message) {
        let Some(stream) = self.stream_mut(token) else {
            debug!("dropping {:?}: stream {} is gone", msg, token);
            return;
        };
        if !stream.enqueue(msg) {
            return;
        }
        let Some(fd) = stream.transmit_side.fd() else {
            return;
        };
        if let Err(e) = self.poller.start_transmit(fd, token) {
            error!("cannot start transmit on {}: {}", token, e);
            self.disconnect(token);
        }
    }

    fn on_readable(&mut self, token: Token) {
        let received = match self.endpoints.get_mut(&token) {
            Some(Endpoint::Stream(stream)) => stream.receive(),
            Some(Endpoint::Logger(logger)) => {
                if !logger.receive() {
                    self.disconnect(token);
                }
                return;
            }
            None => return,
        };
        for msg in received.messages {
            self.async_route(msg, Some(token));
        }
        if received.disconnected {
            self.disconnect(token);
        }
    }

    fn on_writable(&mut self, token: Token) {
        let Some(stream) = self.stream_mut(token) else {
            return;
        };
        let fd = stream.transmit_side.fd();
        match stream.transmit() {
            Transmitted::Pending => {}
            Transmitted::Drained => {
                if let Some(fd) = fd {
                    self.poller.stop_transmit(fd);
                }
            }
            Transmitted::Disconnected => self.disconnect(token),
        }
    }

    /// Unregister and close an endpoint, then run the router's disconnect
    /// handling for it.
    pub(crate) fn disconnect(&mut self, token: Token) {
        let Some(endpoint) = self.endpoints.remove(&token) else {
            return;
        };
        match endpoint {
            Endpoint::Stream(mut stream) => {
                debug!("{:?}: disconnected", stream);
                if let Some(fd) = stream.receive_side.fd() {
                    self.poller.stop_receive(fd);
                }
                if let Some(fd) = stream.transmit_side.fd() {
                    self.poller.stop_transmit(fd);
                }
                stream.close();
                if stream.role == StreamRole::Downstream {
                    reap_child(&mut stream);
                }
                self.on_stream_disconnect(&stream);
            }
            Endpoint::Logger(mut logger) => {
                if let Some(fd) = logger.side.fd() {
                    self.poller.stop_receive(fd);
                }
                logger.close();
            }
        }
    }

    /// Registered receivers still holding the broker open, plus queued
    /// deferred calls.
    fn keep_alive(&self) -> usize {
        let readers = self
            .endpoints
            .values()
            .filter(|e| match e {
                Endpoint::Stream(s) => s.receive_side.keep_alive && !s.receive_side.closed(),
                Endpoint::Logger(l) => !l.side.closed(),
            })
            .count();
        readers + self.broker.shared.waker.pending()
    }

    fn run_deferred(&mut self) {
        loop {
            let batch = self.broker.shared.waker.take();
            if batch.is_empty() {
                return;
            }
            for func in batch {
                if catch_unwind(AssertUnwindSafe(|| func(self))).is_err() {
                    error!("deferred function crashed; shutting down broker");
                    self.broker.shutdown();
                }
            }
        }
    }

    fn loop_once(&mut self, timeout: Option<Duration>) {
        trace!(target: "tether::io", "loop_once({:?})", timeout);
        let events = match self.poller.poll(timeout) {
            Ok(events) => events,
            Err(e) => {
                error!("poll failed: {}", e);
                thread::sleep(Duration::from_millis(10));
                return;
            }
        };
        for (fd, readiness) in events {
            let Some(token) = self.poller.resolve(fd, readiness) else {
                continue;
            };
            if token == WAKER_TOKEN {
                waker::drain(&self.waker_rsock);
            } else {
                let outcome = catch_unwind(AssertUnwindSafe(|| match readiness {
                    Readiness::Read => self.on_readable(token),
                    Readiness::Write => self.on_writable(token),
                }));
                if outcome.is_err() {
                    error!("callback for endpoint {} crashed", token);
                    self.disconnect(token);
                }
            }
            self.run_deferred();
        }
        self.run_deferred();
    }

    fn on_shutdown(&mut self, token: Token) {
        let own_id = self.router.context_id();
        match self.endpoints.get_mut(&token) {
            Some(Endpoint::Stream(stream)) => {
                if stream.role != StreamRole::Downstream {
                    return;
                }
                debug!("{:?}: asking child to shut down", stream);
                let mut msg = Message::new(SHUTDOWN, Vec::new()).with_dst(stream.remote_id);
                msg.src_id = own_id;
                msg.auth_id = own_id;
                self.send_on(token, &msg);
            }
            Some(Endpoint::Logger(logger)) => logger.on_shutdown(),
            None => {}
        }
    }

    fn run(mut self) {
        while self.broker.is_alive() {
            self.loop_once(None);
        }

        self.broker.fire_shutdown();
        self.run_deferred();
        let mut tokens: Vec<Token> = self.endpoints.keys().copied().collect();
        tokens.sort_unstable();
        for token in tokens {
            self.on_shutdown(token);
        }

        let deadline = Instant::now() + self.broker.shutdown_timeout();
        while self.keep_alive() > 0 {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            self.loop_once(Some(deadline - now));
        }

        if self.keep_alive() > 0 {
            error!(
                "some streams did not close gracefully. The most likely cause is one or \
                 more child processes still connected to our stdout/stderr pipes."
            );
        }

        let mut tokens: Vec<Token> = self.endpoints.keys().copied().collect();
        tokens.sort_unstable();
        for token in tokens {
            match self.endpoints.get(&token) {
                Some(Endpoint::Stream(s)) if s.receive_side.keep_alive => {
                    error!("force disconnecting {:?}", s)
                }
                _ => debug!("force disconnecting endpoint {}", token),
            }
            self.disconnect(token);
        }

        self.on_broker_exit();
        self.run_deferred();
        self.poller.close();
        self.broker.finish_exit();
    }
}

/// Collect a downstream stream's child process, or ask it to terminate.
fn reap_child(stream: &mut Stream) {
    let Some(child) = stream.child.as_mut() else {
        return;
    };
    if stream.detached {
        debug!("{:?}: not reaping detached child {}", stream.name, child.pid);
        return;
    }
    if child.reaped {
        return;
    }
    child.reaped = true;
    if let Err(e) = crate::platform::process::reap_child(child.pid, &stream.name) {
        warn!("{}: failed to reap child {}: {}", stream.name, child.pid, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn start_bare() -> Broker {
        let router = crate::router::RouterBuilder::new()
            .shutdown_timeout(Duration::from_millis(200))
            .build()
            .unwrap();
        router.broker().clone()
    }

    #[test]
    fn test_defer_sync_returns_value() {
        let broker = start_bare();
        let count = broker.defer_sync(|io| io.endpoint_count()).unwrap();
        assert_eq!(count, 0);
        broker.shutdown();
        broker.join().unwrap();
    }

    #[test]
    fn test_defer_runs_in_order() {
        let broker = start_bare();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..50 {
            let seen = seen.clone();
            broker.defer(move |_| seen.lock().push(i));
        }
        broker.defer_sync(|_| ()).unwrap();
        assert_eq!(*seen.lock(), (0..50).collect::<Vec<_>>());
        broker.shutdown();
        broker.join().unwrap();
    }

    #[test]
    fn test_defer_from_io_thread_runs_before_next_poll() {
        let broker = start_bare();
        let inner = broker.clone();
        let ran = broker
            .defer_sync(move |_| {
                let flag = Arc::new(AtomicBool::new(false));
                let f = flag.clone();
                inner.defer(move |_| f.store(true, Ordering::SeqCst));
                flag
            })
            .unwrap();
        broker.defer_sync(|_| ()).unwrap();
        assert!(ran.load(Ordering::SeqCst));
        broker.shutdown();
        broker.join().unwrap();
    }

    #[test]
    fn test_defer_sync_on_io_thread_errors() {
        let broker = start_bare();
        let inner = broker.clone();
        let nested = broker.defer_sync(move |_| inner.defer_sync(|_| 1).is_err()).unwrap();
        assert!(nested);
        broker.shutdown();
        broker.join().unwrap();
    }

    #[test]
    fn test_crashed_deferred_shuts_broker_down() {
        let broker = start_bare();
        broker.defer(|_| panic!("deferred crash"));
        broker.join().unwrap();
        assert!(broker.has_exited());
        assert!(broker.defer_sync(|_| ()).is_err());
    }

    #[test]
    fn test_shutdown_and_exit_listeners_fire_once() {
        let broker = start_bare();
        let fired = Arc::new(AtomicUsize::new(0));
        let f1 = fired.clone();
        broker.on_shutdown(move || {
            f1.fetch_add(1, Ordering::SeqCst);
        });
        let f2 = fired.clone();
        broker.on_exit(move || {
            f2.fetch_add(10, Ordering::SeqCst);
        });
        broker.shutdown();
        broker.shutdown();
        broker.join().unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 11);

        // Registering after exit runs immediately.
        let f3 = fired.clone();
        broker.on_exit(move || {
            f3.fetch_add(100, Ordering::SeqCst);
        });
        assert_eq!(fired.load(Ordering::SeqCst), 111);
    }
}
