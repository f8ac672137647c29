//! Handles to addressable peers.

use crate::error::{Result, TetherError};
use crate::latch::Latch;
use crate::message::{Message, CALL_SERVICE, SHUTDOWN};
use crate::receiver::{Receiver, ReceiverOptions};
use crate::router::Router;
use crate::rpc::{CallChain, Target};
use crate::value::{ContextRef, Kwargs, SenderRef, Value};
use parking_lot::Mutex;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

type DisconnectListener = Box<dyn FnOnce() + Send>;

struct ContextInner {
    router: Router,
    id: u32,
    name: Mutex<Option<String>>,
    via: Mutex<Option<Context>>,
    disconnected: AtomicBool,
    listeners: Mutex<Vec<DisconnectListener>>,
}

/// A logical peer, possibly reached through other contexts.
///
/// Two handles are equal when they name the same id on the same router.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Context {
    pub(crate) fn new(router: Router, id: u32, name: Option<String>) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                router,
                id,
                name: Mutex::new(name),
                via: Mutex::new(None),
                disconnected: AtomicBool::new(false),
                listeners: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Rebuild a handle from its serialized form.
    pub fn from_ref(router: &Router, context: &ContextRef) -> Self {
        router.context_named(context.id, context.name.as_deref())
    }

    pub fn id(&self) -> u32 {
        self.inner.id
    }

    pub fn name(&self) -> Option<String> {
        self.inner.name.lock().clone()
    }

    pub(crate) fn set_name(&self, name: &str) {
        *self.inner.name.lock() = Some(name.to_string());
    }

    pub fn router(&self) -> &Router {
        &self.inner.router
    }

    /// The context a proxied connection was made through.
    pub fn via(&self) -> Option<Context> {
        self.inner.via.lock().clone()
    }

    pub(crate) fn set_via(&self, via: Context) {
        *self.inner.via.lock() = Some(via);
    }

    pub fn to_ref(&self) -> ContextRef {
        ContextRef {
            id: self.id(),
            name: self.name(),
        }
    }

    pub fn is_disconnected(&self) -> bool {
        self.inner.disconnected.load(Ordering::Acquire)
    }

    /// Run `func` once this context is known to be unreachable. Runs
    /// immediately if that already happened.
    pub fn on_disconnect<F: FnOnce() + Send + 'static>(&self, func: F) {
        {
            let mut listeners = self.inner.listeners.lock();
            if !self.is_disconnected() {
                listeners.push(Box::new(func));
                return;
            }
        }
        func();
    }

    pub(crate) fn fire_disconnect(&self) {
        let listeners = {
            let mut listeners = self.inner.listeners.lock();
            self.inner.disconnected.store(true, Ordering::Release);
            std::mem::take(&mut *listeners)
        };
        for listener in listeners {
            if std::panic::catch_unwind(std::panic::AssertUnwindSafe(listener)).is_err() {
                tracing::error!("{:?}: disconnect listener panicked", self);
            }
        }
    }

    /// Address `msg` to this context and route it.
    pub fn send(&self, mut msg: Message) {
        msg.dst_id = self.id();
        self.router().route(msg);
    }

    /// Send `msg` and return a receiver for the replies.
    pub fn send_async(&self, mut msg: Message, persist: bool) -> Result<Receiver> {
        if self.router().broker().on_io_thread() {
            return Err(TetherError::Other(
                "cannot make a blocking call on the I/O thread".into(),
            ));
        }
        let receiver = Receiver::new(
            self.router(),
            ReceiverOptions::default()
                .persist(persist)
                .respondent(self),
        );
        msg.reply_to = receiver.handle();
        self.send(msg);
        Ok(receiver)
    }

    /// Send `msg` and wait for the decoded reply.
    pub fn send_await(&self, msg: Message, timeout: Option<Duration>) -> Result<Value> {
        let receiver = self.send_async(msg, false)?;
        let reply = receiver.get(timeout)?;
        reply.unpickle(true)
    }

    /// The unpipelined chain used by the `call*` shortcuts.
    pub fn default_call_chain(&self) -> CallChain {
        CallChain::new(self, false)
    }

    /// A chain whose calls share failure state.
    pub fn pipelined_call_chain(&self) -> CallChain {
        CallChain::new(self, true)
    }

    pub fn call_async(
        &self,
        target: impl Into<Target>,
        args: Vec<Value>,
        kwargs: Kwargs,
    ) -> Result<Receiver> {
        self.default_call_chain().call_async(target, args, kwargs)
    }

    pub fn call(&self, target: impl Into<Target>, args: Vec<Value>, kwargs: Kwargs) -> Result<Value> {
        self.default_call_chain().call(target, args, kwargs)
    }

    pub fn call_no_reply(
        &self,
        target: impl Into<Target>,
        args: Vec<Value>,
        kwargs: Kwargs,
    ) -> Result<()> {
        self.default_call_chain().call_no_reply(target, args, kwargs)
    }

    /// Invoke `method` of the named service in this context's pool.
    pub fn call_service_async(&self, service: &str, method: &str, kwargs: Kwargs) -> Result<Receiver> {
        let payload = Value::tuple(vec![
            Value::from(service),
            Value::from(method),
            Value::Kwargs(kwargs),
        ]);
        let msg = Message::pickled(&payload)?.with_handle(CALL_SERVICE);
        self.send_async(msg, false)
    }

    pub fn call_service(&self, service: &str, method: &str, kwargs: Kwargs) -> Result<Value> {
        self.call_service_async(service, method, kwargs)?
            .get(None)?
            .unpickle(true)
    }

    /// Ask the context to shut down, optionally waiting until it is gone.
    pub fn shutdown(&self, wait: bool) -> Result<()> {
        self.shutdown_with_timeout(wait.then_some(None))
    }

    /// As [`Context::shutdown`], waiting at most `timeout` when it is
    /// `Some(Some(_))`.
    pub(crate) fn shutdown_with_timeout(&self, wait: Option<Option<Duration>>) -> Result<()> {
        debug!("{:?}.shutdown() sending SHUTDOWN", self);
        let latch = Latch::new();
        let l = latch.clone();
        self.on_disconnect(move || {
            let _ = l.put(());
        });
        self.send(Message::new(SHUTDOWN, Vec::new()));
        match wait {
            Some(timeout) => latch.get(timeout),
            None => Ok(()),
        }
    }
}

impl PartialEq for Context {
    fn eq(&self, other: &Self) -> bool {
        self.router() == other.router() && self.id() == other.id()
    }
}

impl Eq for Context {}

impl Hash for Context {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.router().context_id().hash(state);
        self.id().hash(state);
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "Context({}, {:?})", self.id(), name),
            None => write!(f, "Context({})", self.id()),
        }
    }
}

/// Write end of a channel: sends to one handle on one context.
#[derive(Clone, PartialEq, Eq)]
pub struct Sender {
    context: Context,
    dst_handle: u32,
}

impl Sender {
    pub fn new(context: Context, dst_handle: u32) -> Self {
        Self { context, dst_handle }
    }

    pub fn from_ref(router: &Router, sender: SenderRef) -> Result<Self> {
        if sender.handle == 0 {
            return Err(TetherError::Stream("bad input: sender handle 0".into()));
        }
        Ok(Self::new(router.context_by_id(sender.context_id), sender.handle))
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn dst_handle(&self) -> u32 {
        self.dst_handle
    }

    pub fn to_ref(&self) -> SenderRef {
        SenderRef {
            context_id: self.context.id(),
            handle: self.dst_handle,
        }
    }

    pub fn send(&self, value: &Value) -> Result<()> {
        debug!("{:?}.send()", self);
        let msg = Message::pickled(value)?.with_handle(self.dst_handle);
        self.context.send(msg);
        Ok(())
    }

    /// Tell the remote end no more data follows.
    pub fn close(&self) {
        debug!("{:?}.close()", self);
        self.context
            .send(Message::dead(None).with_handle(self.dst_handle));
    }
}

impl fmt::Debug for Sender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sender({:?}, {})", self.context, self.dst_handle)
    }
}

/// A [`Sender`] to a remote handle paired with a local [`Receiver`].
#[derive(Debug, Clone)]
pub struct Channel {
    sender: Sender,
    receiver: Receiver,
}

impl Channel {
    pub fn new(router: &Router, context: &Context, dst_handle: u32, handle: Option<u32>) -> Self {
        let mut options = ReceiverOptions::default();
        if let Some(handle) = handle {
            options = options.handle(handle);
        }
        Self {
            sender: Sender::new(context.clone(), dst_handle),
            receiver: Receiver::new(router, options),
        }
    }

    pub fn sender(&self) -> &Sender {
        &self.sender
    }

    pub fn receiver(&self) -> &Receiver {
        &self.receiver
    }

    pub fn send(&self, value: &Value) -> Result<()> {
        self.sender.send(value)
    }

    pub fn get(&self, timeout: Option<Duration>) -> Result<Message> {
        self.receiver.get(timeout)
    }

    /// Close both directions.
    pub fn close(&self) {
        self.sender.close();
        self.receiver.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::RouterBuilder;

    fn master() -> Router {
        RouterBuilder::new()
            .shutdown_timeout(Duration::from_millis(200))
            .build()
            .unwrap()
    }

    #[test]
    fn test_listener_after_disconnect_runs_immediately() {
        let router = master();
        let ctx = router.context_by_id(42);
        ctx.fire_disconnect();
        let ran = Arc::new(AtomicBool::new(false));
        let r = ran.clone();
        ctx.on_disconnect(move || r.store(true, Ordering::SeqCst));
        assert!(ran.load(Ordering::SeqCst));
        router.shutdown();
        router.join().unwrap();
    }

    #[test]
    fn test_sender_to_self_round_trip() {
        let router = master();
        let receiver = Receiver::new(&router, ReceiverOptions::default());
        let sender = receiver.to_sender();
        assert_eq!(sender.context().id(), 0);
        sender.send(&Value::from("ping")).unwrap();
        let msg = receiver.get(Some(Duration::from_secs(5))).unwrap();
        assert_eq!(msg.unpickle(true).unwrap(), Value::from("ping"));

        sender.close();
        let err = receiver.get(Some(Duration::from_secs(5))).unwrap_err();
        // Closed from this very context.
        assert!(matches!(err, TetherError::Channel(ref m) if m == crate::error::CHANNEL_LOCAL_MSG));
        router.shutdown();
        router.join().unwrap();
    }

    #[test]
    fn test_send_async_refused_on_io_thread() {
        let router = master();
        let ctx = router.myself();
        let refused = router
            .broker()
            .defer_sync(move |_| ctx.send_async(Message::new(1, Vec::new()), false).is_err())
            .unwrap();
        assert!(refused);
        router.shutdown();
        router.join().unwrap();
    }

    #[test]
    fn test_sender_ref_validation() {
        let router = master();
        assert!(Sender::from_ref(&router, SenderRef { context_id: 3, handle: 0 }).is_err());
        let sender = Sender::from_ref(&router, SenderRef { context_id: 3, handle: 1001 }).unwrap();
        assert_eq!(sender.to_ref(), SenderRef { context_id: 3, handle: 1001 });
        router.shutdown();
        router.join().unwrap();
    }
}
