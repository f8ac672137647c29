//! Read end of a channel: a handle whose messages land in a [`Latch`].

use crate::context::{Context, Sender};
use crate::error::{Result, TetherError, CHANNEL_LOCAL_MSG, CHANNEL_REMOTE_MSG};
use crate::latch::Latch;
use crate::message::Message;
use crate::router::{HandlerOptions, Policy, Router};
use crate::value::Value;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::trace;

static NEXT_MEMBER_ID: AtomicU64 = AtomicU64::new(1);

/// Identity shared by receivers and selects so a select can tell its
/// members apart.
pub(crate) fn next_member_id() -> u64 {
    NEXT_MEMBER_ID.fetch_add(1, Ordering::Relaxed)
}

/// Hook run after a message is queued, used by [`crate::select::Select`].
pub(crate) type Notify = Arc<dyn Fn() + Send + Sync>;

/// Options for [`Receiver::new`].
#[derive(Debug, Clone)]
pub struct ReceiverOptions {
    pub handle: Option<u32>,
    pub persist: bool,
    pub respondent: Option<u32>,
    pub policy: Policy,
    /// Take over a handle that already has a handler.
    pub overwrite: bool,
}

impl Default for ReceiverOptions {
    fn default() -> Self {
        Self {
            handle: None,
            persist: true,
            respondent: None,
            policy: Policy::Any,
            overwrite: false,
        }
    }
}

impl ReceiverOptions {
    pub fn handle(mut self, handle: u32) -> Self {
        self.handle = Some(handle);
        self
    }

    pub fn persist(mut self, persist: bool) -> Self {
        self.persist = persist;
        self
    }

    /// Accept only messages from `context`, and observe its disconnect.
    pub fn respondent(mut self, context: &Context) -> Self {
        self.respondent = Some(context.id());
        self
    }

    pub fn policy(mut self, policy: Policy) -> Self {
        self.policy = policy;
        self
    }

    pub fn overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }
}

struct ReceiverInner {
    member_id: u64,
    router: Router,
    handle: u32,
    latch: Latch<Message>,
    notify: Mutex<Option<Notify>>,
}

/// Messages delivered to one handle on this context.
#[derive(Clone)]
pub struct Receiver {
    inner: Arc<ReceiverInner>,
}

impl Receiver {
    pub fn new(router: &Router, options: ReceiverOptions) -> Self {
        let latch = Latch::new();
        let inner = Arc::new_cyclic(|weak: &Weak<ReceiverInner>| {
            let weak = weak.clone();
            let queue = latch.clone();
            let func = Arc::new(move |_: &mut crate::broker::Io, msg: Message| -> Result<()> {
                trace!(target: "tether::io", "receiver queueing {:?}", msg);
                if queue.put(msg).is_ok() {
                    if let Some(inner) = weak.upgrade() {
                        let notify = inner.notify.lock().clone();
                        if let Some(notify) = notify {
                            notify();
                        }
                    }
                }
                Ok(())
            });
            let mut handler_options = HandlerOptions::default()
                .persist(options.persist)
                .policy(options.policy)
                .overwrite(options.overwrite);
            handler_options.handle = options.handle;
            handler_options.respondent = options.respondent;
            let (handle, queued) = router.add_handler_queued(func, handler_options);
            if !queued {
                // The broker is gone; nothing will ever arrive.
                latch.close();
            }
            ReceiverInner {
                member_id: next_member_id(),
                router: router.clone(),
                handle,
                latch: latch.clone(),
                notify: Mutex::new(None),
            }
        });
        Self { inner }
    }

    pub fn handle(&self) -> u32 {
        self.inner.handle
    }

    pub fn router(&self) -> &Router {
        &self.inner.router
    }

    pub(crate) fn member_id(&self) -> u64 {
        self.inner.member_id
    }

    /// A sender addressing this receiver from anywhere in the tree.
    pub fn to_sender(&self) -> Sender {
        Sender::new(self.inner.router.myself(), self.inner.handle)
    }

    pub fn is_empty(&self) -> bool {
        self.inner.latch.is_empty()
    }

    /// Install or clear the select hook. Fails when installing over an
    /// existing hook.
    pub(crate) fn set_notify(&self, notify: Option<Notify>) -> bool {
        let mut slot = self.inner.notify.lock();
        if notify.is_some() && slot.is_some() {
            return false;
        }
        *slot = notify;
        true
    }

    pub(crate) fn has_notify(&self) -> bool {
        self.inner.notify.lock().is_some()
    }

    /// Hand `msg` to this receiver as if it had been routed here.
    pub(crate) fn deliver(&self, msg: Message) {
        if self.inner.latch.put(msg).is_ok() {
            let notify = self.inner.notify.lock().clone();
            if let Some(notify) = notify {
                notify();
            }
        }
    }

    /// Next message, blocking up to `timeout`. A dead message becomes a
    /// [`TetherError::Channel`].
    pub fn get(&self, timeout: Option<Duration>) -> Result<Message> {
        self.get_with(timeout, true, true)
    }

    pub fn get_with(&self, timeout: Option<Duration>, block: bool, throw_dead: bool) -> Result<Message> {
        let msg = self
            .inner
            .latch
            .get_with(timeout, block)
            .map_err(|e| match e {
                TetherError::LatchClosed => TetherError::Channel(CHANNEL_LOCAL_MSG.to_string()),
                other => other,
            })?;
        if msg.is_dead() && throw_dead {
            let text = if msg.src_id == self.inner.router.context_id() {
                CHANNEL_LOCAL_MSG
            } else {
                CHANNEL_REMOTE_MSG
            };
            return Err(TetherError::Channel(text.to_string()));
        }
        Ok(msg)
    }

    /// Next message, decoded.
    pub fn get_value(&self, timeout: Option<Duration>) -> Result<Value> {
        self.get(timeout)?.unpickle(true)
    }

    /// Messages until the channel dies or is closed.
    pub fn iter(&self) -> ReceiverIter<'_> {
        ReceiverIter { receiver: self }
    }

    /// Unregister the handle and wake every waiter with a channel error.
    pub fn close(&self) {
        self.inner.router.del_handler(self.inner.handle);
        self.inner.latch.close();
    }
}

impl PartialEq for Receiver {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Receiver {}

impl fmt::Debug for Receiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Receiver({}, {})",
            self.inner.router.context_id(),
            self.inner.handle
        )
    }
}

/// Iterator over a receiver's messages; ends at the first dead message or
/// error.
pub struct ReceiverIter<'a> {
    receiver: &'a Receiver,
}

impl Iterator for ReceiverIter<'_> {
    type Item = Message;

    fn next(&mut self) -> Option<Message> {
        match self.receiver.get_with(None, true, false) {
            Ok(msg) if !msg.is_dead() => Some(msg),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::RouterBuilder;
    use std::thread;

    fn master() -> Router {
        RouterBuilder::new()
            .shutdown_timeout(Duration::from_millis(200))
            .build()
            .unwrap()
    }

    #[test]
    fn test_dead_message_from_remote_is_remote_error() {
        let router = master();
        let receiver = Receiver::new(&router, ReceiverOptions::default());
        let mut dead = Message::dead(None).with_handle(receiver.handle());
        dead.src_id = 9;
        receiver.deliver(dead);
        let err = receiver.get(Some(Duration::from_secs(1))).unwrap_err();
        assert!(matches!(err, TetherError::Channel(ref m) if m == CHANNEL_REMOTE_MSG));
        router.shutdown();
        router.join().unwrap();
    }

    #[test]
    fn test_unanswered_get_times_out() {
        let router = master();
        let receiver = Receiver::new(&router, ReceiverOptions::default());
        let err = receiver.get(Some(Duration::from_millis(50))).unwrap_err();
        assert!(err.is_timeout());
        assert!(!err.is_disconnect());
        router.shutdown();
        router.join().unwrap();
    }

    #[test]
    fn test_close_wakes_waiter() {
        let router = master();
        let receiver = Receiver::new(&router, ReceiverOptions::default());
        let waiter = {
            let receiver = receiver.clone();
            thread::spawn(move || receiver.get(None))
        };
        thread::sleep(Duration::from_millis(50));
        receiver.close();
        let err = waiter.join().unwrap().unwrap_err();
        assert!(err.is_disconnect());
        router.shutdown();
        router.join().unwrap();
    }

    #[test]
    fn test_iter_stops_at_dead() {
        let router = master();
        let receiver = Receiver::new(&router, ReceiverOptions::default());
        let sender = receiver.to_sender();
        for i in 0..3 {
            sender.send(&Value::Int(i)).unwrap();
        }
        sender.close();
        let got: Vec<i64> = receiver
            .iter()
            .map(|m| m.unpickle(true).unwrap().as_i64().unwrap())
            .collect();
        assert_eq!(got, vec![0, 1, 2]);
        router.shutdown();
        router.join().unwrap();
    }

    #[test]
    fn test_receiver_after_exit_fails_fast() {
        let router = master();
        router.shutdown();
        router.join().unwrap();
        let receiver = Receiver::new(&router, ReceiverOptions::default());
        assert!(receiver.get(None).unwrap_err().is_disconnect());
    }

    #[test]
    fn test_broker_exit_closes_pending_receiver() {
        let router = master();
        let receiver = Receiver::new(&router, ReceiverOptions::default());
        router.broker().defer_sync(|_| ()).unwrap();
        router.shutdown();
        router.join().unwrap();
        let err = receiver.get(Some(Duration::from_secs(1))).unwrap_err();
        assert!(matches!(err, TetherError::Channel(ref m) if m == CHANNEL_LOCAL_MSG));
    }
}
