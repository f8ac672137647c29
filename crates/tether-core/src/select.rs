//! Wait on several receivers, or nested selects, at once.
//!
//! Each member gets a notify hook that pushes the member's id into the
//! select's own latch whenever the member gains a message. `get` pops an id
//! and takes one message from that member without blocking; an id whose
//! member was drained by another thread in the meantime is skipped.

use crate::error::{Result, TetherError};
use crate::latch::Latch;
use crate::message::Message;
use crate::receiver::{next_member_id, Notify, Receiver};
use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

pub const LOOP_MSG: &str = "Adding this Select instance would create a Select cycle";
pub const OWNED_MSG: &str = "Cannot add: Receiver is already owned by another Select";
pub const NOT_PRESENT_MSG: &str = "Instance is not a member of this Select";
pub const EMPTY_MSG: &str = "Cannot get(), Select instance is empty";

/// Something a [`Select`] can wait on.
#[derive(Clone, PartialEq, Eq)]
pub enum Member {
    Receiver(Receiver),
    Select(Select),
}

impl Member {
    fn id(&self) -> u64 {
        match self {
            Member::Receiver(r) => r.member_id(),
            Member::Select(s) => s.inner.member_id,
        }
    }

    fn is_empty(&self) -> bool {
        match self {
            Member::Receiver(r) => r.is_empty(),
            Member::Select(s) => s.is_empty(),
        }
    }

    fn set_notify(&self, notify: Option<Notify>) -> bool {
        match self {
            Member::Receiver(r) => r.set_notify(notify),
            Member::Select(s) => {
                let mut slot = s.inner.notify.lock();
                if notify.is_some() && slot.is_some() {
                    return false;
                }
                *slot = notify;
                true
            }
        }
    }

    fn has_notify(&self) -> bool {
        match self {
            Member::Receiver(r) => r.has_notify(),
            Member::Select(s) => s.inner.notify.lock().is_some(),
        }
    }

    fn take(&self, throw_dead: bool) -> Result<Message> {
        match self {
            Member::Receiver(r) => r.get_with(None, false, throw_dead),
            Member::Select(s) => s.get_with(None, false, throw_dead).map(|e| e.message),
        }
    }
}

impl From<Receiver> for Member {
    fn from(receiver: Receiver) -> Self {
        Member::Receiver(receiver)
    }
}

impl From<Select> for Member {
    fn from(select: Select) -> Self {
        Member::Select(select)
    }
}

impl fmt::Debug for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Member::Receiver(r) => fmt::Debug::fmt(r, f),
            Member::Select(s) => fmt::Debug::fmt(s, f),
        }
    }
}

/// A message together with the member it came from.
#[derive(Debug)]
pub struct Event {
    pub source: Member,
    pub message: Message,
}

struct SelectInner {
    member_id: u64,
    oneshot: bool,
    latch: Latch<u64>,
    members: Mutex<Vec<Member>>,
    notify: Mutex<Option<Notify>>,
}

impl SelectInner {
    fn put(&self, member_id: u64) {
        if self.latch.put(member_id).is_ok() {
            let notify = self.notify.lock().clone();
            if let Some(notify) = notify {
                notify();
            }
        }
    }
}

#[derive(Clone)]
pub struct Select {
    inner: Arc<SelectInner>,
}

impl Select {
    /// An empty select. With `oneshot`, a member is removed after it yields
    /// its first message.
    pub fn new(oneshot: bool) -> Self {
        Self {
            inner: Arc::new(SelectInner {
                member_id: next_member_id(),
                oneshot,
                latch: Latch::new(),
                members: Mutex::new(Vec::new()),
                notify: Mutex::new(None),
            }),
        }
    }

    pub fn with_members<I, M>(members: I, oneshot: bool) -> Result<Self>
    where
        I: IntoIterator<Item = M>,
        M: Into<Member>,
    {
        let select = Self::new(oneshot);
        for member in members {
            select.add(member)?;
        }
        Ok(select)
    }

    /// Decode one message from each receiver, in arrival order.
    pub fn all(receivers: Vec<Receiver>) -> Result<Vec<crate::value::Value>> {
        let select = Self::with_members(receivers, true)?;
        let mut out = Vec::new();
        while !select.is_idle() {
            out.push(select.get(None)?.message.unpickle(true)?);
        }
        Ok(out)
    }

    /// True when no member is registered.
    pub fn is_idle(&self) -> bool {
        self.inner.members.lock().is_empty()
    }

    /// True when no member has signalled a pending message.
    pub fn is_empty(&self) -> bool {
        self.inner.latch.is_empty()
    }

    fn contains(&self, member: &Member) -> bool {
        self.inner.members.lock().iter().any(|m| {
            m == member
                || match m {
                    Member::Select(nested) => nested.contains(member),
                    Member::Receiver(_) => false,
                }
        })
    }

    pub fn add(&self, member: impl Into<Member>) -> Result<()> {
        let member = member.into();
        if let Member::Select(nested) = &member {
            let me = Member::Select(self.clone());
            if *nested == *self || nested.contains(&me) {
                return Err(TetherError::Select(LOOP_MSG.into()));
            }
        }
        if member.has_notify() {
            return Err(TetherError::Select(OWNED_MSG.into()));
        }

        let weak: Weak<SelectInner> = Arc::downgrade(&self.inner);
        let member_id = member.id();
        let notify: Notify = Arc::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.put(member_id);
            }
        });
        self.inner.members.lock().push(member.clone());
        if !member.set_notify(Some(notify)) {
            self.inner.members.lock().retain(|m| m != &member);
            return Err(TetherError::Select(OWNED_MSG.into()));
        }
        // A message may have landed before the hook was installed.
        if !member.is_empty() {
            self.inner.put(member_id);
        }
        Ok(())
    }

    pub fn remove(&self, member: &Member) -> Result<()> {
        let mut members = self.inner.members.lock();
        let Some(pos) = members.iter().position(|m| m == member) else {
            return Err(TetherError::Select(NOT_PRESENT_MSG.into()));
        };
        let member = members.remove(pos);
        member.set_notify(None);
        Ok(())
    }

    /// Detach every member and wake all waiters with a closed error.
    pub fn close(&self) {
        let members = std::mem::take(&mut *self.inner.members.lock());
        for member in members {
            member.set_notify(None);
        }
        self.inner.latch.close();
    }

    /// Next message from any member.
    pub fn get(&self, timeout: Option<Duration>) -> Result<Event> {
        self.get_with(timeout, true, true)
    }

    pub fn get_with(&self, timeout: Option<Duration>, block: bool, throw_dead: bool) -> Result<Event> {
        if self.is_idle() {
            return Err(TetherError::Select(EMPTY_MSG.into()));
        }
        loop {
            let member_id = self.inner.latch.get_with(timeout, block)?;
            let member = self
                .inner
                .members
                .lock()
                .iter()
                .find(|m| m.id() == member_id)
                .cloned();
            let Some(member) = member else {
                continue;
            };
            match member.take(throw_dead) {
                Ok(message) => {
                    if self.inner.oneshot {
                        let _ = self.remove(&member);
                    }
                    return Ok(Event {
                        source: member,
                        message,
                    });
                }
                // Drained by another thread since it was signalled.
                Err(TetherError::Timeout) => continue,
                Err(e) => {
                    if self.inner.oneshot {
                        let _ = self.remove(&member);
                    }
                    return Err(e);
                }
            }
        }
    }
}

impl PartialEq for Select {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Select {}

impl fmt::Debug for Select {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Select({}, members={}, oneshot={})",
            self.inner.member_id,
            self.inner.members.lock().len(),
            self.inner.oneshot
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::receiver::ReceiverOptions;
    use crate::router::{Router, RouterBuilder};
    use crate::value::Value;

    fn master() -> Router {
        RouterBuilder::new()
            .shutdown_timeout(Duration::from_millis(200))
            .build()
            .unwrap()
    }

    fn receiver(router: &Router) -> Receiver {
        Receiver::new(router, ReceiverOptions::default())
    }

    #[test]
    fn test_empty_select_errors() {
        let select = Select::new(true);
        let err = select.get(None).unwrap_err();
        assert!(matches!(err, TetherError::Select(ref m) if m == EMPTY_MSG));
    }

    #[test]
    fn test_get_reports_source() {
        let router = master();
        let (a, b) = (receiver(&router), receiver(&router));
        let select = Select::with_members(vec![a.clone(), b.clone()], false).unwrap();
        b.to_sender().send(&Value::from("from b")).unwrap();
        let event = select.get(Some(Duration::from_secs(5))).unwrap();
        assert_eq!(event.source, Member::Receiver(b.clone()));
        assert_eq!(event.message.unpickle(true).unwrap(), Value::from("from b"));
        router.shutdown();
        router.join().unwrap();
    }

    #[test]
    fn test_message_queued_before_add_is_seen() {
        let router = master();
        let a = receiver(&router);
        a.to_sender().send(&Value::Int(1)).unwrap();
        router.broker().defer_sync(|_| ()).unwrap();
        let select = Select::with_members(vec![a], true).unwrap();
        assert!(!select.is_empty());
        let event = select.get(Some(Duration::from_secs(5))).unwrap();
        assert_eq!(event.message.unpickle(true).unwrap(), Value::Int(1));
        // Oneshot removed the member.
        assert!(select.is_idle());
        router.shutdown();
        router.join().unwrap();
    }

    #[test]
    fn test_receiver_owned_by_one_select() {
        let router = master();
        let a = receiver(&router);
        let first = Select::new(true);
        let second = Select::new(true);
        first.add(a.clone()).unwrap();
        let err = second.add(a.clone()).unwrap_err();
        assert!(matches!(err, TetherError::Select(ref m) if m == OWNED_MSG));
        first.remove(&Member::Receiver(a.clone())).unwrap();
        second.add(a).unwrap();
        router.shutdown();
        router.join().unwrap();
    }

    #[test]
    fn test_cycles_rejected() {
        let outer = Select::new(false);
        let inner = Select::new(false);
        outer.add(inner.clone()).unwrap();
        let err = inner.add(outer.clone()).unwrap_err();
        assert!(matches!(err, TetherError::Select(ref m) if m == LOOP_MSG));
        assert!(outer.add(outer.clone()).is_err());
    }

    #[test]
    fn test_nested_select_delivers() {
        let router = master();
        let a = receiver(&router);
        let inner = Select::with_members(vec![a.clone()], false).unwrap();
        let outer = Select::with_members(vec![inner.clone()], false).unwrap();
        a.to_sender().send(&Value::Int(7)).unwrap();
        let event = outer.get(Some(Duration::from_secs(5))).unwrap();
        assert_eq!(event.source, Member::Select(inner));
        assert_eq!(event.message.unpickle(true).unwrap(), Value::Int(7));
        router.shutdown();
        router.join().unwrap();
    }

    #[test]
    fn test_remove_unknown_member() {
        let router = master();
        let select = Select::new(false);
        let err = select.remove(&Member::Receiver(receiver(&router))).unwrap_err();
        assert!(matches!(err, TetherError::Select(ref m) if m == NOT_PRESENT_MSG));
        router.shutdown();
        router.join().unwrap();
    }

    #[test]
    fn test_all_collects_every_reply() {
        let router = master();
        let receivers: Vec<Receiver> = (0..3).map(|_| receiver(&router)).collect();
        for (i, r) in receivers.iter().enumerate() {
            r.to_sender().send(&Value::Int(i as i64)).unwrap();
        }
        let mut got = Select::all(receivers).unwrap();
        got.sort_by_key(|v| v.as_i64());
        assert_eq!(got, vec![Value::Int(0), Value::Int(1), Value::Int(2)]);
        router.shutdown();
        router.join().unwrap();
    }

    #[test]
    fn test_close_wakes_getter() {
        let router = master();
        let select = Select::with_members(vec![receiver(&router)], false).unwrap();
        let waiter = {
            let select = select.clone();
            std::thread::spawn(move || select.get(None))
        };
        std::thread::sleep(Duration::from_millis(50));
        select.close();
        assert!(waiter.join().unwrap().is_err());
        router.shutdown();
        router.join().unwrap();
    }
}
