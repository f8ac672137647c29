//! Route and handler tables, owned by the I/O thread.

use super::route_monitor;
use super::{HandlerFn, Policy, PolicyContext, Router};
use crate::broker::side::Side;
use crate::broker::stream::{ChildProcess, Stream};
use crate::broker::{Io, StreamRole, Token};
use crate::error::{CallError, Result, TetherError};
use crate::message::{Message, ALLOCATE_ID, DETACHING, FORWARD_LOG};
use crate::value::Value;
use std::collections::{HashMap, HashSet};
use std::os::unix::io::OwnedFd;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::{debug, error, trace, warn};

/// One registered handle.
#[derive(Clone)]
pub(crate) struct HandlerEntry {
    pub func: HandlerFn,
    pub persist: bool,
    pub policy: Policy,
    pub respondent: Option<u32>,
}

/// Everything needed to turn a connected descriptor pair into a stream.
pub(crate) struct StreamSpec {
    pub name: String,
    pub remote_id: u32,
    pub role: StreamRole,
    pub rfd: OwnedFd,
    pub wfd: OwnedFd,
    pub keep_alive: bool,
    pub auth_id: Option<u32>,
    pub is_privileged: bool,
    pub pid: Option<u32>,
    pub notice: bool,
}

pub(crate) struct RouterCore {
    pub(crate) router: Router,
    pub(crate) routes: HashMap<u32, Token>,
    pub(crate) handlers: HashMap<u32, HandlerEntry>,
    /// Context id -> handles that must see a dead message when it goes away.
    pub(crate) respondents: HashMap<u32, HashSet<u32>>,
    /// Ids learned through each directly connected stream.
    pub(crate) routes_by_stream: HashMap<Token, HashSet<u32>>,
}

impl RouterCore {
    pub(crate) fn new(router: Router) -> Self {
        Self {
            router,
            routes: HashMap::new(),
            handlers: HashMap::new(),
            respondents: HashMap::new(),
            routes_by_stream: HashMap::new(),
        }
    }

    pub(crate) fn context_id(&self) -> u32 {
        self.router.context_id()
    }

    fn install(&mut self, handle: u32, policy: Policy, func: HandlerFn) {
        self.handlers.insert(
            handle,
            HandlerEntry {
                func,
                persist: true,
                policy,
                respondent: None,
            },
        );
    }

    /// Handlers every router carries, plus the master-only ones.
    pub(crate) fn install_builtins(&mut self) {
        for (handle, func) in route_monitor::handlers() {
            self.install(handle, Policy::ImmediateChild, func);
        }
        self.install(DETACHING, Policy::Any, std::sync::Arc::new(on_detaching));
        if self.router.is_master() {
            self.install(
                ALLOCATE_ID,
                Policy::Any,
                std::sync::Arc::new(crate::id_allocator::on_allocate_id),
            );
            self.install(
                FORWARD_LOG,
                Policy::Any,
                std::sync::Arc::new(crate::logging::on_forward_log),
            );
        }
    }
}

/// Mark the sending child's stream detached so its disconnect does not reap
/// or signal it.
fn on_detaching(io: &mut Io, msg: Message) -> Result<()> {
    if msg.is_dead() {
        return Ok(());
    }
    let token = io.stream_for(msg.src_id);
    let Some(stream) = token.and_then(|t| io.stream_mut(t)) else {
        warn!("DETACHING from {} with no stream", msg.src_id);
        return Ok(());
    };
    if stream.remote_id != msg.src_id || stream.detached {
        warn!("bad DETACHING received on {:?}: {:?}", stream, msg);
        return Ok(());
    }
    debug!("{:?}: marking as detached", stream);
    stream.detached = true;
    io.reply(&msg, &Value::None);
    Ok(())
}

impl Io {
    /// Id of the context this I/O thread routes for.
    pub fn context_id(&self) -> u32 {
        self.router.context_id()
    }

    /// The router that owns this I/O thread.
    pub fn router(&self) -> &Router {
        &self.router.router
    }

    pub(crate) fn parent_token(&self) -> Option<Token> {
        let parent_id = self.router.router.parent_id()?;
        self.router.routes.get(&parent_id).copied()
    }

    /// Stream used to reach `context_id`: its own route, else the parent's.
    pub(crate) fn stream_for(&self, context_id: u32) -> Option<Token> {
        self.router
            .routes
            .get(&context_id)
            .copied()
            .or_else(|| self.parent_token())
    }

    /// Point `target_id` at `token`. A live route through a different stream
    /// is never replaced.
    pub(crate) fn add_route(&mut self, target_id: u32, token: Token) -> Result<()> {
        if let Some(&current) = self.router.routes.get(&target_id) {
            if current != token && self.stream(current).is_some() {
                let current_name = self.stream(current).map(|s| s.name.clone());
                let new_name = self.stream(token).map(|s| s.name.clone());
                error!(
                    "cannot add duplicate route to {} via {:?}: already routed via {:?}",
                    target_id, new_name, current_name
                );
                return Err(TetherError::Routing(format!(
                    "duplicate route to context {}",
                    target_id
                )));
            }
        }
        debug!("adding route to {} via stream {}", target_id, token);
        self.router.routes.insert(target_id, token);
        Ok(())
    }

    pub(crate) fn del_route(&mut self, target_id: u32) {
        if self.router.routes.remove(&target_id).is_some() {
            debug!("deleted route to {}", target_id);
        }
    }

    pub(crate) fn add_handler(&mut self, handle: u32, entry: HandlerEntry, overwrite: bool) {
        if !overwrite && self.router.handlers.contains_key(&handle) {
            error!("attempt to overwrite existing handler {}", handle);
            return;
        }
        if let Some(respondent) = entry.respondent {
            let gone = self
                .router
                .router
                .existing_context(respondent)
                .is_some_and(|c| c.is_disconnected());
            if gone {
                debug!("respondent {} already gone; closing handle {}", respondent, handle);
                let dead = self.local_dead(None);
                self.call_handler(handle, entry.func, dead);
                return;
            }
            self.router
                .respondents
                .entry(respondent)
                .or_default()
                .insert(handle);
        }
        trace!(target: "tether::io", "add_handler({})", handle);
        self.router.handlers.insert(handle, entry);
    }

    pub(crate) fn del_handler(&mut self, handle: u32) -> bool {
        let Some(entry) = self.router.handlers.remove(&handle) else {
            return false;
        };
        if let Some(respondent) = entry.respondent {
            if let Some(set) = self.router.respondents.get_mut(&respondent) {
                set.remove(&handle);
                if set.is_empty() {
                    self.router.respondents.remove(&respondent);
                }
            }
        }
        true
    }

    /// A dead message that appears to come from this context.
    pub(crate) fn local_dead(&self, reason: Option<&str>) -> Message {
        let mut msg = Message::dead(reason);
        msg.src_id = self.context_id();
        msg.auth_id = self.context_id();
        msg
    }

    /// Send `msg` from this context immediately.
    pub fn route(&mut self, mut msg: Message) {
        msg.src_id = self.context_id();
        msg.auth_id = self.context_id();
        self.async_route(msg, None);
    }

    /// Answer `msg` with `value`, if its sender asked for an answer.
    pub fn reply(&mut self, msg: &Message, value: &Value) {
        if !msg.wants_reply() {
            return;
        }
        match msg.reply(value) {
            Ok(reply) => self.route(reply),
            Err(e) => {
                error!("cannot encode reply to {:?}: {}", msg, e);
                self.reply_dead(msg, Some("reply could not be encoded"));
            }
        }
    }

    /// Answer `msg` with a dead message, if its sender asked for an answer.
    pub fn reply_dead(&mut self, msg: &Message, reason: Option<&str>) {
        if !msg.wants_reply() {
            return;
        }
        self.route(msg.reply_dead(reason));
    }

    /// Deliver or forward one message.
    pub(crate) fn async_route(&mut self, mut msg: Message, in_token: Option<Token>) {
        trace!(target: "tether::io", "async_route({:?}, {:?})", msg, in_token);
        let max = self.router.router.max_message_size();
        if msg.data.len() > max {
            error!("message too large (max {} bytes): {:?}", max, msg);
            self.reply_dead(&msg, Some(&format!("message too large (max {} bytes)", max)));
            return;
        }

        if let Some(in_token) = in_token {
            let expect = self.stream_for(msg.auth_id);
            if expect != Some(in_token) {
                error!(
                    "bad auth_id: got {} via stream {}, not {:?}: {:?}",
                    msg.auth_id, in_token, expect, msg
                );
                return;
            }
            if msg.src_id != msg.auth_id {
                let expect = self.stream_for(msg.src_id);
                if expect != Some(in_token) {
                    error!(
                        "bad src_id: got {} via stream {}, not {:?}: {:?}",
                        msg.src_id, in_token, expect, msg
                    );
                    return;
                }
            }
            if let Some(stream) = self.stream_mut(in_token) {
                if let Some(auth_id) = stream.auth_id {
                    msg.auth_id = auth_id;
                }
                stream.egress_ids.insert(msg.dst_id);
            }
        }

        if msg.dst_id == self.context_id() {
            self.invoke(msg, in_token);
            return;
        }

        let Some(out_token) = self.stream_for(msg.dst_id) else {
            error!("no route to {}: {:?}", msg.dst_id, msg);
            self.reply_dead(&msg, Some(&format!("no route to context {}", msg.dst_id)));
            return;
        };
        if Some(out_token) == in_token {
            error!("refusing to route {:?} back to the stream it arrived on", msg);
            self.reply_dead(&msg, Some("routing loop"));
            return;
        }

        if self.router.router.unidirectional() {
            if let Some(in_token) = in_token {
                let in_privileged = self.stream(in_token).is_some_and(|s| s.is_privileged);
                let out_privileged = self.stream(out_token).is_some_and(|s| s.is_privileged);
                if !in_privileged && !out_privileged {
                    error!(
                        "policy violation: refusing to forward {:?} between unprivileged streams",
                        msg
                    );
                    self.reply_dead(&msg, Some("unidirectional routing refused"));
                    return;
                }
            }
        }

        self.send_on(out_token, &msg);
    }

    fn invoke(&mut self, msg: Message, in_token: Option<Token>) {
        let Some(entry) = self.router.handlers.get(&msg.handle) else {
            error!("invalid handle: {:?}", msg);
            if msg.wants_reply() {
                self.reply_dead(&msg, Some(&format!("invalid handle {}", msg.handle)));
            }
            return;
        };

        let stream_remote_id = in_token.and_then(|t| self.stream(t)).map(|s| s.remote_id);
        let respondent_ok = match entry.respondent {
            Some(respondent) => msg.is_dead() || msg.src_id == respondent,
            None => true,
        };
        let policy_ok = respondent_ok
            && entry.policy.allows(
                &msg,
                &PolicyContext {
                    context_id: self.context_id(),
                    parent_ids: self.router.router.parent_ids(),
                    stream_remote_id,
                },
            );
        if !policy_ok {
            error!("policy refused message: {:?}", msg);
            if msg.wants_reply() {
                self.reply(&msg, &Value::CallError(CallError::refused()));
            }
            return;
        }

        let func = entry.func.clone();
        if !entry.persist {
            self.del_handler(msg.handle);
        }
        self.call_handler(msg.handle, func, msg);
    }

    /// Run a handler, containing its errors and panics.
    pub(crate) fn call_handler(&mut self, handle: u32, func: HandlerFn, msg: Message) {
        match catch_unwind(AssertUnwindSafe(|| func(self, msg))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("handler {} failed: {}", handle, e),
            Err(_) => error!("handler {} panicked", handle),
        }
    }

    /// Build, route and start polling a stream.
    pub(crate) fn register_stream(&mut self, spec: StreamSpec) -> Result<Token> {
        let token = self.alloc_token();
        let receive_side = Side::new(spec.rfd, spec.keep_alive)?;
        let transmit_side = Side::new(spec.wfd, true)?;
        let mut stream = Stream::new(
            token,
            spec.name.clone(),
            spec.remote_id,
            spec.role,
            receive_side,
            transmit_side,
            self.router.router.max_message_size(),
        );
        stream.auth_id = spec.auth_id;
        stream.is_privileged = spec.is_privileged;
        stream.child = spec.pid.map(|pid| ChildProcess { pid, reaped: false });
        self.insert_stream(stream);

        if let Err(e) = self.add_route(spec.remote_id, token) {
            if let Some(crate::broker::Endpoint::Stream(mut stream)) = self.endpoints.remove(&token) {
                stream.close();
            }
            return Err(e);
        }
        if spec.notice {
            self.notice_stream(token);
        }
        self.router
            .router
            .context_named(spec.remote_id, Some(&spec.name));
        if let Err(e) = self.start_receive(token) {
            self.disconnect(token);
            return Err(e);
        }
        debug!("registered stream {:?} for context {}", spec.name, spec.remote_id);
        Ok(token)
    }

    /// Router half of a stream disconnect: withdraw its routes and tell
    /// every affected context.
    pub(crate) fn on_stream_disconnect(&mut self, stream: &Stream) {
        let token = stream.token;
        let was_parent = self
            .router
            .router
            .parent_id()
            .is_some_and(|id| self.router.routes.get(&id) == Some(&token));

        let mut gone: Vec<u32> = self
            .router
            .routes
            .iter()
            .filter(|(_, t)| **t == token)
            .map(|(id, _)| *id)
            .collect();
        gone.sort_unstable();
        for id in &gone {
            self.del_route(*id);
        }

        for id in self.on_monitored_stream_gone(token) {
            if !gone.contains(&id) {
                gone.push(id);
            }
        }

        if was_parent {
            // Everything without an explicit route was reached through the parent.
            let implicit: Vec<u32> = self
                .router
                .router
                .known_context_ids()
                .into_iter()
                .filter(|id| *id != self.context_id() && !self.router.routes.contains_key(id))
                .collect();
            for id in implicit {
                if !gone.contains(&id) {
                    gone.push(id);
                }
            }
        }

        for id in gone {
            self.fire_context_disconnect(id);
        }
    }

    /// Dead-letter every handler waiting on `context_id` and run the
    /// context's disconnect listeners.
    pub(crate) fn fire_context_disconnect(&mut self, context_id: u32) {
        if let Some(handles) = self.router.respondents.remove(&context_id) {
            let mut handles: Vec<u32> = handles.into_iter().collect();
            handles.sort_unstable();
            for handle in handles {
                if let Some(entry) = self.router.handlers.remove(&handle) {
                    let dead = self.local_dead(None);
                    self.call_handler(handle, entry.func, dead);
                }
            }
        }
        if let Some(context) = self.router.router.existing_context(context_id) {
            debug!("firing disconnect for {:?}", context);
            context.fire_disconnect();
        }
    }

    /// Final pass before the broker exits: every remaining handler sees a
    /// dead message.
    pub(crate) fn on_broker_exit(&mut self) {
        let mut handlers: Vec<(u32, HandlerEntry)> = self.router.handlers.drain().collect();
        handlers.sort_unstable_by_key(|(handle, _)| *handle);
        self.router.respondents.clear();
        for (handle, entry) in handlers {
            let dead = self.local_dead(None);
            self.call_handler(handle, entry.func, dead);
        }
        for context in self.router.router.take_contexts() {
            context.fire_disconnect();
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::broker::StreamRole;
    use crate::context::Context;
    use crate::error::TetherError;
    use crate::message::{read_message, Message, CALL_FUNCTION};
    use crate::router::{AttachOptions, HandlerOptions, Router, RouterBuilder};
    use crate::value::Value;
    use crate::latch::Latch;
    use std::os::unix::io::OwnedFd;
    use std::io::Write;
    use std::os::unix::net::UnixStream;
    use std::time::Duration;

    fn master() -> Router {
        RouterBuilder::new()
            .shutdown_timeout(Duration::from_millis(200))
            .build()
            .unwrap()
    }

    fn attach(router: &Router, remote_id: u32) -> (Context, UnixStream) {
        let (ours, theirs) = UnixStream::pair().unwrap();
        let ctx = router
            .attach(
                AttachOptions::new(OwnedFd::from(ours), remote_id, format!("peer{}", remote_id))
                    .role(StreamRole::Peer)
                    .notice(false),
            )
            .unwrap();
        (ctx, theirs)
    }

    #[test]
    fn test_local_delivery_and_one_shot_handler() {
        let router = master();
        let latch = Latch::new();
        let l = latch.clone();
        let handle = router.add_handler(
            move |_, msg| {
                let _ = l.put(msg.data);
                Ok(())
            },
            HandlerOptions::default().persist(false),
        );
        router.route(Message::new(handle, b"one".to_vec()).with_dst(0));
        router.route(Message::new(handle, b"two".to_vec()).with_dst(0));
        assert_eq!(latch.get(Some(Duration::from_secs(5))).unwrap(), b"one".to_vec());
        assert!(latch.get(Some(Duration::from_millis(100))).unwrap_err().is_timeout());
        router.shutdown();
        router.join().unwrap();
    }

    #[test]
    fn test_duplicate_route_rejected() {
        let router = master();
        let (a, _peer_a) = attach(&router, 10);
        let (b, _peer_b) = attach(&router, 11);
        router.add_route(500, &a).unwrap();
        let err = router.add_route(500, &b).unwrap_err();
        assert!(matches!(err, TetherError::Routing(_)));
        assert_eq!(router.route_via(500).unwrap(), Some(10));
        assert_eq!(b.id(), 11);
        router.shutdown();
        router.join().unwrap();
    }

    #[test]
    fn test_second_attach_with_same_id_fails() {
        let router = master();
        let (_a, _peer_a) = attach(&router, 12);
        let (ours, _theirs) = UnixStream::pair().unwrap();
        let err = router
            .attach(AttachOptions::new(OwnedFd::from(ours), 12, "again").notice(false))
            .unwrap_err();
        assert!(matches!(err, TetherError::Routing(_)));
        router.shutdown();
        router.join().unwrap();
    }

    #[test]
    fn test_peer_close_withdraws_route_and_fires_disconnect() {
        let router = master();
        let (ctx, peer) = attach(&router, 20);
        let fired = Latch::new();
        let f = fired.clone();
        ctx.on_disconnect(move || {
            let _ = f.put(());
        });
        drop(peer);
        fired.get(Some(Duration::from_secs(5))).unwrap();
        assert!(ctx.is_disconnected());
        assert_eq!(router.route_via(20).unwrap(), None);
        router.shutdown();
        router.join().unwrap();
    }

    #[test]
    fn test_unknown_handle_gets_dead_reply() {
        let router = master();
        let latch = Latch::new();
        let l = latch.clone();
        let reply_to = router.add_handler(
            move |_, msg| {
                let _ = l.put(msg);
                Ok(())
            },
            HandlerOptions::default(),
        );
        router.route(Message::new(4242, Vec::new()).with_dst(0).with_reply_to(reply_to));
        let reply = latch.get(Some(Duration::from_secs(5))).unwrap();
        assert!(reply.is_dead());
        assert!(reply.dead_reason().unwrap().contains("invalid handle"));
        router.shutdown();
        router.join().unwrap();
    }

    #[test]
    fn test_no_route_gets_dead_reply() {
        let router = master();
        let latch = Latch::new();
        let l = latch.clone();
        let reply_to = router.add_handler(
            move |_, msg| {
                let _ = l.put(msg);
                Ok(())
            },
            HandlerOptions::default(),
        );
        router.route(Message::pickled(&Value::Int(1)).unwrap().with_handle(1).with_dst(77).with_reply_to(reply_to));
        let reply = latch.get(Some(Duration::from_secs(5))).unwrap();
        assert!(reply.is_dead());
        assert!(reply.dead_reason().unwrap().contains("no route"));
        router.shutdown();
        router.join().unwrap();
    }

    #[test]
    fn test_broker_exit_dead_letters_handlers() {
        let router = master();
        let latch = Latch::new();
        let l = latch.clone();
        router.add_handler(
            move |_, msg| {
                let _ = l.put(msg.is_dead());
                Ok(())
            },
            HandlerOptions::default(),
        );
        router.broker().defer_sync(|_| ()).unwrap();
        router.shutdown();
        router.join().unwrap();
        assert!(latch.get(Some(Duration::from_secs(1))).unwrap());
    }

    #[test]
    fn test_oversized_frame_from_peer_fails_pending_call() {
        let router = RouterBuilder::new()
            .max_message_size(1024)
            .shutdown_timeout(Duration::from_millis(200))
            .build()
            .unwrap();
        let (ctx, mut peer) = attach(&router, 30);
        let receiver = ctx
            .send_async(Message::pickled(&Value::Int(1)).unwrap().with_handle(CALL_FUNCTION), false)
            .unwrap();

        let request = read_message(&mut peer, 1024).unwrap().unwrap();
        assert_eq!(request.reply_to, receiver.handle());
        let mut header = request.reply(&Value::None).unwrap().header();
        header.len = 4096;
        peer.write_all(&header.to_bytes()).unwrap();

        let err = receiver.get(Some(Duration::from_secs(5))).unwrap_err();
        assert!(err.is_disconnect(), "{:?}", err);
        assert!(!err.is_timeout());
        router.shutdown();
        router.join().unwrap();
    }

    #[test]
    fn test_deferred_route_lands_after_direct_route() {
        let router = master();
        let latch = Latch::new();
        let l = latch.clone();
        let sink = router.add_handler(
            move |_, msg| {
                let _ = l.put(msg.data);
                Ok(())
            },
            HandlerOptions::default(),
        );
        let deferred = router.clone();
        let trigger = router.add_handler(
            move |io, _| {
                deferred.route(Message::new(sink, b"deferred".to_vec()).with_dst(0));
                io.route(Message::new(sink, b"direct".to_vec()).with_dst(0));
                Ok(())
            },
            HandlerOptions::default().persist(false),
        );
        router.route(Message::new(trigger, Vec::new()).with_dst(0));
        let timeout = Some(Duration::from_secs(5));
        assert_eq!(latch.get(timeout).unwrap(), b"direct".to_vec());
        assert_eq!(latch.get(timeout).unwrap(), b"deferred".to_vec());
        router.shutdown();
        router.join().unwrap();
    }
}
