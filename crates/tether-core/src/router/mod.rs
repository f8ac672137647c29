//! Addressing and dispatch.
//!
//! A [`Router`] is the thread-safe face of one context's routing state. The
//! state itself ([`RouterCore`]: route table, handler table, route-monitor
//! bookkeeping) lives inside the broker's [`Io`] and is only touched on the
//! I/O thread; every method here either reads immutable identity or ships a
//! closure through [`Broker::defer`].

pub(crate) mod route_monitor;
pub(crate) mod routing;

pub(crate) use routing::{HandlerEntry, RouterCore, StreamSpec};

use crate::broker::{Broker, Io, StreamRole};
use crate::config::{BrokerConfig, IdConfig, PollerKind, WireConfig};
use crate::context::Context;
use crate::error::{Result, TetherError};
use crate::id_allocator::IdSource;
use crate::message::Message;
use crate::rpc::FunctionRegistry;
use crate::service::{Pool, ServiceRegistry};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::os::unix::io::OwnedFd;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Callback run on the I/O thread for each message delivered to a handle.
pub type HandlerFn = Arc<dyn Fn(&mut Io, Message) -> Result<()> + Send + Sync>;

/// What a policy may inspect besides the message itself.
#[derive(Debug, Clone)]
pub struct PolicyContext<'a> {
    /// Id of the context the handler lives in.
    pub context_id: u32,
    /// Ancestors of that context, nearest first.
    pub parent_ids: &'a [u32],
    /// Remote id of the stream the message arrived on, if it arrived on one.
    pub stream_remote_id: Option<u32>,
}

/// Origin check applied before a handler runs.
#[derive(Clone, Default)]
pub enum Policy {
    #[default]
    Any,
    /// Only this context or one of its ancestors may send.
    ParentAuthority,
    /// Only the directly connected peer may send.
    ImmediateChild,
    Custom(Arc<dyn Fn(&Message, &PolicyContext<'_>) -> bool + Send + Sync>),
}

impl Policy {
    pub fn custom<F>(func: F) -> Self
    where
        F: Fn(&Message, &PolicyContext<'_>) -> bool + Send + Sync + 'static,
    {
        Policy::Custom(Arc::new(func))
    }

    pub fn allows(&self, msg: &Message, ctx: &PolicyContext<'_>) -> bool {
        match self {
            Policy::Any => true,
            Policy::ParentAuthority => {
                has_parent_authority(msg.auth_id, ctx.context_id, ctx.parent_ids)
            }
            Policy::ImmediateChild => ctx.stream_remote_id == Some(msg.src_id),
            Policy::Custom(func) => func(msg, ctx),
        }
    }
}

impl fmt::Debug for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Policy::Any => f.write_str("Any"),
            Policy::ParentAuthority => f.write_str("ParentAuthority"),
            Policy::ImmediateChild => f.write_str("ImmediateChild"),
            Policy::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// True when `auth_id` is this context or one of its ancestors.
pub fn has_parent_authority(auth_id: u32, context_id: u32, parent_ids: &[u32]) -> bool {
    auth_id == context_id || parent_ids.contains(&auth_id)
}

/// Registration options for [`Router::add_handler`].
#[derive(Debug, Clone)]
pub struct HandlerOptions {
    /// Fixed handle; allocated from the application range when `None`.
    pub handle: Option<u32>,
    /// Keep the handler after its first message.
    pub persist: bool,
    pub policy: Policy,
    /// Only accept messages from this context, and receive a dead message
    /// when it disconnects.
    pub respondent: Option<u32>,
    /// Replace an existing registration instead of refusing.
    pub overwrite: bool,
}

impl Default for HandlerOptions {
    fn default() -> Self {
        Self {
            handle: None,
            persist: true,
            policy: Policy::Any,
            respondent: None,
            overwrite: false,
        }
    }
}

impl HandlerOptions {
    pub fn handle(mut self, handle: u32) -> Self {
        self.handle = Some(handle);
        self
    }

    pub fn persist(mut self, persist: bool) -> Self {
        self.persist = persist;
        self
    }

    pub fn policy(mut self, policy: Policy) -> Self {
        self.policy = policy;
        self
    }

    pub fn respondent(mut self, context_id: u32) -> Self {
        self.respondent = Some(context_id);
        self
    }

    pub fn overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }
}

/// Options for [`Router::attach`].
#[derive(Debug)]
pub struct AttachOptions {
    /// Connected socket; duplicated internally for the transmit side.
    pub fd: OwnedFd,
    pub remote_id: u32,
    pub name: String,
    pub role: StreamRole,
    /// Pin every inbound message's `auth_id` to this value.
    pub auth_id: Option<u32>,
    pub is_privileged: bool,
    /// Announce the new route to our parent.
    pub notice: bool,
    /// Whether this stream alone keeps the broker alive during shutdown.
    pub keep_alive: bool,
}

impl AttachOptions {
    pub fn new(fd: OwnedFd, remote_id: u32, name: impl Into<String>) -> Self {
        Self {
            fd,
            remote_id,
            name: name.into(),
            role: StreamRole::Peer,
            auth_id: None,
            is_privileged: false,
            notice: true,
            keep_alive: true,
        }
    }

    pub fn role(mut self, role: StreamRole) -> Self {
        self.role = role;
        self
    }

    pub fn auth_id(mut self, auth_id: u32) -> Self {
        self.auth_id = Some(auth_id);
        self
    }

    pub fn privileged(mut self, privileged: bool) -> Self {
        self.is_privileged = privileged;
        self
    }

    pub fn notice(mut self, notice: bool) -> Self {
        self.notice = notice;
        self
    }

    pub fn keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }
}

pub(crate) struct RouterShared {
    broker: Broker,
    context_id: u32,
    parent_ids: Vec<u32>,
    name: Option<String>,
    max_message_size: usize,
    unidirectional: bool,
    debug: bool,
    log_level: Option<String>,
    next_handle: AtomicU32,
    contexts: Mutex<HashMap<u32, Context>>,
    ids: IdSource,
    registry: FunctionRegistry,
    services: ServiceRegistry,
    pool: Mutex<Option<Pool>>,
}

/// Thread-safe handle to one context's router. Cheap to clone.
#[derive(Clone)]
pub struct Router {
    shared: Arc<RouterShared>,
}

impl Router {
    pub fn builder() -> RouterBuilder {
        RouterBuilder::new()
    }

    pub fn broker(&self) -> &Broker {
        &self.shared.broker
    }

    /// Id of the context this router speaks for.
    pub fn context_id(&self) -> u32 {
        self.shared.context_id
    }

    /// Ancestors of this context, nearest first.
    pub fn parent_ids(&self) -> &[u32] {
        &self.shared.parent_ids
    }

    pub fn parent_id(&self) -> Option<u32> {
        self.shared.parent_ids.first().copied()
    }

    /// The master has no parent.
    pub fn is_master(&self) -> bool {
        self.shared.parent_ids.is_empty()
    }

    pub fn name(&self) -> Option<&str> {
        self.shared.name.as_deref()
    }

    pub fn max_message_size(&self) -> usize {
        self.shared.max_message_size
    }

    pub fn unidirectional(&self) -> bool {
        self.shared.unidirectional
    }

    pub fn debug(&self) -> bool {
        self.shared.debug
    }

    pub(crate) fn log_level(&self) -> Option<&str> {
        self.shared.log_level.as_deref()
    }

    /// Functions callable through `CALL_FUNCTION` on this context.
    pub fn registry(&self) -> &FunctionRegistry {
        &self.shared.registry
    }

    /// Service factories available to this context's pool.
    pub fn services(&self) -> &ServiceRegistry {
        &self.shared.services
    }

    pub(crate) fn pool_slot(&self) -> &Mutex<Option<Pool>> {
        &self.shared.pool
    }

    pub(crate) fn ids(&self) -> &IdSource {
        &self.shared.ids
    }

    /// Handle to this context itself.
    pub fn myself(&self) -> Context {
        self.context_by_id(self.context_id())
    }

    /// Memoized handle for `context_id`.
    pub fn context_by_id(&self, context_id: u32) -> Context {
        self.context_named(context_id, None)
    }

    /// Memoized handle for `context_id`, filling in `name` if the cached
    /// handle has none.
    pub(crate) fn context_named(&self, context_id: u32, name: Option<&str>) -> Context {
        let mut contexts = self.shared.contexts.lock();
        let context = contexts
            .entry(context_id)
            .or_insert_with(|| Context::new(self.clone(), context_id, name.map(str::to_string)));
        if let Some(name) = name {
            if context.name().is_none() {
                context.set_name(name);
            }
        }
        context.clone()
    }

    pub(crate) fn existing_context(&self, context_id: u32) -> Option<Context> {
        self.shared.contexts.lock().get(&context_id).cloned()
    }

    pub(crate) fn known_context_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.shared.contexts.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Empty the context table, breaking the cycle between each context and
    /// this router.
    pub(crate) fn take_contexts(&self) -> Vec<Context> {
        let contexts = std::mem::take(&mut *self.shared.contexts.lock());
        debug!("router {} dropping {} contexts", self.context_id(), contexts.len());
        let mut contexts: Vec<(u32, Context)> = contexts.into_iter().collect();
        contexts.sort_unstable_by_key(|(id, _)| *id);
        contexts.into_iter().map(|(_, c)| c).collect()
    }

    /// Next free application handle.
    pub fn allocate_handle(&self) -> u32 {
        self.shared.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    /// Allocate a context id, asking the master for a block when needed.
    pub fn allocate_id(&self) -> Result<u32> {
        self.shared.ids.allocate(self)
    }

    /// Register `func` for messages addressed to a handle and return the
    /// handle. Registration happens on the I/O thread.
    pub fn add_handler<F>(&self, func: F, options: HandlerOptions) -> u32
    where
        F: Fn(&mut Io, Message) -> Result<()> + Send + Sync + 'static,
    {
        self.add_handler_queued(Arc::new(func), options).0
    }

    /// As [`Router::add_handler`], also reporting whether the registration
    /// was queued before the broker exited.
    pub(crate) fn add_handler_queued(&self, func: HandlerFn, options: HandlerOptions) -> (u32, bool) {
        let handle = options.handle.unwrap_or_else(|| self.allocate_handle());
        let overwrite = options.overwrite;
        let entry = HandlerEntry {
            func,
            persist: options.persist,
            policy: options.policy,
            respondent: options.respondent,
        };
        let queued = self
            .broker()
            .defer(move |io| io.add_handler(handle, entry, overwrite));
        (handle, queued)
    }

    pub fn del_handler(&self, handle: u32) {
        self.broker().defer(move |io| {
            io.del_handler(handle);
        });
    }

    /// Send `msg` from this context. Safe from any thread.
    pub fn route(&self, mut msg: Message) {
        msg.src_id = self.context_id();
        msg.auth_id = self.context_id();
        self.broker().defer(move |io| io.async_route(msg, None));
    }

    /// Route `target_id` through the stream currently used to reach `via`.
    pub fn add_route(&self, target_id: u32, via: &Context) -> Result<()> {
        let via_id = via.id();
        self.broker().defer_sync(move |io| {
            let token = io
                .stream_for(via_id)
                .ok_or_else(|| TetherError::Routing(format!("no route to {}", via_id)))?;
            io.add_route(target_id, token)
        })?
    }

    pub fn del_route(&self, target_id: u32) -> Result<()> {
        self.broker().defer_sync(move |io| io.del_route(target_id))
    }

    /// Remote id of the stream that messages for `target_id` leave on.
    pub fn route_via(&self, target_id: u32) -> Result<Option<u32>> {
        self.broker().defer_sync(move |io| {
            io.stream_for(target_id)
                .and_then(|token| io.stream(token))
                .map(|s| s.remote_id)
        })
    }

    /// Register an already-connected socket as a stream to `remote_id`.
    pub fn attach(&self, options: AttachOptions) -> Result<Context> {
        let wfd = options
            .fd
            .try_clone()
            .map_err(|e| TetherError::io("cannot duplicate attached socket", e))?;
        let name = options.name.clone();
        let remote_id = options.remote_id;
        self.register_stream(StreamSpec {
            name: options.name,
            remote_id,
            role: options.role,
            rfd: options.fd,
            wfd,
            keep_alive: options.keep_alive,
            auth_id: options.auth_id,
            is_privileged: options.is_privileged,
            pid: None,
            notice: options.notice,
        })?;
        Ok(self.context_named(remote_id, Some(&name)))
    }

    pub(crate) fn register_stream(&self, spec: StreamSpec) -> Result<()> {
        self.broker().defer_sync(move |io| io.register_stream(spec).map(|_| ()))?
    }

    /// Begin broker shutdown.
    pub fn shutdown(&self) {
        self.broker().shutdown();
    }

    pub fn join(&self) -> Result<()> {
        self.broker().join()
    }
}

impl PartialEq for Router {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Eq for Router {}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Router({}, {:?})", self.context_id(), self.broker())
    }
}

/// Builder for configuring and starting a [`Router`] with its broker.
///
/// # Example
///
/// ```rust,ignore
/// use tether_core::RouterBuilder;
///
/// let router = RouterBuilder::new()
///     .max_message_size(1 << 20)
///     .unidirectional(true)
///     .build()?;
/// ```
pub struct RouterBuilder {
    context_id: u32,
    parent_ids: Vec<u32>,
    name: Option<String>,
    max_message_size: usize,
    unidirectional: bool,
    shutdown_timeout: Option<Duration>,
    poller: PollerKind,
    debug: bool,
    log_level: Option<String>,
    registry: Option<FunctionRegistry>,
    services: Option<ServiceRegistry>,
}

impl Default for RouterBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RouterBuilder {
    /// Defaults describe a master: context 0 with no parents.
    pub fn new() -> Self {
        Self {
            context_id: IdConfig::MASTER_ID,
            parent_ids: Vec::new(),
            name: None,
            max_message_size: WireConfig::MAX_MESSAGE_SIZE,
            unidirectional: false,
            shutdown_timeout: None,
            poller: PollerKind::default(),
            debug: false,
            log_level: None,
            registry: None,
            services: None,
        }
    }

    pub fn context_id(mut self, context_id: u32) -> Self {
        self.context_id = context_id;
        self
    }

    /// Ancestors, nearest first. A non-empty list makes this a child router.
    pub fn parent_ids(mut self, parent_ids: Vec<u32>) -> Self {
        self.parent_ids = parent_ids;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Largest payload accepted from or forwarded to any stream.
    ///
    /// Default: 128 MiB
    pub fn max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    /// Refuse to forward between two unprivileged streams.
    ///
    /// Default: `false`
    pub fn unidirectional(mut self, enable: bool) -> Self {
        self.unidirectional = enable;
        self
    }

    /// Grace period for streams to close once shutdown begins.
    ///
    /// Default: 5 s for a master, 3 s for a child
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = Some(timeout);
        self
    }

    pub fn poller(mut self, kind: PollerKind) -> Self {
        self.poller = kind;
        self
    }

    /// Passed on to children so they log verbosely too.
    pub fn debug(mut self, enable: bool) -> Self {
        self.debug = enable;
        self
    }

    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = Some(level.into());
        self
    }

    pub fn registry(mut self, registry: FunctionRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn services(mut self, services: ServiceRegistry) -> Self {
        self.services = Some(services);
        self
    }

    /// Start the broker thread and return the router.
    pub fn build(self) -> Result<Router> {
        let is_master = self.parent_ids.is_empty();
        if !is_master && self.parent_ids.contains(&self.context_id) {
            return Err(TetherError::Config {
                message: format!("context {} listed as its own parent", self.context_id),
            });
        }
        let timeout = self.shutdown_timeout.unwrap_or(if is_master {
            BrokerConfig::MASTER_SHUTDOWN_TIMEOUT
        } else {
            BrokerConfig::SHUTDOWN_TIMEOUT
        });
        let (broker, seed) = Broker::new(self.poller, timeout)?;

        let registry = self.registry.unwrap_or_default();
        crate::parent::register_builtins(&registry);

        let shared = Arc::new(RouterShared {
            broker: broker.clone(),
            context_id: self.context_id,
            parent_ids: self.parent_ids,
            name: self.name,
            max_message_size: self.max_message_size,
            unidirectional: self.unidirectional,
            debug: self.debug,
            log_level: self.log_level,
            next_handle: AtomicU32::new(IdConfig::FIRST_APP_HANDLE),
            contexts: Mutex::new(HashMap::new()),
            ids: if is_master {
                IdSource::master()
            } else {
                IdSource::child()
            },
            registry,
            services: self.services.unwrap_or_default(),
            pool: Mutex::new(None),
        });
        let router = Router { shared };

        let mut core = RouterCore::new(router.clone());
        core.install_builtins();
        broker.start(seed, core)?;
        debug!(
            "router {} started (parents {:?})",
            router.context_id(),
            router.parent_ids()
        );
        Ok(router)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg_from(src_id: u32, auth_id: u32) -> Message {
        let mut msg = Message::new(1000, Vec::new());
        msg.src_id = src_id;
        msg.auth_id = auth_id;
        msg
    }

    #[test]
    fn test_parent_authority() {
        let parents = [1, 0];
        let ctx = PolicyContext {
            context_id: 5,
            parent_ids: &parents,
            stream_remote_id: None,
        };
        assert!(Policy::ParentAuthority.allows(&msg_from(9, 0), &ctx));
        assert!(Policy::ParentAuthority.allows(&msg_from(9, 5), &ctx));
        assert!(!Policy::ParentAuthority.allows(&msg_from(0, 9), &ctx));
    }

    #[test]
    fn test_immediate_child_needs_a_stream() {
        let ctx = PolicyContext {
            context_id: 0,
            parent_ids: &[],
            stream_remote_id: Some(3),
        };
        assert!(Policy::ImmediateChild.allows(&msg_from(3, 3), &ctx));
        assert!(!Policy::ImmediateChild.allows(&msg_from(4, 3), &ctx));
        let local = PolicyContext {
            stream_remote_id: None,
            ..ctx
        };
        assert!(!Policy::ImmediateChild.allows(&msg_from(3, 3), &local));
    }

    #[test]
    fn test_custom_policy() {
        let policy = Policy::custom(|msg, _| msg.src_id % 2 == 0);
        let ctx = PolicyContext {
            context_id: 0,
            parent_ids: &[],
            stream_remote_id: None,
        };
        assert!(policy.allows(&msg_from(2, 2), &ctx));
        assert!(!policy.allows(&msg_from(3, 3), &ctx));
        assert_eq!(format!("{:?}", policy), "Custom(..)");
    }

    #[test]
    fn test_handler_options_default_persist() {
        let opts = HandlerOptions::default();
        assert!(opts.persist);
        assert!(!opts.overwrite);
        let opts = opts.handle(1234).persist(false).respondent(7);
        assert_eq!(opts.handle, Some(1234));
        assert!(!opts.persist);
        assert_eq!(opts.respondent, Some(7));
    }

    #[test]
    fn test_builder_rejects_self_parent() {
        let err = RouterBuilder::new()
            .context_id(3)
            .parent_ids(vec![3])
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, TetherError::Config { .. }));
    }

    #[test]
    fn test_context_memoized() {
        let router = RouterBuilder::new()
            .shutdown_timeout(Duration::from_millis(200))
            .build()
            .unwrap();
        let a = router.context_by_id(9);
        let b = router.context_named(9, Some("nine"));
        assert_eq!(a, b);
        assert_eq!(a.name().as_deref(), Some("nine"));
        assert!(router.is_master());
        assert_eq!(router.allocate_handle(), IdConfig::FIRST_APP_HANDLE);
        router.shutdown();
        router.join().unwrap();
    }
}
