//! Runtime of a context started by a parent.
//!
//! The parent hands over a [`ChildConfig`] during the bootstrap handshake.
//! [`ExternalContext::start`] builds the router from it, attaches the
//! parent stream and installs the child-only handlers: `SHUTDOWN`, the lazy
//! `CALL_SERVICE` stub, and shutdown when the parent disappears.
//! [`ExternalContext::run`] then serves function calls until the broker
//! stops.

use crate::broker::{StdioKind, StreamRole};
use crate::config::{ConnectConfig, IdConfig, WireConfig};
use crate::context::Context;
use crate::error::{Result, TetherError};
use crate::logging::ForwardHandle;
use crate::message::{Message, CALL_SERVICE, DETACHING, SHUTDOWN};
use crate::router::{AttachOptions, HandlerOptions, Policy, Router, RouterBuilder};
use crate::rpc::{Dispatcher, FunctionRegistry};
use crate::service::{Pool, ServiceRegistry};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Read;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{debug, error, info};

/// Settings the parent sends a new child.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildConfig {
    pub context_id: u32,
    /// Ancestors, nearest first. Never empty.
    pub parent_ids: Vec<u32>,
    pub name: String,
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    #[serde(default)]
    pub unidirectional: bool,
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub log_level: Option<String>,
    /// Crate version of the parent; both ends must match.
    pub version: String,
    #[serde(default = "default_in_fd")]
    pub in_fd: RawFd,
    #[serde(default = "default_out_fd")]
    pub out_fd: RawFd,
    /// Redirect stdio into the log stream.
    #[serde(default)]
    pub setup_stdio: bool,
}

fn default_max_message_size() -> usize {
    WireConfig::MAX_MESSAGE_SIZE
}

fn default_in_fd() -> RawFd {
    ConnectConfig::IN_FD
}

fn default_out_fd() -> RawFd {
    ConnectConfig::OUT_FD
}

impl ChildConfig {
    pub fn new(context_id: u32, parent_ids: Vec<u32>, name: impl Into<String>) -> Self {
        Self {
            context_id,
            parent_ids,
            name: name.into(),
            max_message_size: WireConfig::MAX_MESSAGE_SIZE,
            unidirectional: false,
            debug: false,
            log_level: None,
            version: env!("CARGO_PKG_VERSION").to_string(),
            in_fd: ConnectConfig::IN_FD,
            out_fd: ConnectConfig::OUT_FD,
            setup_stdio: false,
        }
    }

    /// Structural checks on a config received from a parent.
    pub fn validate(&self) -> Result<()> {
        let bad = |message: String| Err(TetherError::Config { message });
        if self.parent_ids.is_empty() {
            return bad("child config has no parent ids".into());
        }
        if self.parent_ids.contains(&self.context_id) {
            return bad(format!("context {} listed as its own parent", self.context_id));
        }
        if self.name.len() > IdConfig::MAX_NAME_LEN {
            return bad(format!("context name longer than {} bytes", IdConfig::MAX_NAME_LEN));
        }
        if self.version != env!("CARGO_PKG_VERSION") {
            return bad(format!(
                "version mismatch: parent {}, child {}",
                self.version,
                env!("CARGO_PKG_VERSION")
            ));
        }
        Ok(())
    }

    /// Read the config the first stage left on [`ConnectConfig::CORE_SRC_FD`].
    pub fn read_inherited() -> Result<Self> {
        let fd = take_inherited_fd(ConnectConfig::CORE_SRC_FD)?;
        let mut data = Vec::new();
        File::from(fd)
            .read_to_end(&mut data)
            .map_err(|e| TetherError::io("cannot read second-stage payload", e))?;
        let config: ChildConfig = serde_json::from_slice(&data)?;
        config.validate()?;
        Ok(config)
    }
}

/// Claim an inherited descriptor, failing if it is not open.
#[allow(unsafe_code)]
pub(crate) fn take_inherited_fd(fd: RawFd) -> Result<OwnedFd> {
    nix::fcntl::fcntl(fd, nix::fcntl::FcntlArg::F_GETFD)
        .map_err(|e| TetherError::io(format!("descriptor {} not inherited", fd), e.into()))?;
    // SAFETY: the descriptor is open (checked above) and was handed to this
    // process by the first stage for its exclusive use; nothing else owns it.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// What the embedding program contributes to a child it starts.
#[derive(Default)]
pub struct ChildSetup {
    pub registry: FunctionRegistry,
    pub services: ServiceRegistry,
    /// Log forwarding to release once the master is reachable.
    pub forward: Option<ForwardHandle>,
}

/// A running child context.
pub struct ExternalContext {
    router: Router,
    config: ChildConfig,
    parent: Context,
    master: Context,
    detached: Arc<AtomicBool>,
    dispatcher: Dispatcher,
}

impl ExternalContext {
    /// Build the router and attach `parent_fd` as the parent stream.
    pub fn start(config: ChildConfig, parent_fd: OwnedFd, setup: ChildSetup) -> Result<Self> {
        config.validate()?;
        let mut builder = RouterBuilder::new()
            .registry(setup.registry)
            .services(setup.services)
            .context_id(config.context_id)
            .parent_ids(config.parent_ids.clone())
            .name(config.name.clone())
            .max_message_size(config.max_message_size)
            .unidirectional(config.unidirectional)
            .debug(config.debug);
        if let Some(level) = &config.log_level {
            builder = builder.log_level(level.clone());
        }
        let router = builder.build()?;

        // Handlers go in before the parent stream so nothing it sends can
        // arrive ahead of them.
        let dispatcher = Dispatcher::new(&router);
        install_handlers(&router);

        let parent_id = config.parent_ids[0];
        let parent_name = if parent_id == IdConfig::MASTER_ID {
            "master"
        } else {
            "parent"
        };
        let parent = router.attach(
            AttachOptions::new(parent_fd, parent_id, parent_name)
                .role(StreamRole::Upstream)
                .notice(false),
        )?;
        let master = router.context_named(IdConfig::MASTER_ID, Some("master"));
        if let Some(forward) = setup.forward {
            forward.uncork(master.clone());
        }

        let detached = Arc::new(AtomicBool::new(false));
        let broker = router.broker().clone();
        let watching = detached.clone();
        parent.on_disconnect(move || {
            if watching.load(Ordering::Acquire) {
                info!("Detachment complete");
            } else {
                debug!("parent stream is gone, dying");
                broker.shutdown();
            }
        });

        let ctx = Self {
            router,
            config,
            parent,
            master,
            detached,
            dispatcher,
        };
        if ctx.config.setup_stdio {
            ctx.setup_stdio()?;
        }
        debug!(
            "context {} ({}) started under {:?}",
            ctx.router.context_id(),
            ctx.config.name,
            ctx.parent
        );
        Ok(ctx)
    }

    /// Point stdin at /dev/null and capture stdout/stderr into the log.
    fn setup_stdio(&self) -> Result<()> {
        let devnull = OpenOptions::new()
            .read(true)
            .open("/dev/null")
            .map_err(|e| TetherError::io("cannot open /dev/null", e))?;
        nix::unistd::dup2(devnull.as_raw_fd(), 0)?;
        self.router.broker().defer_sync(|io| -> Result<()> {
            io.add_logger(StdioKind::Stdout)?;
            io.add_logger(StdioKind::Stderr)
        })?
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn config(&self) -> &ChildConfig {
        &self.config
    }

    pub fn parent(&self) -> &Context {
        &self.parent
    }

    pub fn master(&self) -> &Context {
        &self.master
    }

    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Acquire)
    }

    /// Keep running after the parent goes away.
    ///
    /// Tells the parent not to reap us, waits for pending output to drain,
    /// then drops the parent stream.
    pub fn detach(&self) -> Result<()> {
        if self.detached.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let parent_id = self.parent.id();
        let connected = self
            .router
            .broker()
            .defer_sync(move |io| io.stream_for(parent_id).is_some())?;
        if !connected {
            return Ok(());
        }
        if let Err(e) = nix::unistd::setsid() {
            debug!("setsid() failed: {}", e);
        }
        self.parent.send_await(Message::new(DETACHING, Vec::new()), None)?;
        info!("Detaching from {:?}", self.parent);

        let mut pending = 0;
        for _ in 0..ConnectConfig::DETACH_DRAIN_ATTEMPTS {
            pending = self.router.broker().defer_sync(move |io| {
                io.stream_for(parent_id)
                    .and_then(|token| io.stream(token))
                    .map_or(0, |s| s.pending_bytes())
            })?;
            if pending == 0 {
                break;
            }
            thread::sleep(ConnectConfig::DETACH_DRAIN_INTERVAL);
        }
        if pending > 0 {
            error!("Stream had {} bytes after draining", pending);
        }
        self.router.broker().defer(move |io| {
            if let Some(token) = io.stream_for(parent_id) {
                io.disconnect(token);
            }
        });
        Ok(())
    }

    /// Serve function calls on this thread until shutdown, then wait for the
    /// broker to exit.
    pub fn run(self) -> Result<()> {
        self.dispatcher.run();
        self.router.join()?;
        debug!("context {} exiting", self.router.context_id());
        Ok(())
    }

    /// Second-stage entry point: claim the inherited descriptors and run.
    pub fn main(config: ChildConfig, setup: ChildSetup) -> Result<()> {
        let parent_fd = take_inherited_fd(config.in_fd)?;
        Self::start(config, parent_fd, setup)?.run()
    }
}

/// `SHUTDOWN` and the lazy `CALL_SERVICE` stub.
fn install_handlers(router: &Router) {
    router.add_handler(
        |io, msg: Message| {
            debug!("SHUTDOWN received: {:?}", msg);
            if !msg.is_dead() {
                io.broker().shutdown();
            }
            Ok(())
        },
        HandlerOptions::default()
            .handle(SHUTDOWN)
            .policy(Policy::ParentAuthority),
    );

    router.add_handler(
        |io, msg: Message| {
            if msg.is_dead() {
                return Ok(());
            }
            let router = io.router().clone();
            thread::Builder::new()
                .name("tether-service-stub".to_string())
                .spawn(move || match Pool::get_or_create(&router) {
                    Ok(pool) => pool.receiver().deliver(msg),
                    Err(e) => {
                        error!("cannot start service pool: {}", e);
                        router.route(msg.reply_dead(Some("service pool unavailable")));
                    }
                })?;
            Ok(())
        },
        HandlerOptions::default()
            .handle(CALL_SERVICE)
            .policy(Policy::ParentAuthority),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_validation() {
        let config = ChildConfig::new(3, vec![0], "local.3");
        assert!(config.validate().is_ok());

        let orphan = ChildConfig::new(3, vec![], "x");
        assert!(orphan.validate().is_err());

        let mut stale = config.clone();
        stale.version = "0.0.0-old".into();
        assert!(stale.validate().is_err());

        let mut long = config;
        long.name = "n".repeat(IdConfig::MAX_NAME_LEN + 1);
        assert!(long.validate().is_err());
    }

    #[test]
    fn test_config_defaults_fill_in() {
        let json = format!(
            r#"{{"context_id":5,"parent_ids":[0],"name":"c","version":"{}"}}"#,
            env!("CARGO_PKG_VERSION")
        );
        let config: ChildConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config.in_fd, ConnectConfig::IN_FD);
        assert_eq!(config.max_message_size, WireConfig::MAX_MESSAGE_SIZE);
        assert!(!config.setup_stdio);
    }

    #[test]
    fn test_missing_inherited_fd_is_error() {
        assert!(take_inherited_fd(9_999).is_err());
    }
}
