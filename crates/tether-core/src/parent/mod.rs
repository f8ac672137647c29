//! Starting children and attaching them to the tree.
//!
//! [`Router::connect`] allocates an id, asks a [`Connector`] to start the
//! child, runs the bootstrap handshake and registers the resulting stream.
//! [`Router::proxy_connect`] does the same from another context by calling
//! the `tether.parent.proxy_connect` built-in there.

mod bootstrap;
mod in_process;
mod local;

pub use bootstrap::{decode_preamble, encode_preamble, first_stage, BootCommand};
pub use in_process::InProcessConnector;
pub use local::LocalConnector;

use crate::broker::StreamRole;
use crate::child::ChildConfig;
use crate::config::ConnectConfig;
use crate::context::Context;
use crate::error::{CallError, Result, TetherError};
use crate::platform::terminate_process;
use crate::router::{Router, StreamSpec};
use crate::rpc::{FunctionRegistry, Invocation, Target};
use crate::value::{Kwargs, Value};
use bootstrap::Handshake;
use std::os::unix::io::OwnedFd;
use std::os::unix::net::UnixStream;
use std::time::Duration;
use tracing::{debug, warn};

/// Registry key of the remote half of [`Router::proxy_connect`].
pub const PROXY_CONNECT: &str = "tether.parent.proxy_connect";

/// Grace period between SIGTERM and SIGKILL for a child whose handshake failed.
const FAILED_CHILD_GRACE: Duration = Duration::from_millis(500);

/// A started child: its pid, when it is a separate process, and our end of
/// the socket it talks on.
#[derive(Debug)]
pub struct Spawned {
    pub pid: Option<u32>,
    pub fd: OwnedFd,
}

/// Something that can start a child running the first stage.
pub trait Connector: Send + Sync {
    /// Short method name used in default context names.
    fn kind(&self) -> &str;

    fn start_child(&self, command: &BootCommand) -> Result<Spawned>;
}

/// Options for [`Router::connect`].
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Defaults to `<kind>.<id>`.
    pub name: Option<String>,
    pub connect_timeout: Duration,
    /// Capture the child's stdout/stderr into the log stream.
    pub setup_stdio: bool,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            name: None,
            connect_timeout: ConnectConfig::CONNECT_TIMEOUT,
            setup_stdio: true,
        }
    }
}

impl ConnectOptions {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn setup_stdio(mut self, enable: bool) -> Self {
        self.setup_stdio = enable;
        self
    }
}

impl Router {
    /// Start a child through `connector` and return its context.
    pub fn connect(&self, connector: &dyn Connector, options: ConnectOptions) -> Result<Context> {
        let context_id = self.allocate_id()?;
        let name = options
            .name
            .clone()
            .unwrap_or_else(|| format!("{}.{}", connector.kind(), context_id));

        let mut parent_ids = vec![self.context_id()];
        parent_ids.extend_from_slice(self.parent_ids());
        let mut config = ChildConfig::new(context_id, parent_ids, name.clone());
        config.max_message_size = self.max_message_size();
        config.unidirectional = self.unidirectional();
        config.debug = self.debug();
        config.log_level = self.log_level().map(str::to_string);
        config.setup_stdio = options.setup_stdio;
        let command = BootCommand::new(config)?;

        debug!("{}: starting child {} with {}", name, context_id, connector.kind());
        let spawned = connector.start_child(&command)?;
        let mut sock = UnixStream::from(spawned.fd);
        if let Err(e) = Handshake::new(&mut sock, &name, options.connect_timeout).run(&command) {
            if let Some(pid) = spawned.pid {
                if let Err(kill_err) = terminate_process(pid, FAILED_CHILD_GRACE) {
                    warn!("{}: cannot terminate child {}: {}", name, pid, kill_err);
                }
            }
            return Err(e);
        }

        let rfd = OwnedFd::from(sock);
        let wfd = rfd
            .try_clone()
            .map_err(|e| TetherError::io("cannot duplicate child socket", e))?;
        self.register_stream(StreamSpec {
            name: name.clone(),
            remote_id: context_id,
            role: StreamRole::Downstream,
            rfd,
            wfd,
            keep_alive: true,
            auth_id: None,
            is_privileged: false,
            pid: spawned.pid,
            notice: true,
        })?;
        debug!("{}: connected as context {}", name, context_id);
        Ok(self.context_named(context_id, Some(&name)))
    }

    /// Have `via` start a child of its own with its local connector.
    pub fn proxy_connect(&self, via: &Context, options: ConnectOptions) -> Result<Context> {
        self.proxy_connect_with(via, "local", options)
    }

    /// As [`Router::proxy_connect`], naming the connector `via` should use:
    /// `"local"` or `"in_process"`.
    pub fn proxy_connect_with(&self, via: &Context, connector: &str, options: ConnectOptions) -> Result<Context> {
        let mut kwargs = Kwargs::new()
            .with("connector", connector)
            .with("connect_timeout", options.connect_timeout.as_secs_f64())
            .with("setup_stdio", options.setup_stdio);
        if let Some(name) = &options.name {
            kwargs.insert("name", name.as_str());
        }
        let reply = via.call(proxy_target(), Vec::new(), kwargs)?;
        let (context_id, name) = parse_proxy_reply(&reply)?;

        let via_name = via.name().unwrap_or_else(|| via.id().to_string());
        // The route notice from `via` may already have named it.
        let context = self.context_by_id(context_id);
        context.set_name(&format!("{}.{}", via_name, name));
        context.set_via(via.clone());
        Ok(context)
    }
}

fn proxy_target() -> Target {
    Target::new("tether.parent", "proxy_connect")
}

fn parse_proxy_reply(reply: &Value) -> Result<(u32, String)> {
    let bad = || TetherError::Stream(format!("bad input: malformed proxy_connect reply {:?}", reply));
    match reply.as_list() {
        Some([id, name]) => Ok((
            id.as_u32().ok_or_else(bad)?,
            name.as_str().ok_or_else(bad)?.to_string(),
        )),
        _ => Err(bad()),
    }
}

/// Remote half of [`Router::proxy_connect`].
fn proxy_connect(call: &Invocation) -> std::result::Result<Value, CallError> {
    let router = call.router();
    let mut options = ConnectOptions::default();
    if let Some(name) = call.kwarg("name").and_then(Value::as_str) {
        options = options.name(name);
    }
    if let Some(secs) = call.kwarg("connect_timeout").and_then(Value::as_f64) {
        if secs.is_finite() && secs > 0.0 {
            options = options.connect_timeout(Duration::from_secs_f64(secs));
        }
    }
    if let Some(enable) = call.kwarg("setup_stdio").and_then(Value::as_bool) {
        options = options.setup_stdio(enable);
    }

    let connector = call
        .kwarg("connector")
        .and_then(Value::as_str)
        .unwrap_or("local");
    let context = match connector {
        "local" => {
            let local = LocalConnector::current_exe().map_err(CallError::from)?;
            router.connect(&local, options)
        }
        "in_process" => router.connect(&InProcessConnector::for_router(router), options),
        other => {
            return Err(CallError::new(
                "ValueError",
                format!("unknown connector {:?}", other),
            ))
        }
    }
    .map_err(CallError::from)?;

    let name = context.name().unwrap_or_else(|| context.id().to_string());
    Ok(Value::tuple(vec![Value::from(context.id()), Value::from(name)]))
}

/// Functions every router can serve.
pub(crate) fn register_builtins(registry: &FunctionRegistry) {
    registry.register(PROXY_CONNECT, proxy_connect);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proxy_reply_parsing() {
        let reply = Value::tuple(vec![Value::from(12u32), Value::from("local.12")]);
        assert_eq!(parse_proxy_reply(&reply).unwrap(), (12, "local.12".to_string()));
        assert!(parse_proxy_reply(&Value::from("local.12")).is_err());
    }

    #[test]
    fn test_builtin_is_registered_under_target_key() {
        let registry = FunctionRegistry::new();
        register_builtins(&registry);
        assert_eq!(proxy_target().key(), PROXY_CONNECT);
        assert!(registry.get(&proxy_target()).is_ok());
    }

    #[test]
    fn test_connect_options_defaults() {
        let options = ConnectOptions::default();
        assert_eq!(options.connect_timeout, ConnectConfig::CONNECT_TIMEOUT);
        assert!(options.setup_stdio);
        assert_eq!(options.name("x").name.as_deref(), Some("x"));
    }
}
