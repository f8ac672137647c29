//! Children that run on a thread of the current process.
//!
//! The child still speaks the bootstrap handshake and owns a separate
//! router and broker, so a whole tree can be exercised in one test binary.

use super::bootstrap::answer;
use super::local::socket_pair;
use super::{BootCommand, Connector, Spawned};
use crate::child::{ChildSetup, ExternalContext};
use crate::error::{Result, TetherError};
use crate::router::Router;
use crate::rpc::FunctionRegistry;
use crate::service::ServiceRegistry;
use std::os::unix::io::OwnedFd;
use std::os::unix::net::UnixStream;
use std::thread;
use tracing::{debug, error};

#[derive(Debug, Clone, Default)]
pub struct InProcessConnector {
    registry: FunctionRegistry,
    services: ServiceRegistry,
}

impl InProcessConnector {
    /// Children serve the functions and services in these registries.
    pub fn new(registry: FunctionRegistry, services: ServiceRegistry) -> Self {
        Self { registry, services }
    }

    /// Children share `router`'s registries.
    pub fn for_router(router: &Router) -> Self {
        Self::new(router.registry().clone(), router.services().clone())
    }
}

impl Connector for InProcessConnector {
    fn kind(&self) -> &str {
        "in_process"
    }

    fn start_child(&self, command: &BootCommand) -> Result<Spawned> {
        let (ours, theirs) = socket_pair()?;
        let preamble_len = command.preamble.len();
        let setup = ChildSetup {
            registry: self.registry.clone(),
            services: self.services.clone(),
            forward: None,
        };
        let context_id = command.config.context_id;
        thread::Builder::new()
            .name(format!("tether-child-{}", context_id))
            .spawn(move || {
                if let Err(e) = run_child(theirs, preamble_len, setup) {
                    error!("in-process context {} failed: {}", context_id, e);
                }
            })
            .map_err(|e| TetherError::io("cannot start in-process child", e))?;
        Ok(Spawned { pid: None, fd: ours })
    }
}

fn run_child(fd: OwnedFd, preamble_len: usize, setup: ChildSetup) -> Result<()> {
    let mut sock = UnixStream::from(fd);
    let mut config = answer(&mut sock, preamble_len)?;
    // Stdio belongs to the host process.
    config.setup_stdio = false;
    let context = ExternalContext::start(config, OwnedFd::from(sock), setup)?;
    debug!("in-process context {} running", context.router().context_id());
    context.run()
}
