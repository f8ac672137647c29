//! Children started as processes on this machine.

use super::{BootCommand, Connector, Spawned};
use crate::config::WireConfig;
use crate::error::{Result, TetherError};
use socket2::{Domain, Socket, Type};
use std::os::unix::io::OwnedFd;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::debug;

/// Runs `<program> first-stage <len>` with a socket as stdin and stdout.
/// Stderr is inherited.
#[derive(Debug, Clone)]
pub struct LocalConnector {
    program: PathBuf,
}

impl LocalConnector {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Use the running executable, which must understand the bootstrap
    /// subcommands.
    pub fn current_exe() -> Result<Self> {
        let program = std::env::current_exe()
            .map_err(|e| TetherError::io("cannot locate current executable", e))?;
        Ok(Self::new(program))
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

/// A connected pair sized for one chunk in flight each way.
pub(crate) fn socket_pair() -> Result<(OwnedFd, OwnedFd)> {
    let (ours, theirs) = Socket::pair(Domain::UNIX, Type::STREAM, None)?;
    for sock in [&ours, &theirs] {
        sock.set_send_buffer_size(WireConfig::CHUNK_SIZE)?;
        sock.set_recv_buffer_size(WireConfig::CHUNK_SIZE)?;
    }
    Ok((ours.into(), theirs.into()))
}

impl Connector for LocalConnector {
    fn kind(&self) -> &str {
        "local"
    }

    fn start_child(&self, command: &BootCommand) -> Result<Spawned> {
        let (ours, theirs) = socket_pair()?;
        let theirs_out = theirs
            .try_clone()
            .map_err(|e| TetherError::io("cannot duplicate child socket", e))?;
        let child = Command::new(&self.program)
            .args(&command.args)
            .stdin(Stdio::from(theirs))
            .stdout(Stdio::from(theirs_out))
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| TetherError::io(format!("cannot run {}", self.program.display()), e))?;
        debug!("started {} as pid {}", self.program.display(), child.id());
        // The broker reaps the pid when the stream goes away.
        Ok(Spawned {
            pid: Some(child.id()),
            fd: ours,
        })
    }
}
