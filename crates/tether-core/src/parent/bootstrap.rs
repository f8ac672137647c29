//! Bootstrap handshake between a parent and a freshly spawned child.
//!
//! ```text
//! parent                               child (first stage)
//!   spawn `<exe> first-stage <len>`
//!                           <- EC0
//!   preamble (<len> bytes)  ->
//!                                      decode config, move socket to fd 100,
//!                                      config into a pipe on fd 101
//!                           <- EC1
//!   register stream                    exec `<exe> second-stage`
//! ```
//!
//! The preamble is the zlib-compressed JSON [`ChildConfig`].

use crate::child::ChildConfig;
use crate::config::ConnectConfig;
use crate::error::{Result, TetherError};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::convert::Infallible;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, IntoRawFd};
use std::os::unix::net::UnixStream;
use std::os::unix::process::CommandExt;
use std::process::Command;
use std::time::{Duration, Instant};
use tracing::debug;

/// What a [`Connector`](super::Connector) needs to start one child.
#[derive(Debug, Clone)]
pub struct BootCommand {
    /// Arguments after the program name.
    pub args: Vec<String>,
    /// Bytes sent once the child reports `EC0`.
    pub preamble: Vec<u8>,
    pub config: ChildConfig,
}

impl BootCommand {
    pub fn new(config: ChildConfig) -> Result<Self> {
        let preamble = encode_preamble(&config)?;
        Ok(Self {
            args: vec![
                ConnectConfig::FIRST_STAGE_COMMAND.to_string(),
                preamble.len().to_string(),
            ],
            preamble,
            config,
        })
    }
}

pub fn encode_preamble(config: &ChildConfig) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(config)?;
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::best());
    encoder.write_all(&json)?;
    Ok(encoder.finish()?)
}

pub fn decode_preamble(data: &[u8]) -> Result<ChildConfig> {
    let mut json = Vec::new();
    ZlibDecoder::new(data)
        .read_to_end(&mut json)
        .map_err(|e| TetherError::io("corrupt bootstrap preamble", e))?;
    let config: ChildConfig = serde_json::from_slice(&json)?;
    config.validate()?;
    Ok(config)
}

/// Parent side of the handshake, bounded by `deadline`.
pub(crate) struct Handshake<'a> {
    sock: &'a mut UnixStream,
    name: &'a str,
    timeout: Duration,
    deadline: Instant,
    received: Vec<u8>,
}

impl<'a> Handshake<'a> {
    pub(crate) fn new(sock: &'a mut UnixStream, name: &'a str, timeout: Duration) -> Self {
        Self {
            sock,
            name,
            timeout,
            deadline: Instant::now() + timeout,
            received: Vec::new(),
        }
    }

    fn timed_out(&self) -> TetherError {
        TetherError::ConnectTimeout {
            name: self.name.to_string(),
            timeout: self.timeout,
        }
    }

    fn remaining(&self) -> Result<Duration> {
        let left = self.deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            return Err(self.timed_out());
        }
        Ok(left)
    }

    fn eof(&self) -> TetherError {
        let start = self.received.len().saturating_sub(ConnectConfig::EOF_TAIL_LEN);
        TetherError::Eof {
            tail: String::from_utf8_lossy(&self.received[start..]).into_owned(),
        }
    }

    /// Read until `marker`. Bytes are taken one at a time so nothing the
    /// child sends after the marker is consumed here.
    fn expect(&mut self, marker: &[u8]) -> Result<()> {
        let mut byte = [0u8; 1];
        while !self.received.ends_with(marker) {
            self.sock.set_read_timeout(Some(self.remaining()?))?;
            match self.sock.read(&mut byte) {
                Ok(0) => return Err(self.eof()),
                Ok(_) => self.received.push(byte[0]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e)
                    if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) =>
                {
                    return Err(self.timed_out())
                }
                Err(e) => return Err(TetherError::io(format!("{}: handshake read", self.name), e)),
            }
        }
        debug!("{}: received {:?}", self.name, String::from_utf8_lossy(marker).trim_end());
        Ok(())
    }

    fn send(&mut self, data: &[u8]) -> Result<()> {
        self.sock.set_write_timeout(Some(self.remaining()?))?;
        self.sock.write_all(data).map_err(|e| match e.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => self.timed_out(),
            io::ErrorKind::BrokenPipe => self.eof(),
            _ => TetherError::io(format!("{}: handshake write", self.name), e),
        })
    }

    /// Run the whole exchange and leave the socket blocking with no timeouts.
    pub(crate) fn run(mut self, command: &BootCommand) -> Result<()> {
        self.expect(ConnectConfig::EC0_MARKER)?;
        self.send(&command.preamble)?;
        self.expect(ConnectConfig::EC1_MARKER)?;
        self.sock.set_read_timeout(None)?;
        self.sock.set_write_timeout(None)?;
        Ok(())
    }
}

/// Child side of the handshake over an already-connected socket, for
/// contexts that run without exec.
pub(crate) fn answer(sock: &mut UnixStream, preamble_len: usize) -> Result<ChildConfig> {
    sock.write_all(ConnectConfig::EC0_MARKER)?;
    let mut preamble = vec![0u8; preamble_len];
    sock.read_exact(&mut preamble)
        .map_err(|e| TetherError::io("cannot read bootstrap preamble", e))?;
    let config = decode_preamble(&preamble)?;
    sock.write_all(ConnectConfig::EC1_MARKER)?;
    Ok(config)
}

/// Move `fd` onto `target`, leaving exactly one descriptor at `target`.
fn place_fd<F: IntoRawFd + AsRawFd>(fd: F, target: i32) -> Result<()> {
    if fd.as_raw_fd() == target {
        // Already there: release ownership so it stays open across exec.
        let _ = fd.into_raw_fd();
        return Ok(());
    }
    nix::unistd::dup2(fd.as_raw_fd(), target)?;
    Ok(())
}

/// Entry point of `<exe> first-stage <len>` in a spawned child.
///
/// Talks to the parent over stdin/stdout, then replaces this process with
/// the second stage. Returns only on failure.
pub fn first_stage(preamble_len: usize) -> Result<Infallible> {
    let mut input = File::from(io::stdin().as_fd().try_clone_to_owned()?);
    let mut output = File::from(io::stdout().as_fd().try_clone_to_owned()?);

    output.write_all(ConnectConfig::EC0_MARKER)?;
    let mut preamble = vec![0u8; preamble_len];
    input
        .read_exact(&mut preamble)
        .map_err(|e| TetherError::io("cannot read bootstrap preamble", e))?;
    let config = decode_preamble(&preamble)?;

    place_fd(input, config.in_fd)?;

    let (read_end, write_end) = nix::unistd::pipe()?;
    File::from(write_end).write_all(&serde_json::to_vec(&config)?)?;
    place_fd(read_end, ConnectConfig::CORE_SRC_FD)?;

    output.write_all(ConnectConfig::EC1_MARKER)?;
    drop(output);

    let exe = std::env::current_exe()?;
    let err = Command::new(exe)
        .arg(ConnectConfig::SECOND_STAGE_COMMAND)
        .exec();
    Err(TetherError::io("cannot exec second stage", err))
}
