//! Call styles, with optional pipelining.
//!
//! Calls on a pipelined chain share a chain id. When a call on the chain
//! fails remotely, the remote dispatcher remembers the error under that id
//! and answers every later call on the chain with it, without running
//! anything, until the chain is reset.

use super::dispatcher::FORGET_CHAIN;
use super::{CallRequest, Target};
use crate::context::Context;
use crate::error::Result;
use crate::receiver::Receiver;
use crate::value::{Kwargs, Value};
use std::fmt;
use tracing::debug;

/// A chain id unique across hosts, processes and threads.
pub fn make_chain_id() -> String {
    let host = nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string());
    format!(
        "{}-{}-{}",
        host,
        std::process::id(),
        uuid::Uuid::new_v4().simple()
    )
}

pub struct CallChain {
    context: Context,
    chain_id: Option<String>,
}

impl CallChain {
    pub fn new(context: &Context, pipelined: bool) -> Self {
        Self {
            context: context.clone(),
            chain_id: pipelined.then(make_chain_id),
        }
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn chain_id(&self) -> Option<&str> {
        self.chain_id.as_deref()
    }

    /// Ask the remote side to forget any error recorded for this chain.
    /// Later calls on the chain run normally again.
    pub fn reset(&self) -> Result<()> {
        let Some(chain_id) = &self.chain_id else {
            return Ok(());
        };
        let request = CallRequest {
            chain_id: None,
            target: Target::from(FORGET_CHAIN),
            args: vec![Value::from(chain_id.as_str())],
            kwargs: Kwargs::new(),
        };
        self.context.send(request.encode()?);
        Ok(())
    }

    fn request(&self, target: Target, args: Vec<Value>, kwargs: Kwargs) -> CallRequest {
        CallRequest {
            chain_id: self.chain_id.clone(),
            target,
            args,
            kwargs,
        }
    }

    /// Fire and forget. A remote failure is only logged there, or recorded
    /// against the chain when pipelined.
    pub fn call_no_reply(
        &self,
        target: impl Into<Target>,
        args: Vec<Value>,
        kwargs: Kwargs,
    ) -> Result<()> {
        let request = self.request(target.into(), args, kwargs);
        debug!("{:?}.call_no_reply({})", self, request.target);
        self.context.send(request.encode()?);
        Ok(())
    }

    /// Start a call; the reply arrives on the returned receiver.
    pub fn call_async(
        &self,
        target: impl Into<Target>,
        args: Vec<Value>,
        kwargs: Kwargs,
    ) -> Result<Receiver> {
        let request = self.request(target.into(), args, kwargs);
        debug!(
            "starting function call to {}: {}",
            self.context.name().unwrap_or_else(|| self.context.id().to_string()),
            request.target
        );
        self.context.send_async(request.encode()?, false)
    }

    /// Call and wait for the result. A remote failure comes back as
    /// [`TetherError::Call`](crate::error::TetherError::Call).
    pub fn call(&self, target: impl Into<Target>, args: Vec<Value>, kwargs: Kwargs) -> Result<Value> {
        let receiver = self.call_async(target, args, kwargs)?;
        receiver.get(None)?.unpickle(true)
    }
}

impl fmt::Debug for CallChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.chain_id {
            Some(id) => write!(f, "CallChain({:?}, {})", self.context, id),
            None => write!(f, "CallChain({:?})", self.context),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_ids_unique() {
        let a = make_chain_id();
        let b = make_chain_id();
        assert_ne!(a, b);
        assert!(a.contains(&std::process::id().to_string()));
    }
}
