//! Route announcement and withdrawal across the tree.
//!
//! A new direct stream is announced upward with `ADD_ROUTE`. When it goes
//! away, every id learned through it is withdrawn with `DEL_ROUTE`, both
//! upward and sideways to any stream that ever sent traffic to that id.
//! Payloads are the decimal id, optionally followed by `:name`.

use super::HandlerFn;
use crate::broker::{Io, Token};
use crate::error::{Result, TetherError};
use crate::message::{Message, ADD_ROUTE, DEL_ROUTE};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error};

pub(crate) fn handlers() -> Vec<(u32, HandlerFn)> {
    vec![
        (ADD_ROUTE, Arc::new(on_add_route) as HandlerFn),
        (DEL_ROUTE, Arc::new(on_del_route) as HandlerFn),
    ]
}

fn encode(target_id: u32, name: Option<&str>) -> Vec<u8> {
    match name {
        Some(name) => format!("{}:{}", target_id, name).into_bytes(),
        None => target_id.to_string().into_bytes(),
    }
}

fn decode(data: &[u8]) -> Result<(u32, Option<String>)> {
    let text = std::str::from_utf8(data)
        .map_err(|_| TetherError::Stream("bad input: route payload is not UTF-8".into()))?;
    let (id, name) = match text.split_once(':') {
        Some((id, name)) => (id, Some(name.to_string())),
        None => (text, None),
    };
    let id = id
        .parse()
        .map_err(|_| TetherError::Stream(format!("bad input: route id {:?}", id)))?;
    Ok((id, name))
}

fn on_add_route(io: &mut Io, msg: Message) -> Result<()> {
    if msg.is_dead() {
        return Ok(());
    }
    let (target_id, target_name) = decode(&msg.data)?;
    io.router()
        .context_named(target_id, target_name.as_deref());

    let Some(token) = io.stream_for(msg.auth_id) else {
        error!("ADD_ROUTE for {} from {} with no stream", target_id, msg.auth_id);
        return Ok(());
    };
    if let Some(current) = io.stream_for(target_id) {
        let via_parent = io.router().parent_id() == io.stream(current).map(|s| s.remote_id);
        if !via_parent {
            error!(
                "cannot add duplicate route to {} via stream {}: already routed via stream {}",
                target_id, token, current
            );
            return Ok(());
        }
    }

    debug!("adding route to {} via stream {}", target_id, token);
    io.router
        .routes_by_stream
        .entry(token)
        .or_default()
        .insert(target_id);
    io.add_route(target_id, token)?;
    io.propagate(ADD_ROUTE, target_id, target_name.as_deref());
    Ok(())
}

fn on_del_route(io: &mut Io, msg: Message) -> Result<()> {
    if msg.is_dead() {
        return Ok(());
    }
    let (target_id, _) = decode(&msg.data)?;
    let Some(registered) = io.stream_for(target_id) else {
        return Ok(());
    };
    let stream = io.stream_for(msg.auth_id);
    if stream != Some(registered) {
        error!(
            "received DEL_ROUTE for {} from stream {:?}, expected stream {}",
            target_id, stream, registered
        );
        return Ok(());
    }

    io.fire_context_disconnect(target_id);
    debug!("deleting route to {} via stream {}", target_id, registered);
    if let Some(routes) = io.router.routes_by_stream.get_mut(&registered) {
        routes.remove(&target_id);
    }
    io.del_route(target_id);

    let from_parent = io.router().parent_id() == io.stream(registered).map(|s| s.remote_id);
    if !from_parent {
        io.propagate(DEL_ROUTE, target_id, None);
    }
    io.child_propagate(DEL_ROUTE, target_id);
    Ok(())
}

impl Io {
    fn send_route_notice(&mut self, token: Token, handle: u32, target_id: u32, name: Option<&str>) {
        let Some(remote_id) = self.stream(token).map(|s| s.remote_id) else {
            return;
        };
        let mut msg = Message::new(handle, encode(target_id, name)).with_dst(remote_id);
        msg.src_id = self.context_id();
        msg.auth_id = self.context_id();
        self.send_on(token, &msg);
    }

    /// Tell our parent, if any.
    pub(crate) fn propagate(&mut self, handle: u32, target_id: u32, name: Option<&str>) {
        if let Some(parent) = self.parent_token() {
            self.send_route_notice(parent, handle, target_id, name);
        }
    }

    /// Tell every non-parent stream that has sent traffic to `target_id`.
    pub(crate) fn child_propagate(&mut self, handle: u32, target_id: u32) {
        let parent = self.parent_token();
        let mut tokens: Vec<Token> = self
            .streams()
            .filter(|s| Some(s.token) != parent && s.egress_ids.contains(&target_id))
            .map(|s| s.token)
            .collect();
        tokens.sort_unstable();
        for token in tokens {
            self.send_route_notice(token, handle, target_id, None);
        }
    }

    /// Start tracking a freshly connected direct stream and announce it.
    pub(crate) fn notice_stream(&mut self, token: Token) {
        let Some((remote_id, name)) = self.stream(token).map(|s| (s.remote_id, s.name.clone()))
        else {
            return;
        };
        self.router
            .routes_by_stream
            .insert(token, HashSet::from([remote_id]));
        self.propagate(ADD_ROUTE, remote_id, Some(&name));
    }

    /// Withdraw every id learned through a stream that just went away.
    /// Returns the withdrawn ids.
    pub(crate) fn on_monitored_stream_gone(&mut self, token: Token) -> Vec<u32> {
        let Some(routes) = self.router.routes_by_stream.remove(&token) else {
            return Vec::new();
        };
        let mut routes: Vec<u32> = routes.into_iter().collect();
        routes.sort_unstable();
        debug!("stream {} is gone; propagating DEL_ROUTE for {:?}", token, routes);
        for &target_id in &routes {
            self.del_route(target_id);
            self.propagate(DEL_ROUTE, target_id, None);
            self.child_propagate(DEL_ROUTE, target_id);
        }
        routes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_with_and_without_name() {
        assert_eq!(encode(12, Some("local.4")), b"12:local.4".to_vec());
        assert_eq!(decode(b"12:local.4").unwrap(), (12, Some("local.4".to_string())));
        assert_eq!(decode(b"7").unwrap(), (7, None));
    }

    #[test]
    fn test_name_may_contain_colons() {
        assert_eq!(
            decode(b"9:ssh.host:22").unwrap(),
            (9, Some("ssh.host:22".to_string()))
        );
    }

    #[test]
    fn test_bad_payload_rejected() {
        assert!(decode(b"x:y").is_err());
        assert!(decode(&[0xff, 0xfe]).is_err());
    }
}
