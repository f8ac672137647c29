//! Context id allocation.
//!
//! The master hands out ids from a counter and answers `ALLOCATE_ID` with a
//! `[start, end)` block. Children spend their current block and ask the
//! master for another when it runs out.

use crate::broker::Io;
use crate::config::IdConfig;
use crate::error::{Result, TetherError};
use crate::message::{Message, ALLOCATE_ID};
use crate::router::Router;
use crate::value::Value;
use parking_lot::Mutex;
use std::ops::Range;
use tracing::debug;

pub(crate) enum IdSource {
    Master(Mutex<u32>),
    Child(Mutex<Range<u32>>),
}

impl IdSource {
    pub(crate) fn master() -> Self {
        IdSource::Master(Mutex::new(IdConfig::MASTER_ID + 1))
    }

    pub(crate) fn child() -> Self {
        IdSource::Child(Mutex::new(0..0))
    }

    pub(crate) fn allocate(&self, router: &Router) -> Result<u32> {
        match self {
            IdSource::Master(next) => {
                let mut next = next.lock();
                let id = *next;
                *next += 1;
                Ok(id)
            }
            IdSource::Child(block) => {
                let mut block = block.lock();
                if let Some(id) = block.next() {
                    return Ok(id);
                }
                let master = router.context_by_id(IdConfig::MASTER_ID);
                let reply = master.send_await(Message::new(ALLOCATE_ID, Vec::new()), None)?;
                let (start, end) = parse_block(&reply)?;
                debug!("context {} received ids [{}..{})", router.context_id(), start, end);
                *block = start..end;
                block
                    .next()
                    .ok_or_else(|| TetherError::Other(format!("empty id block [{}..{})", start, end)))
            }
        }
    }

    /// Reserve a whole block. Only the master owns blocks to give away.
    fn allocate_block(&self) -> Option<(u32, u32)> {
        match self {
            IdSource::Master(next) => {
                let mut next = next.lock();
                let start = *next;
                *next += IdConfig::BLOCK_SIZE;
                Some((start, start + IdConfig::BLOCK_SIZE))
            }
            IdSource::Child(_) => None,
        }
    }
}

fn parse_block(reply: &Value) -> Result<(u32, u32)> {
    let bad = || TetherError::Stream(format!("bad input: malformed id block {:?}", reply));
    match reply.as_list() {
        Some([start, end]) => {
            let start = start.as_u32().ok_or_else(bad)?;
            let end = end.as_u32().ok_or_else(bad)?;
            if start >= end {
                return Err(bad());
            }
            Ok((start, end))
        }
        _ => Err(bad()),
    }
}

/// `ALLOCATE_ID` handler installed on the master.
pub(crate) fn on_allocate_id(io: &mut Io, msg: Message) -> Result<()> {
    if msg.is_dead() {
        return Ok(());
    }
    let router = io.router().clone();
    let Some((start, end)) = router.ids().allocate_block() else {
        return Err(TetherError::Other("ALLOCATE_ID reached a non-master".into()));
    };
    let requestee = router.context_by_id(msg.src_id);
    router.context_by_id(start).set_via(requestee.clone());
    debug!("allocating [{}..{}) to {:?}", start, end, requestee);
    io.reply(&msg, &Value::tuple(vec![Value::from(start), Value::from(end)]));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::RouterBuilder;
    use std::time::Duration;

    #[test]
    fn test_master_ids_and_blocks_do_not_overlap() {
        let source = IdSource::master();
        let (start, end) = source.allocate_block().unwrap();
        assert_eq!((start, end), (1, 1 + IdConfig::BLOCK_SIZE));
        let router = RouterBuilder::new()
            .shutdown_timeout(Duration::from_millis(200))
            .build()
            .unwrap();
        assert_eq!(source.allocate(&router).unwrap(), end);
        router.shutdown();
        router.join().unwrap();
    }

    #[test]
    fn test_master_answers_allocate_id() {
        let router = RouterBuilder::new()
            .shutdown_timeout(Duration::from_millis(200))
            .build()
            .unwrap();
        assert_eq!(router.allocate_id().unwrap(), 1);
        let reply = router
            .myself()
            .send_await(Message::new(ALLOCATE_ID, Vec::new()), Some(Duration::from_secs(5)))
            .unwrap();
        assert_eq!(parse_block(&reply).unwrap(), (2, 2 + IdConfig::BLOCK_SIZE));
        router.shutdown();
        router.join().unwrap();
    }

    #[test]
    fn test_malformed_block_rejected() {
        assert!(parse_block(&Value::Int(4)).is_err());
        let reversed = Value::tuple(vec![Value::from(9u32), Value::from(3u32)]);
        assert!(parse_block(&reversed).is_err());
    }
}
