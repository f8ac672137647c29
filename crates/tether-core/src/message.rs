//! Message envelope and stream framing.
//!
//! Every frame is a fixed 24-byte header of six big-endian u32 fields followed
//! by the payload. There is no magic number or version byte.
//!
//! ```text
//! [dst_id][src_id][auth_id][handle][reply_to][len][len bytes of payload]
//! ```

use crate::config::WireConfig;
use crate::error::{Result, TetherError, CHANNEL_REMOTE_MSG};
use crate::value::Value;
use std::fmt;
#[cfg(test)]
use std::io::{Read, Write};

/// Module source request. Served outside this crate.
pub const GET_MODULE: u32 = 100;
pub const CALL_FUNCTION: u32 = 101;
pub const FORWARD_LOG: u32 = 102;
pub const ADD_ROUTE: u32 = 103;
pub const DEL_ROUTE: u32 = 104;
pub const ALLOCATE_ID: u32 = 105;
pub const SHUTDOWN: u32 = 106;
/// Module source response. Served outside this crate.
pub const LOAD_MODULE: u32 = 107;
/// Module forwarding request. Served outside this crate.
pub const FORWARD_MODULE: u32 = 108;
pub const DETACHING: u32 = 109;
pub const CALL_SERVICE: u32 = 110;

/// `reply_to` sentinel marking a message as a dead-letter notice.
pub const IS_DEAD: u32 = 999;

/// Parsed frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub dst_id: u32,
    pub src_id: u32,
    pub auth_id: u32,
    pub handle: u32,
    pub reply_to: u32,
    pub len: usize,
}

impl Header {
    /// Parse a header from the front of `buf`, or `None` if it is too short.
    pub fn parse(buf: &[u8]) -> Option<Header> {
        if buf.len() < WireConfig::HEADER_LEN {
            return None;
        }
        let field = |i: usize| {
            let mut word = [0u8; 4];
            word.copy_from_slice(&buf[i * 4..i * 4 + 4]);
            u32::from_be_bytes(word)
        };
        Some(Header {
            dst_id: field(0),
            src_id: field(1),
            auth_id: field(2),
            handle: field(3),
            reply_to: field(4),
            len: field(5) as usize,
        })
    }

    pub fn to_bytes(&self) -> [u8; WireConfig::HEADER_LEN] {
        let mut out = [0u8; WireConfig::HEADER_LEN];
        let fields = [
            self.dst_id,
            self.src_id,
            self.auth_id,
            self.handle,
            self.reply_to,
            self.len as u32,
        ];
        for (i, value) in fields.iter().enumerate() {
            out[i * 4..i * 4 + 4].copy_from_slice(&value.to_be_bytes());
        }
        out
    }
}

/// One routed message.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub dst_id: u32,
    pub src_id: u32,
    pub auth_id: u32,
    pub handle: u32,
    pub reply_to: u32,
    pub data: Vec<u8>,
}

impl Message {
    /// A message for `handle` carrying raw payload bytes.
    pub fn new(handle: u32, data: Vec<u8>) -> Self {
        Self {
            handle,
            data,
            ..Default::default()
        }
    }

    /// A message whose payload is the encoding of `value`.
    pub fn pickled(value: &Value) -> Result<Self> {
        Ok(Self {
            data: serde_json::to_vec(value)?,
            ..Default::default()
        })
    }

    /// A dead-letter notice, optionally carrying a reason text.
    pub fn dead(reason: Option<&str>) -> Self {
        Self {
            reply_to: IS_DEAD,
            data: reason.map(|r| r.as_bytes().to_vec()).unwrap_or_default(),
            ..Default::default()
        }
    }

    pub fn from_parts(header: Header, data: Vec<u8>) -> Self {
        Self {
            dst_id: header.dst_id,
            src_id: header.src_id,
            auth_id: header.auth_id,
            handle: header.handle,
            reply_to: header.reply_to,
            data,
        }
    }

    pub fn with_handle(mut self, handle: u32) -> Self {
        self.handle = handle;
        self
    }

    pub fn with_dst(mut self, dst_id: u32) -> Self {
        self.dst_id = dst_id;
        self
    }

    pub fn with_reply_to(mut self, reply_to: u32) -> Self {
        self.reply_to = reply_to;
        self
    }

    pub fn is_dead(&self) -> bool {
        self.reply_to == IS_DEAD
    }

    /// True when the sender expects an answer.
    pub fn wants_reply(&self) -> bool {
        self.reply_to != 0 && self.reply_to != IS_DEAD
    }

    /// Reason text of a dead message, if one was supplied.
    pub fn dead_reason(&self) -> Option<String> {
        if self.is_dead() && !self.data.is_empty() {
            Some(String::from_utf8_lossy(&self.data).into_owned())
        } else {
            None
        }
    }

    /// Build the reply to this message, addressed back to its sender.
    pub fn reply(&self, value: &Value) -> Result<Message> {
        Ok(Message::pickled(value)?
            .with_dst(self.src_id)
            .with_handle(self.reply_to))
    }

    /// Build a dead reply to this message.
    pub fn reply_dead(&self, reason: Option<&str>) -> Message {
        Message::dead(reason)
            .with_dst(self.src_id)
            .with_handle(self.reply_to)
    }

    /// Decode the payload.
    ///
    /// A `CallError` payload becomes `TetherError::Call`. A dead message
    /// becomes `TetherError::Channel` when `throw_dead` is set and
    /// `Value::None` otherwise.
    pub fn unpickle(&self, throw_dead: bool) -> Result<Value> {
        if self.is_dead() {
            if throw_dead {
                return Err(TetherError::Channel(CHANNEL_REMOTE_MSG.to_string()));
            }
            return Ok(Value::None);
        }
        let value: Value = serde_json::from_slice(&self.data).map_err(|e| {
            TetherError::Stream(format!(
                "bad input: cannot decode payload of {:?}: {}",
                self, e
            ))
        })?;
        value.validate()?;
        match value {
            Value::CallError(err) => Err(TetherError::Call(err)),
            other => Ok(other),
        }
    }

    pub fn header(&self) -> Header {
        Header {
            dst_id: self.dst_id,
            src_id: self.src_id,
            auth_id: self.auth_id,
            handle: self.handle,
            reply_to: self.reply_to,
            len: self.data.len(),
        }
    }

    /// Header plus payload, ready for the wire.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(WireConfig::HEADER_LEN + self.data.len());
        out.extend_from_slice(&self.header().to_bytes());
        out.extend_from_slice(&self.data);
        out
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Message({}, {}, {}, {}, {}, {} bytes)",
            self.dst_id,
            self.src_id,
            self.auth_id,
            self.handle,
            self.reply_to,
            self.data.len()
        )
    }
}

/// Read one frame from a blocking reader, for peers in tests. Brokers frame
/// through `broker::stream::Stream`.
///
/// Returns `None` on clean EOF before a header byte arrived.
#[cfg(test)]
pub(crate) fn read_message<R: Read>(reader: &mut R, max_size: usize) -> Result<Option<Message>> {
    let mut header_buf = [0u8; WireConfig::HEADER_LEN];
    match reader.read_exact(&mut header_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    // A full buffer always parses.
    let header = Header::parse(&header_buf)
        .ok_or_else(|| TetherError::Stream("short frame header".into()))?;

    if header.len > max_size {
        return Err(TetherError::Stream(format!(
            "Maximum message size exceeded (got {}, max {})",
            header.len, max_size
        )));
    }

    let mut data = vec![0u8; header.len];
    reader.read_exact(&mut data)?;
    Ok(Some(Message::from_parts(header, data)))
}

/// Write one frame to a blocking writer.
#[cfg(test)]
pub(crate) fn write_message<W: Write>(writer: &mut W, msg: &Message) -> Result<()> {
    writer.write_all(&msg.encode())?;
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CallError;
    use crate::value::Kwargs;
    use std::io::Cursor;

    #[test]
    fn test_frame_round_trip() {
        let value = Value::tuple(vec![
            Value::None,
            Value::Str("example".into()),
            Value::Kwargs(Kwargs::new().with("x", 1)),
        ]);
        let mut msg = Message::pickled(&value).unwrap();
        msg.dst_id = 7;
        msg.src_id = 3;
        msg.auth_id = 3;
        msg.handle = CALL_FUNCTION;
        msg.reply_to = 1001;

        let mut wire = Vec::new();
        write_message(&mut wire, &msg).unwrap();
        assert_eq!(wire.len(), WireConfig::HEADER_LEN + msg.data.len());

        let decoded = read_message(&mut Cursor::new(wire), WireConfig::MAX_MESSAGE_SIZE)
            .unwrap()
            .unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.unpickle(true).unwrap(), value);
    }

    #[test]
    fn test_header_is_big_endian() {
        let msg = Message::new(0x0102_0304, vec![9]).with_dst(1);
        let wire = msg.encode();
        assert_eq!(&wire[0..4], &[0, 0, 0, 1]);
        assert_eq!(&wire[12..16], &[1, 2, 3, 4]);
        assert_eq!(&wire[20..24], &[0, 0, 0, 1]);
    }

    #[test]
    fn test_partial_header_does_not_parse() {
        let wire = Message::new(5, vec![]).encode();
        assert!(Header::parse(&wire[..23]).is_none());
        assert!(Header::parse(&wire).is_some());
    }

    #[test]
    fn test_read_rejects_oversized_frame() {
        let mut header = Message::new(5, vec![]).header();
        header.len = 4096;
        let wire = header.to_bytes().to_vec();
        let err = read_message(&mut Cursor::new(wire), 1024).unwrap_err();
        assert!(err.to_string().contains("Maximum message size exceeded"));
    }

    #[test]
    fn test_dead_message_unpickle() {
        let dead = Message::dead(Some("gone"));
        assert!(dead.is_dead());
        assert!(!dead.wants_reply());
        assert_eq!(dead.dead_reason().as_deref(), Some("gone"));
        assert!(dead.unpickle(true).unwrap_err().is_disconnect());
        assert_eq!(dead.unpickle(false).unwrap(), Value::None);
    }

    #[test]
    fn test_call_error_payload_raises() {
        let msg = Message::pickled(&Value::CallError(CallError::msg("boom"))).unwrap();
        match msg.unpickle(true) {
            Err(TetherError::Call(err)) => assert_eq!(err.message, "boom"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_garbage_payload_fails_closed() {
        let msg = Message::new(CALL_FUNCTION, b"\x80\x04cos\nsystem".to_vec());
        assert!(matches!(msg.unpickle(true), Err(TetherError::Stream(_))));
    }

    #[test]
    fn test_reply_addresses_sender() {
        let mut msg = Message::new(CALL_FUNCTION, vec![]);
        msg.src_id = 12;
        msg.reply_to = 1005;
        let reply = msg.reply(&Value::Int(5)).unwrap();
        assert_eq!(reply.dst_id, 12);
        assert_eq!(reply.handle, 1005);
        assert_eq!(reply.reply_to, 0);
    }
}
