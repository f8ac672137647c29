//! Framed connection to one peer.

use super::poller::Token;
use super::side::{IoOutcome, Side};
use crate::config::WireConfig;
use crate::message::{Header, Message};
use std::collections::{HashSet, VecDeque};
use std::fmt;
use tracing::{error, trace};

/// How a stream relates to this context in the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamRole {
    /// Connection to our parent.
    Upstream,
    /// Connection to a child we started; it is told to shut down with us.
    Downstream,
    /// Any other attached connection.
    Peer,
}

/// Process started for a downstream stream.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ChildProcess {
    pub pid: u32,
    pub reaped: bool,
}

/// Messages decoded by one receive pass.
#[derive(Debug, Default)]
pub(crate) struct Received {
    pub messages: Vec<Message>,
    pub disconnected: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Transmitted {
    /// Output buffer is now empty.
    Drained,
    /// Bytes remain; keep transmit interest.
    Pending,
    Disconnected,
}

pub(crate) struct Stream {
    pub token: Token,
    pub name: String,
    pub remote_id: u32,
    pub role: StreamRole,
    pub receive_side: Side,
    pub transmit_side: Side,
    /// Identity stamped on every inbound message, overriding the claimed one.
    pub auth_id: Option<u32>,
    pub is_privileged: bool,
    pub detached: bool,
    /// Destination ids this stream has sent traffic to.
    pub egress_ids: HashSet<u32>,
    pub child: Option<ChildProcess>,
    max_message_size: usize,
    input: Vec<u8>,
    output: VecDeque<Vec<u8>>,
    output_offset: usize,
    pending: usize,
}

impl Stream {
    pub(crate) fn new(
        token: Token,
        name: String,
        remote_id: u32,
        role: StreamRole,
        receive_side: Side,
        transmit_side: Side,
        max_message_size: usize,
    ) -> Self {
        Self {
            token,
            name,
            remote_id,
            role,
            receive_side,
            transmit_side,
            auth_id: None,
            is_privileged: false,
            detached: false,
            egress_ids: HashSet::new(),
            child: None,
            max_message_size,
            input: Vec::new(),
            output: VecDeque::new(),
            output_offset: 0,
            pending: 0,
        }
    }

    /// Bytes queued but not yet written.
    pub(crate) fn pending_bytes(&self) -> usize {
        self.pending
    }

    /// Read one chunk and decode every complete frame it finishes.
    pub(crate) fn receive(&mut self) -> Received {
        let mut out = Received::default();
        let mut chunk = vec![0u8; WireConfig::CHUNK_SIZE];
        match self.receive_side.read(&mut chunk) {
            IoOutcome::Ready(n) => {
                trace!(target: "tether::io", "{}: read {} bytes", self.name, n);
                self.input.extend_from_slice(&chunk[..n]);
            }
            IoOutcome::WouldBlock => return out,
            IoOutcome::Disconnected => {
                out.disconnected = true;
                return out;
            }
        }

        let mut offset = 0;
        while let Some(header) = Header::parse(&self.input[offset..]) {
            if header.len > self.max_message_size {
                error!(
                    "{}: Maximum message size exceeded (got {}, max {})",
                    self.name, header.len, self.max_message_size
                );
                self.input.clear();
                out.disconnected = true;
                return out;
            }
            let total = WireConfig::HEADER_LEN + header.len;
            if self.input.len() - offset < total {
                break;
            }
            let start = offset + WireConfig::HEADER_LEN;
            let data = self.input[start..start + header.len].to_vec();
            out.messages.push(Message::from_parts(header, data));
            offset += total;
        }
        self.input.drain(..offset);
        out
    }

    /// Queue `msg` for transmission. Returns true when the output buffer was
    /// empty, meaning the caller must start transmit interest.
    pub(crate) fn enqueue(&mut self, msg: &Message) -> bool {
        let was_empty = self.pending == 0;
        let frame = msg.encode();
        trace!(target: "tether::io", "{}: queued {:?}", self.name, msg);
        self.pending += frame.len();
        self.output.push_back(frame);
        was_empty
    }

    /// Write as much buffered output as the descriptor accepts.
    pub(crate) fn transmit(&mut self) -> Transmitted {
        while let Some(front) = self.output.front() {
            match self.transmit_side.write(&front[self.output_offset..]) {
                IoOutcome::Ready(n) => {
                    trace!(target: "tether::io", "{}: wrote {} bytes", self.name, n);
                    self.output_offset += n;
                    self.pending -= n;
                    if self.output_offset == front.len() {
                        self.output.pop_front();
                        self.output_offset = 0;
                    }
                }
                IoOutcome::WouldBlock => return Transmitted::Pending,
                IoOutcome::Disconnected => return Transmitted::Disconnected,
            }
        }
        Transmitted::Drained
    }

    /// Release both sides and every buffer.
    pub(crate) fn close(&mut self) {
        self.receive_side.close();
        self.transmit_side.close();
        self.input = Vec::new();
        self.output.clear();
        self.output_offset = 0;
        self.pending = 0;
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Stream({}, {:?})", self.remote_id, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::CALL_FUNCTION;
    use std::io::{Read, Write};
    use std::os::unix::io::OwnedFd;
    use std::os::unix::net::UnixStream;

    fn stream_pair(max: usize) -> (Stream, UnixStream) {
        let (a, b) = UnixStream::pair().unwrap();
        let tx = a.try_clone().unwrap();
        let stream = Stream::new(
            1,
            "test".into(),
            7,
            StreamRole::Peer,
            Side::new(OwnedFd::from(a), true).unwrap(),
            Side::new(OwnedFd::from(tx), true).unwrap(),
            max,
        );
        (stream, b)
    }

    #[test]
    fn test_receive_reassembles_split_frames() {
        let (mut stream, mut peer) = stream_pair(WireConfig::MAX_MESSAGE_SIZE);
        let first = Message::new(CALL_FUNCTION, b"hello".to_vec()).with_dst(7);
        let second = Message::new(CALL_FUNCTION, b"world!".to_vec()).with_dst(8);
        let mut wire = first.encode();
        wire.extend(second.encode());

        // Half a header, then the rest.
        peer.write_all(&wire[..10]).unwrap();
        assert!(stream.receive().messages.is_empty());
        peer.write_all(&wire[10..]).unwrap();
        let got = stream.receive();
        assert_eq!(got.messages, vec![first, second]);
        assert!(!got.disconnected);
    }

    #[test]
    fn test_oversized_header_disconnects_without_buffering() {
        let (mut stream, mut peer) = stream_pair(64);
        let mut header = Message::new(CALL_FUNCTION, vec![]).header();
        header.len = 1 << 20;
        peer.write_all(&header.to_bytes()).unwrap();
        let got = stream.receive();
        assert!(got.disconnected);
        assert!(got.messages.is_empty());
    }

    #[test]
    fn test_enqueue_and_transmit() {
        let (mut stream, mut peer) = stream_pair(WireConfig::MAX_MESSAGE_SIZE);
        let msg = Message::new(5, vec![1, 2, 3]);
        assert!(stream.enqueue(&msg));
        assert!(!stream.enqueue(&msg));
        assert_eq!(stream.pending_bytes(), 2 * (WireConfig::HEADER_LEN + 3));
        assert_eq!(stream.transmit(), Transmitted::Drained);
        assert_eq!(stream.pending_bytes(), 0);

        let mut buf = vec![0u8; 2 * (WireConfig::HEADER_LEN + 3)];
        peer.read_exact(&mut buf).unwrap();
        assert_eq!(&buf[..WireConfig::HEADER_LEN + 3], msg.encode().as_slice());
    }

    #[test]
    fn test_peer_close_is_disconnect() {
        let (mut stream, peer) = stream_pair(WireConfig::MAX_MESSAGE_SIZE);
        drop(peer);
        assert!(stream.receive().disconnected);
        stream.close();
        stream.close();
    }
}
