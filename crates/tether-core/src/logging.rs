//! Log forwarding from children to the master.
//!
//! A child installs [`ForwardLayer`] in its subscriber. Each event becomes a
//! `FORWARD_LOG` message whose payload is `"<target>\0<level>\0<message>"`,
//! addressed to context 0. Events are held back until the parent stream
//! exists, then flushed by [`ForwardHandle::uncork`]. The master re-emits
//! them under the `tether::ctx` target with the sending context's name.

use crate::broker::Io;
use crate::context::Context;
use crate::error::Result;
use crate::message::{Message, FORWARD_LOG};
use parking_lot::Mutex;
use std::cell::Cell;
use std::collections::VecDeque;
use std::fmt::{self, Write as _};
use std::sync::Arc;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::Context as LayerContext;
use tracing_subscriber::Layer;

/// Longest backlog kept while corked; older records are dropped first.
const MAX_CORKED: usize = 10_000;

thread_local! {
    static IN_EMIT: Cell<bool> = const { Cell::new(false) };
}

enum ForwardState {
    Corked(VecDeque<Message>),
    Open(Context),
}

/// Sends every event to the master.
pub struct ForwardLayer {
    state: Arc<Mutex<ForwardState>>,
}

/// Controls when a [`ForwardLayer`] starts sending.
#[derive(Clone)]
pub struct ForwardHandle {
    state: Arc<Mutex<ForwardState>>,
}

/// A corked layer and the handle that releases it.
pub fn forward_layer() -> (ForwardLayer, ForwardHandle) {
    let state = Arc::new(Mutex::new(ForwardState::Corked(VecDeque::new())));
    (
        ForwardLayer {
            state: state.clone(),
        },
        ForwardHandle { state },
    )
}

impl ForwardHandle {
    /// Flush the backlog to `master` and send directly from now on.
    pub fn uncork(&self, master: Context) {
        let backlog = {
            let mut state = self.state.lock();
            match std::mem::replace(&mut *state, ForwardState::Open(master.clone())) {
                ForwardState::Corked(backlog) => backlog,
                ForwardState::Open(_) => VecDeque::new(),
            }
        };
        for msg in backlog {
            master.send(msg);
        }
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{:?}", value);
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }
}

/// Payload of one forwarded record.
pub(crate) fn encode_record(target: &str, level: &Level, text: &str) -> Vec<u8> {
    format!("{}\0{}\0{}", target, level, text).into_bytes()
}

/// Split a forwarded payload into target, level and text.
pub(crate) fn decode_record(data: &[u8]) -> Option<(String, Level, String)> {
    let text = String::from_utf8_lossy(data);
    let mut parts = text.splitn(3, '\0');
    let target = parts.next()?.to_string();
    let level = parts.next()?.parse::<Level>().ok()?;
    let message = parts.next()?.to_string();
    Some((target, level, message))
}

impl<S: Subscriber> Layer<S> for ForwardLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: LayerContext<'_, S>) {
        let meta = event.metadata();
        if meta.target().starts_with("tether::io") {
            return;
        }
        if IN_EMIT.with(|flag| flag.replace(true)) {
            return;
        }

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        visitor.message.push_str(&visitor.fields);
        let msg = Message::new(
            FORWARD_LOG,
            encode_record(meta.target(), meta.level(), &visitor.message),
        );

        let master = {
            let mut state = self.state.lock();
            match &mut *state {
                ForwardState::Corked(backlog) => {
                    cork(backlog, msg);
                    None
                }
                ForwardState::Open(master) => Some((master.clone(), msg)),
            }
        };
        if let Some((master, msg)) = master {
            master.send(msg);
        }
        IN_EMIT.with(|flag| flag.set(false));
    }
}

fn cork(backlog: &mut VecDeque<Message>, msg: Message) {
    if backlog.len() >= MAX_CORKED {
        backlog.pop_front();
    }
    backlog.push_back(msg);
}

/// `FORWARD_LOG` handler installed on the master.
pub(crate) fn on_forward_log(io: &mut Io, msg: Message) -> Result<()> {
    if msg.is_dead() {
        return Ok(());
    }
    let context = io.router().context_by_id(msg.src_id);
    let name = context.name().unwrap_or_else(|| msg.src_id.to_string());
    let Some((target, level, text)) = decode_record(&msg.data) else {
        tracing::error!("dropping malformed log record from {:?}", context);
        return Ok(());
    };
    match level {
        Level::ERROR => tracing::error!(target: "tether::ctx", context = %name, "{}: {}", target, text),
        Level::WARN => tracing::warn!(target: "tether::ctx", context = %name, "{}: {}", target, text),
        Level::INFO => tracing::info!(target: "tether::ctx", context = %name, "{}: {}", target, text),
        Level::DEBUG => tracing::debug!(target: "tether::ctx", context = %name, "{}: {}", target, text),
        _ => tracing::trace!(target: "tether::ctx", context = %name, "{}: {}", target, text),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::receiver::{Receiver, ReceiverOptions};
    use crate::router::RouterBuilder;
    use std::time::Duration;
    use tracing_subscriber::layer::SubscriberExt;

    #[test]
    fn test_record_encoding() {
        let data = encode_record("app::net", &Level::WARN, "lost\0peer");
        let (target, level, text) = decode_record(&data).unwrap();
        assert_eq!(target, "app::net");
        assert_eq!(level, Level::WARN);
        assert_eq!(text, "lost\0peer");
        assert!(decode_record(b"only-target").is_none());
    }

    #[test]
    fn test_full_backlog_drops_oldest() {
        let mut backlog = VecDeque::new();
        for handle in 0..=MAX_CORKED as u32 {
            cork(&mut backlog, Message::new(handle, Vec::new()));
        }
        assert_eq!(backlog.len(), MAX_CORKED);
        assert_eq!(backlog.front().map(|m| m.handle), Some(1));
        assert_eq!(backlog.back().map(|m| m.handle), Some(MAX_CORKED as u32));
    }

    #[test]
    fn test_corked_records_flush_on_uncork() {
        let router = RouterBuilder::new()
            .shutdown_timeout(Duration::from_millis(200))
            .build()
            .unwrap();
        let sink = Receiver::new(&router, ReceiverOptions::default());
        let (layer, handle) = forward_layer();
        let subscriber = tracing_subscriber::registry().with(layer);

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(target: "demo", "first");
            tracing::warn!(target: "demo", "second");
        });
        assert!(sink.is_empty());

        // Point the layer at a sink on our own context so records are visible.
        let master = router.myself();
        let state = handle.state.clone();
        {
            let mut guard = state.lock();
            if let ForwardState::Corked(backlog) = &mut *guard {
                for msg in backlog.iter_mut() {
                    msg.handle = sink.handle();
                }
            }
        }
        handle.uncork(master);

        let first = sink.get(Some(Duration::from_secs(5))).unwrap();
        let (_, level, text) = decode_record(&first.data).unwrap();
        assert_eq!(level, Level::INFO);
        assert_eq!(text, "first");
        let second = sink.get(Some(Duration::from_secs(5))).unwrap();
        assert_eq!(decode_record(&second.data).unwrap().1, Level::WARN);

        router.shutdown();
        router.join().unwrap();
    }
}
