//! Tether - message router, broker and RPC runtime for trees of cooperating
//! processes.
//!
//! A master process starts children over a bootstrap handshake. Every
//! context runs one I/O thread (the [`Broker`]) that multiplexes framed
//! messages over its streams, and a [`Router`] that forwards them by
//! destination id, dispatches local ones to registered handles, and tracks
//! which contexts are reachable through which stream.
//!
//! On top of that sit function calls ([`Context::call`], [`CallChain`]) and
//! long-lived services ([`Service`], [`Pool`]).
//!
//! # Example
//!
//! ```rust,ignore
//! use tether_core::{ConnectOptions, InProcessConnector, Kwargs, RouterBuilder, Value};
//!
//! let router = RouterBuilder::new().build()?;
//! router.registry().register("demo.add", |call| {
//!     Ok(Value::Int(call.arg_i64(0)? + call.arg_i64(1)?))
//! });
//! let child = router.connect(
//!     &InProcessConnector::for_router(&router),
//!     ConnectOptions::default(),
//! )?;
//! let sum = child.call("demo.add", vec![2.into(), 3.into()], Kwargs::new())?;
//! assert_eq!(sum, Value::Int(5));
//! router.shutdown();
//! router.join()?;
//! ```

pub mod broker;
pub mod child;
pub mod config;
pub mod context;
pub mod error;
pub mod latch;
pub mod logging;
pub mod message;
pub mod parent;
pub mod platform;
pub mod receiver;
pub mod router;
pub mod rpc;
pub mod select;
pub mod service;
pub mod value;

mod id_allocator;

// Re-export commonly used types
pub use broker::{Broker, Io, StdioKind, StreamRole};
pub use child::{ChildConfig, ChildSetup, ExternalContext};
pub use config::{BrokerConfig, ConnectConfig, IdConfig, PollerKind, PoolConfig, WireConfig};
pub use context::{Channel, Context, Sender};
pub use error::{CallError, Result, TetherError};
pub use latch::Latch;
pub use logging::{forward_layer, ForwardHandle, ForwardLayer};
pub use message::{Header, Message};
pub use parent::{
    first_stage, BootCommand, ConnectOptions, Connector, InProcessConnector, LocalConnector,
    Spawned,
};
pub use receiver::{Receiver, ReceiverOptions};
pub use router::{AttachOptions, HandlerOptions, Policy, Router, RouterBuilder};
pub use rpc::{CallChain, CallResult, FunctionRegistry, Invocation, Target};
pub use select::{Event, Member, Select};
pub use service::{
    Activator, InvokerKind, MethodSpec, Pool, Service, ServiceCall, ServicePolicy,
    ServiceRegistry,
};
pub use value::{ContextRef, Kwargs, SenderRef, Value, ValueKind};
