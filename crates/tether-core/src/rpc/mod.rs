//! Function calls between contexts.
//!
//! A `CALL_FUNCTION` payload is the tuple
//! `(chain_id, module, class, function, args, kwargs)`; the reply carries the
//! return value or a [`CallError`](crate::error::CallError).

mod chain;
mod dispatcher;
mod registry;

pub use chain::{make_chain_id, CallChain};
pub use dispatcher::{Dispatcher, FORGET_CHAIN};
pub use registry::{CallResult, Function, FunctionRegistry, Invocation, Target};

use crate::error::{CallError, Result};
use crate::value::{Kwargs, Value};

/// Decoded `CALL_FUNCTION` request.
#[derive(Debug, Clone, PartialEq)]
pub struct CallRequest {
    pub chain_id: Option<String>,
    pub target: Target,
    pub args: Vec<Value>,
    pub kwargs: Kwargs,
}

fn opt_str(value: Option<&str>) -> Value {
    value.map(Value::from).unwrap_or(Value::None)
}

impl CallRequest {
    pub fn to_value(&self) -> Value {
        Value::tuple(vec![
            opt_str(self.chain_id.as_deref()),
            Value::from(self.target.module.as_str()),
            opt_str(self.target.class.as_deref()),
            Value::from(self.target.function.as_str()),
            Value::List(self.args.clone()),
            Value::Kwargs(self.kwargs.clone()),
        ])
    }

    /// Structural check of an inbound request.
    pub fn from_value(value: Value) -> std::result::Result<Self, CallError> {
        let bad = || CallError::new("StreamError", "bad input: malformed CALL_FUNCTION request");
        let Value::Tuple(items) = value else {
            return Err(bad());
        };
        let [chain_id, module, class, function, args, kwargs]: [Value; 6] =
            items.try_into().map_err(|_| bad())?;

        let optional = |v: Value| -> std::result::Result<Option<String>, CallError> {
            match v {
                Value::None => Ok(None),
                Value::Str(s) => Ok(Some(s)),
                _ => Err(bad()),
            }
        };
        let chain_id = optional(chain_id)?;
        let class = optional(class)?;
        let (Value::Str(module), Value::Str(function)) = (module, function) else {
            return Err(bad());
        };
        let args = match args {
            Value::List(args) | Value::Tuple(args) => args,
            _ => return Err(bad()),
        };
        let kwargs = match kwargs {
            Value::Kwargs(kwargs) => kwargs,
            Value::Dict(map) => Kwargs::from(map),
            Value::None => Kwargs::new(),
            _ => return Err(bad()),
        };
        Ok(Self {
            chain_id,
            target: Target {
                module,
                class,
                function,
            },
            args,
            kwargs,
        })
    }

    pub(crate) fn encode(&self) -> Result<crate::message::Message> {
        Ok(crate::message::Message::pickled(&self.to_value())?.with_handle(crate::message::CALL_FUNCTION))
    }
}
