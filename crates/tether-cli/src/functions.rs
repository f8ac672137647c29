//! Functions and services a `tether` child serves.

use tether_core::{
    CallError, CallResult, FunctionRegistry, InvokerKind, Kwargs, MethodSpec, Service,
    ServiceCall, ServicePolicy, ServiceRegistry, Value, ValueKind,
};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

pub fn registry() -> FunctionRegistry {
    let registry = FunctionRegistry::new();
    registry.register("example.add", |call| {
        Ok(Value::Int(call.arg_i64(0)? + call.arg_i64(1)?))
    });
    registry.register("example.echo", |call| Ok(Value::List(call.args.clone())));
    registry.register("example.fail", |_| Err(CallError::new("ValueError", "boom")));
    registry.register("example.pid", |_| Ok(Value::from(std::process::id())));
    registry.register("example.print", |call| {
        println!("{}", call.arg_str(0)?);
        Ok(Value::None)
    });
    registry
}

pub fn services() -> ServiceRegistry {
    let services = ServiceRegistry::new();
    services.register(Counter::NAME, |_| Ok(Arc::new(Counter::default()) as Arc<dyn Service>));
    services
}

/// Named counters, updated one call at a time.
#[derive(Default)]
pub struct Counter {
    counts: Mutex<BTreeMap<String, i64>>,
}

impl Counter {
    pub const NAME: &'static str = "example.counter";
}

impl Service for Counter {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn methods(&self) -> Vec<MethodSpec> {
        vec![
            MethodSpec::new("incr")
                .expose(ServicePolicy::AllowParents)
                .arg("key", ValueKind::Str),
            MethodSpec::new("get")
                .expose(ServicePolicy::AllowAny)
                .arg("key", ValueKind::Str),
        ]
    }

    fn invoker_kind(&self) -> InvokerKind {
        InvokerKind::Serialized
    }

    fn dispatch(&self, method: &str, kwargs: Kwargs, _call: &ServiceCall) -> CallResult {
        let key = kwargs
            .get("key")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let mut counts = self.counts.lock();
        match method {
            "incr" => {
                let count = counts.entry(key).or_insert(0);
                *count += 1;
                Ok(Value::Int(*count))
            }
            "get" => Ok(Value::Int(counts.get(&key).copied().unwrap_or(0))),
            other => Err(CallError::msg(format!("No such method: {:?}", other))),
        }
    }
}
