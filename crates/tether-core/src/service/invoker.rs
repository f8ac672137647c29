//! How a pool runs one service's methods.

use super::{validate_arg_spec, MethodSpec, Service, ServiceCall};
use crate::error::CallError;
use crate::rpc::CallResult;
use crate::value::Kwargs;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{error, warn};

/// Concurrency discipline for a service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum InvokerKind {
    /// Calls run on whichever worker picked them up, possibly overlapping.
    #[default]
    Default,
    /// One call at a time, in arrival order.
    Serialized,
    /// Concurrent calls with the same key share one execution, and the
    /// result is cached for later callers.
    Deduplicating,
}

#[derive(Default)]
struct SerialQueue {
    queue: VecDeque<(String, Kwargs, ServiceCall)>,
    running: bool,
}

#[derive(Default)]
struct DedupState {
    responses: HashMap<String, CallResult>,
    waiters: HashMap<String, Vec<ServiceCall>>,
}

enum Discipline {
    Default,
    Serialized(Mutex<SerialQueue>),
    Deduplicating(Mutex<DedupState>),
}

pub(crate) struct Invoker {
    service: Arc<dyn Service>,
    methods: HashMap<String, MethodSpec>,
    discipline: Discipline,
}

fn panic_text(payload: Box<dyn std::any::Any + Send>) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

impl Invoker {
    pub(crate) fn new(service: Arc<dyn Service>) -> Self {
        let methods = service
            .methods()
            .into_iter()
            .map(|m| (m.name.clone(), m))
            .collect();
        let discipline = match service.invoker_kind() {
            InvokerKind::Default => Discipline::Default,
            InvokerKind::Serialized => Discipline::Serialized(Mutex::new(SerialQueue::default())),
            InvokerKind::Deduplicating => {
                Discipline::Deduplicating(Mutex::new(DedupState::default()))
            }
        };
        Self {
            service,
            methods,
            discipline,
        }
    }

    pub(crate) fn service(&self) -> &Arc<dyn Service> {
        &self.service
    }

    fn validate(
        &self,
        method: &str,
        kwargs: &Kwargs,
        call: &ServiceCall,
    ) -> Result<&MethodSpec, CallError> {
        let Some(spec) = self.methods.get(method) else {
            return Err(CallError::msg(format!("No such method: {:?}", method)));
        };
        if spec.policies.is_empty() {
            return Err(CallError::msg("Method has no policies set."));
        }
        let authorized = spec
            .policies
            .iter()
            .all(|p| p.is_authorized(call.router(), call.message()));
        if !authorized {
            return Err(CallError::msg(format!(
                "Caller is not authorized to invoke {:?} of service {:?}",
                method,
                self.service.name()
            )));
        }
        validate_arg_spec(&spec.arg_spec, kwargs)?;
        Ok(spec)
    }

    /// Validate, run and answer one call. Errors are for the caller to
    /// report; panics propagate.
    fn invoke_direct(&self, method: &str, kwargs: Kwargs, call: &ServiceCall) -> Result<(), CallError> {
        let spec = self.validate(method, &kwargs, call)?;
        let result = self.service.dispatch(method, kwargs, call);
        if spec.no_reply {
            if let Err(e) = result {
                error!(
                    "While calling no-reply method {}.{}: {}",
                    self.service.name(),
                    method,
                    e
                );
            }
            return Ok(());
        }
        call.reply(&result?).map_err(CallError::from)
    }

    pub(crate) fn invoke(&self, method: &str, kwargs: Kwargs, call: ServiceCall) -> Result<(), CallError> {
        match &self.discipline {
            Discipline::Default => self.invoke_direct(method, kwargs, &call),
            Discipline::Serialized(queue) => {
                let first = {
                    let mut queue = queue.lock();
                    queue.queue.push_back((method.to_string(), kwargs, call));
                    let first = !queue.running;
                    queue.running = true;
                    first
                };
                if first {
                    self.drain(queue);
                }
                Ok(())
            }
            Discipline::Deduplicating(state) => self.invoke_dedup(state, method, kwargs, call),
        }
    }

    fn drain(&self, queue: &Mutex<SerialQueue>) {
        loop {
            let next = {
                let mut queue = queue.lock();
                let next = queue.queue.pop_front();
                if next.is_none() {
                    queue.running = false;
                }
                next
            };
            let Some((method, kwargs, call)) = next else {
                return;
            };
            match catch_unwind(AssertUnwindSafe(|| self.invoke_direct(&method, kwargs, &call))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!("{:?}: call error: {:?}: {}", self, call, e);
                    if let Err(e) = call.reply(&e.into()) {
                        error!("{:?}: cannot reply to {:?}: {}", self, call, e);
                    }
                }
                Err(payload) => {
                    error!("{:?}: while invoking {}(): {}", self, method, panic_text(payload));
                    call.reply_dead();
                }
            }
        }
    }

    fn invoke_dedup(
        &self,
        state: &Mutex<DedupState>,
        method: &str,
        kwargs: Kwargs,
        call: ServiceCall,
    ) -> Result<(), CallError> {
        self.validate(method, &kwargs, &call)?;
        let key = self.service.dedup_key(method, &kwargs);
        {
            let mut state = state.lock();
            if let Some(response) = state.responses.get(&key) {
                return call.reply_result(response).map_err(CallError::from);
            }
            if let Some(waiters) = state.waiters.get_mut(&key) {
                waiters.push(call);
                return Ok(());
            }
            state.waiters.insert(key.clone(), vec![call.clone()]);
        }

        // This thread produces the response for every waiter.
        let response = catch_unwind(AssertUnwindSafe(|| self.service.dispatch(method, kwargs, &call)))
            .unwrap_or_else(|payload| Err(CallError::new("PanicError", panic_text(payload))));

        let mut state = state.lock();
        let waiters = state.waiters.remove(&key).unwrap_or_default();
        for waiter in &waiters {
            if let Err(e) = waiter.reply_result(&response) {
                error!("{:?}: cannot reply to {:?}: {}", self, waiter, e);
            }
        }
        state.responses.insert(key, response);
        Ok(())
    }
}

impl fmt::Debug for Invoker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.discipline {
            Discipline::Default => "Invoker",
            Discipline::Serialized(_) => "SerializedInvoker",
            Discipline::Deduplicating(_) => "DeduplicatingInvoker",
        };
        write!(f, "{}({})", kind, self.service.name())
    }
}
