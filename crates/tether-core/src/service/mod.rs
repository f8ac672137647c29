//! Services: named method tables served by a shared worker [`Pool`].
//!
//! A `CALL_SERVICE` payload is `(service_name, method_name, kwargs)`. Every
//! method declares which callers may invoke it, which keyword arguments it
//! requires and whether it replies. A method with no policy is unreachable.
//!
//! # Thread Safety
//!
//! Services are shared by every pool worker. The [`Invoker`] chosen by
//! [`Service::invoker_kind`] decides whether calls may overlap.

mod invoker;
mod pool;

pub use invoker::InvokerKind;
pub(crate) use invoker::Invoker;
pub use pool::Pool;

use crate::context::Context;
use crate::error::{CallError, Result, TetherError};
use crate::message::Message;
use crate::router::{has_parent_authority, Router};
use crate::rpc::CallResult;
use crate::select::Select;
use crate::value::{Kwargs, Value, ValueKind};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Who may call a service method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServicePolicy {
    AllowAny,
    /// This context or one of its ancestors.
    AllowParents,
}

impl ServicePolicy {
    pub fn is_authorized(&self, router: &Router, msg: &Message) -> bool {
        match self {
            ServicePolicy::AllowAny => true,
            ServicePolicy::AllowParents => {
                has_parent_authority(msg.auth_id, router.context_id(), router.parent_ids())
            }
        }
    }
}

/// Declaration of one callable method.
#[derive(Debug, Clone)]
pub struct MethodSpec {
    pub name: String,
    pub policies: Vec<ServicePolicy>,
    /// Required keyword arguments and their kinds.
    pub arg_spec: Vec<(String, ValueKind)>,
    /// The method answers explicitly, if at all.
    pub no_reply: bool,
}

impl MethodSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            policies: Vec::new(),
            arg_spec: Vec::new(),
            no_reply: false,
        }
    }

    pub fn expose(mut self, policy: ServicePolicy) -> Self {
        self.policies.push(policy);
        self
    }

    pub fn arg(mut self, name: impl Into<String>, kind: ValueKind) -> Self {
        self.arg_spec.push((name.into(), kind));
        self
    }

    pub fn no_reply(mut self) -> Self {
        self.no_reply = true;
        self
    }
}

/// Check that every required argument is present with the declared kind.
pub fn validate_arg_spec(spec: &[(String, ValueKind)], kwargs: &Kwargs) -> std::result::Result<(), CallError> {
    for (name, kind) in spec {
        let Some(value) = kwargs.get(name) else {
            return Err(CallError::msg(format!("Required argument {:?} missing.", name)));
        };
        if !kind.matches(value) {
            return Err(CallError::msg(format!(
                "Argument {:?} type incorrect, got {}, expected {}",
                name,
                value.kind(),
                kind
            )));
        }
    }
    Ok(())
}

/// One inbound service call.
#[derive(Clone)]
pub struct ServiceCall {
    router: Router,
    msg: Message,
}

impl ServiceCall {
    pub(crate) fn new(router: Router, msg: Message) -> Self {
        Self { router, msg }
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn message(&self) -> &Message {
        &self.msg
    }

    pub fn caller(&self) -> Context {
        self.router.context_by_id(self.msg.src_id)
    }

    /// Answer the caller, if it asked for an answer.
    pub fn reply(&self, value: &Value) -> Result<()> {
        if self.msg.wants_reply() {
            self.router.route(self.msg.reply(value)?);
        }
        Ok(())
    }

    pub(crate) fn reply_result(&self, result: &CallResult) -> Result<()> {
        match result {
            Ok(value) => self.reply(value),
            Err(err) => self.reply(&Value::CallError(err.clone())),
        }
    }

    pub(crate) fn reply_dead(&self) {
        if self.msg.wants_reply() {
            self.router.route(self.msg.reply_dead(None));
        }
    }
}

impl fmt::Debug for ServiceCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ServiceCall({:?})", self.msg)
    }
}

/// A named collection of methods.
pub trait Service: Send + Sync + 'static {
    /// Name callers address the service by.
    fn name(&self) -> &str;

    fn methods(&self) -> Vec<MethodSpec>;

    /// Run `method`. For `no_reply` methods the return value is discarded.
    fn dispatch(&self, method: &str, kwargs: Kwargs, call: &ServiceCall) -> CallResult;

    fn invoker_kind(&self) -> InvokerKind {
        InvokerKind::Default
    }

    /// Key under which deduplicated calls are merged.
    fn dedup_key(&self, method: &str, kwargs: &Kwargs) -> String {
        format!("{}{:?}", method, kwargs)
    }

    /// Extra receivers the pool should watch for this service.
    fn select(&self) -> Option<Select> {
        None
    }

    /// A message arrived on one of [`Service::select`]'s members.
    fn on_message(&self, _msg: Message) {}

    /// The pool's last worker has exited.
    fn on_shutdown(&self) {}
}

/// Builds a service for a router on first use.
pub type ServiceFactory = Arc<dyn Fn(&Router) -> Result<Arc<dyn Service>> + Send + Sync>;

/// Services that may be activated on demand, by name. Clones share the same
/// table.
#[derive(Clone, Default)]
pub struct ServiceRegistry {
    factories: Arc<RwLock<HashMap<String, ServiceFactory>>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, name: impl Into<String>, factory: F)
    where
        F: Fn(&Router) -> Result<Arc<dyn Service>> + Send + Sync + 'static,
    {
        self.factories.write().insert(name.into(), Arc::new(factory));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.read().contains_key(name)
    }

    pub(crate) fn create(&self, name: &str, router: &Router) -> Result<Arc<dyn Service>> {
        let factory = self
            .factories
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| TetherError::Service(format!("no such service: {:?}", name)))?;
        factory(router)
    }
}

impl fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<String> = self.factories.read().keys().cloned().collect();
        names.sort();
        f.debug_set().entries(names).finish()
    }
}

/// Builds services on demand for privileged callers.
#[derive(Debug, Default, Clone, Copy)]
pub struct Activator;

impl Activator {
    pub fn is_permitted(&self, router: &Router, msg: &Message) -> bool {
        has_parent_authority(msg.auth_id, router.context_id(), router.parent_ids())
    }

    /// Construct `name` from the router's service registry. Without a
    /// message the request is trusted.
    pub fn activate(
        &self,
        router: &Router,
        name: &str,
        msg: Option<&Message>,
    ) -> std::result::Result<Arc<dyn Service>, CallError> {
        if let Some(msg) = msg {
            if !self.is_permitted(router, msg) {
                return Err(CallError::msg(format!(
                    "Service {:?} is not yet activated in this context, and the caller \
                     is not privileged, therefore autoactivation is disabled.",
                    name
                )));
            }
        }
        router
            .services()
            .create(name, router)
            .map_err(CallError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arg_spec_reports_missing_and_mistyped() {
        let spec = vec![("path".to_string(), ValueKind::Str)];
        let err = validate_arg_spec(&spec, &Kwargs::new()).unwrap_err();
        assert_eq!(err.message, "Required argument \"path\" missing.");

        let err = validate_arg_spec(&spec, &Kwargs::new().with("path", 3)).unwrap_err();
        assert!(err.message.starts_with("Argument \"path\" type incorrect"));

        assert!(validate_arg_spec(&spec, &Kwargs::new().with("path", "/tmp")).is_ok());
    }

    #[test]
    fn test_method_spec_builder() {
        let spec = MethodSpec::new("get")
            .expose(ServicePolicy::AllowParents)
            .arg("key", ValueKind::Str)
            .no_reply();
        assert_eq!(spec.policies, vec![ServicePolicy::AllowParents]);
        assert_eq!(spec.arg_spec.len(), 1);
        assert!(spec.no_reply);
    }
}
