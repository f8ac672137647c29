//! Named functions callable through `CALL_FUNCTION`.

use crate::context::Context;
use crate::error::{CallError, Result, TetherError};
use crate::router::Router;
use crate::value::{Kwargs, Value};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// What a registered function returns.
pub type CallResult = std::result::Result<Value, CallError>;

/// A registered function.
pub type Function = Arc<dyn Fn(&Invocation) -> CallResult + Send + Sync>;

/// Address of a function: `module[.Class].function`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    pub module: String,
    pub class: Option<String>,
    pub function: String,
}

impl Target {
    pub fn new(module: impl Into<String>, function: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            class: None,
            function: function.into(),
        }
    }

    pub fn method(
        module: impl Into<String>,
        class: impl Into<String>,
        function: impl Into<String>,
    ) -> Self {
        Self {
            module: module.into(),
            class: Some(class.into()),
            function: function.into(),
        }
    }

    /// Registry key.
    pub fn key(&self) -> String {
        match &self.class {
            Some(class) => format!("{}.{}.{}", self.module, class, self.function),
            None => format!("{}.{}", self.module, self.function),
        }
    }
}

/// Split at the last dot: everything before it is the module.
impl From<&str> for Target {
    fn from(path: &str) -> Self {
        match path.rsplit_once('.') {
            Some((module, function)) => Target::new(module, function),
            None => Target::new("", path),
        }
    }
}

impl From<String> for Target {
    fn from(path: String) -> Self {
        Target::from(path.as_str())
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// One call as seen by the function being called.
pub struct Invocation {
    pub target: Target,
    pub args: Vec<Value>,
    pub kwargs: Kwargs,
    pub chain_id: Option<String>,
    caller_id: u32,
    router: Router,
}

impl Invocation {
    pub(crate) fn new(
        router: Router,
        caller_id: u32,
        target: Target,
        args: Vec<Value>,
        kwargs: Kwargs,
        chain_id: Option<String>,
    ) -> Self {
        Self {
            target,
            args,
            kwargs,
            chain_id,
            caller_id,
            router,
        }
    }

    /// Router of the context running the call.
    pub fn router(&self) -> &Router {
        &self.router
    }

    /// The context that sent the call.
    pub fn caller(&self) -> Context {
        self.router.context_by_id(self.caller_id)
    }

    pub fn arg(&self, index: usize) -> std::result::Result<&Value, CallError> {
        self.args.get(index).ok_or_else(|| {
            CallError::new(
                "TypeError",
                format!("{}() missing positional argument {}", self.target, index),
            )
        })
    }

    pub fn arg_i64(&self, index: usize) -> std::result::Result<i64, CallError> {
        let value = self.arg(index)?;
        value.as_i64().ok_or_else(|| {
            CallError::new(
                "TypeError",
                format!("{}() argument {} must be int, not {}", self.target, index, value.kind()),
            )
        })
    }

    pub fn arg_str(&self, index: usize) -> std::result::Result<&str, CallError> {
        let value = self.arg(index)?;
        value.as_str().ok_or_else(|| {
            CallError::new(
                "TypeError",
                format!("{}() argument {} must be str, not {}", self.target, index, value.kind()),
            )
        })
    }

    pub fn kwarg(&self, name: &str) -> Option<&Value> {
        self.kwargs.get(name)
    }
}

impl fmt::Debug for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({:?}, {:?})", self.target, self.args, self.kwargs)
    }
}

/// Map from `module[.Class].function` keys to functions. Clones share the
/// same table.
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    functions: Arc<RwLock<HashMap<String, Function>>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `func` under `key`, replacing any previous entry.
    pub fn register<F>(&self, key: impl Into<String>, func: F)
    where
        F: Fn(&Invocation) -> CallResult + Send + Sync + 'static,
    {
        self.functions.write().insert(key.into(), Arc::new(func));
    }

    pub fn unregister(&self, key: &str) -> bool {
        self.functions.write().remove(key).is_some()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.functions.read().contains_key(key)
    }

    pub fn get(&self, target: &Target) -> Result<Function> {
        self.functions
            .read()
            .get(&target.key())
            .cloned()
            .ok_or_else(|| TetherError::UnknownTarget(target.key()))
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.functions.read().keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_from_path() {
        let target = Target::from("example.math.add");
        assert_eq!(target.module, "example.math");
        assert_eq!(target.function, "add");
        assert_eq!(target.key(), "example.math.add");
        assert_eq!(Target::method("m", "C", "f").key(), "m.C.f");
    }

    #[test]
    fn test_unknown_target_is_typed() {
        let registry = FunctionRegistry::new();
        let err = registry.get(&Target::from("nope.missing")).err().unwrap();
        assert!(matches!(err, TetherError::UnknownTarget(ref key) if key == "nope.missing"));
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = FunctionRegistry::new();
        registry.register("example.one", |_| Ok(Value::Int(1)));
        assert!(registry.contains("example.one"));
        assert!(registry.get(&"example.one".into()).is_ok());
        assert_eq!(registry.keys(), vec!["example.one".to_string()]);
        assert!(registry.unregister("example.one"));
        assert!(!registry.contains("example.one"));
    }
}
