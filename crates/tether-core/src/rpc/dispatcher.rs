//! Executes `CALL_FUNCTION` requests against a [`FunctionRegistry`].

use super::registry::{CallResult, FunctionRegistry, Invocation};
use super::CallRequest;
use crate::error::CallError;
use crate::message::{Message, CALL_FUNCTION};
use crate::receiver::{Receiver, ReceiverOptions};
use crate::router::{Policy, Router};
use crate::value::Value;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, error};

/// Built-in function that drops the error recorded for a chain.
pub const FORGET_CHAIN: &str = "tether.dispatcher.forget_chain";

type ChainErrors = Arc<Mutex<HashMap<String, CallError>>>;

/// Serves function calls addressed to this context.
///
/// Only this context and its ancestors may call in. The receiver closes when
/// the broker begins shutting down, which ends [`Dispatcher::run`].
pub struct Dispatcher {
    router: Router,
    recv: Receiver,
    errors: ChainErrors,
}

impl Dispatcher {
    pub fn new(router: &Router) -> Self {
        let errors: ChainErrors = Arc::new(Mutex::new(HashMap::new()));
        let forget = errors.clone();
        router.registry().register(FORGET_CHAIN, move |inv: &Invocation| {
            let chain_id = inv.arg_str(0)?;
            debug!("forgetting chain {}", chain_id);
            forget.lock().remove(chain_id);
            Ok(Value::None)
        });

        let recv = Receiver::new(
            router,
            ReceiverOptions::default()
                .handle(CALL_FUNCTION)
                .policy(Policy::ParentAuthority),
        );
        let closer = recv.clone();
        router.broker().on_shutdown(move || closer.close());

        Self {
            router: router.clone(),
            recv,
            errors,
        }
    }

    pub fn receiver(&self) -> &Receiver {
        &self.recv
    }

    fn registry(&self) -> &FunctionRegistry {
        self.router.registry()
    }

    fn execute(&self, msg: &Message) -> (Option<String>, CallResult) {
        let request = match msg
            .unpickle(true)
            .map_err(CallError::from)
            .and_then(CallRequest::from_value)
        {
            Ok(request) => request,
            Err(e) => return (None, Err(e)),
        };

        if let Some(chain_id) = &request.chain_id {
            if let Some(err) = self.errors.lock().get(chain_id) {
                debug!("chain {} already failed; skipping {}", chain_id, request.target);
                return (request.chain_id.clone(), Err(err.clone()));
            }
        }

        let func = match self.registry().get(&request.target) {
            Ok(func) => func,
            Err(e) => return (request.chain_id, Err(CallError::from(e))),
        };
        let chain_id = request.chain_id.clone();
        let invocation = Invocation::new(
            self.router.clone(),
            msg.src_id,
            request.target,
            request.args,
            request.kwargs,
            request.chain_id,
        );
        debug!("running {:?} for {}", invocation, msg.src_id);
        let result = catch_unwind(AssertUnwindSafe(|| func(&invocation)))
            .unwrap_or_else(|payload| Err(panic_error(&invocation, payload)));
        (chain_id, result)
    }

    /// Run one request, recording a failure against its chain.
    pub fn dispatch_one(&self, msg: &Message) -> (Option<String>, CallResult) {
        let (chain_id, result) = self.execute(msg);
        if let (Some(chain_id), Err(err)) = (&chain_id, &result) {
            self.errors
                .lock()
                .entry(chain_id.clone())
                .or_insert_with(|| err.clone());
        }
        (chain_id, result)
    }

    /// Serve requests until the receiver closes.
    pub fn run(&self) {
        debug!("dispatcher running on context {}", self.router.context_id());
        for msg in self.recv.iter() {
            let (chain_id, result) = self.dispatch_one(&msg);
            if msg.wants_reply() {
                let value = match result {
                    Ok(value) => value,
                    Err(err) => Value::CallError(err),
                };
                match msg.reply(&value) {
                    Ok(reply) => self.router.route(reply),
                    Err(e) => {
                        error!("cannot encode reply to {:?}: {}", msg, e);
                        self.router.route(msg.reply_dead(Some("reply could not be encoded")));
                    }
                }
            } else if let (Err(err), None) = (&result, &chain_id) {
                error!("No-reply function call failed: {}", err);
            }
        }
        debug!("dispatcher on context {} stopped", self.router.context_id());
    }
}

fn panic_error(invocation: &Invocation, payload: Box<dyn Any + Send>) -> CallError {
    let text = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    CallError::new("PanicError", format!("{} panicked: {}", invocation.target, text))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TetherError;
    use crate::router::RouterBuilder;
    use crate::value::Kwargs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    fn serve(router: &Router) -> thread::JoinHandle<()> {
        let dispatcher = Dispatcher::new(router);
        thread::spawn(move || dispatcher.run())
    }

    fn master() -> Router {
        RouterBuilder::new()
            .shutdown_timeout(Duration::from_millis(200))
            .build()
            .unwrap()
    }

    #[test]
    fn test_call_returns_value() {
        let router = master();
        router.registry().register("example.add", |inv: &Invocation| {
            Ok(Value::Int(inv.arg_i64(0)? + inv.arg_i64(1)?))
        });
        let worker = serve(&router);
        let got = router
            .myself()
            .call("example.add", vec![Value::Int(2), Value::Int(3)], Kwargs::new())
            .unwrap();
        assert_eq!(got, Value::Int(5));
        router.shutdown();
        router.join().unwrap();
        worker.join().unwrap();
    }

    #[test]
    fn test_unknown_target_and_panic_are_call_errors() {
        let router = master();
        router
            .registry()
            .register("example.explode", |_: &Invocation| panic!("kaboom"));
        let worker = serve(&router);
        let me = router.myself();

        let err = me.call("example.missing", vec![], Kwargs::new()).unwrap_err();
        assert!(matches!(err, TetherError::Call(ref e) if e.kind == "UnknownTargetError"));

        let err = me.call("example.explode", vec![], Kwargs::new()).unwrap_err();
        assert!(matches!(err, TetherError::Call(ref e) if e.message.contains("kaboom")));

        router.shutdown();
        router.join().unwrap();
        worker.join().unwrap();
    }

    #[test]
    fn test_pipelined_chain_short_circuits_until_reset() {
        let router = master();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        router.registry().register("example.count", move |_: &Invocation| {
            Ok(Value::Int(counter.fetch_add(1, Ordering::SeqCst) as i64 + 1))
        });
        router.registry().register("example.fail", |_: &Invocation| {
            Err(CallError::new("ValueError", "boom"))
        });
        let worker = serve(&router);

        let chain = router.myself().pipelined_call_chain();
        chain.call_no_reply("example.fail", vec![], Kwargs::new()).unwrap();
        chain.call_no_reply("example.count", vec![], Kwargs::new()).unwrap();
        chain.call_no_reply("example.count", vec![], Kwargs::new()).unwrap();
        let err = chain.call("example.count", vec![], Kwargs::new()).unwrap_err();
        assert!(matches!(err, TetherError::Call(ref e) if e.message == "boom"));
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        chain.reset().unwrap();
        let got = chain.call("example.count", vec![], Kwargs::new()).unwrap();
        assert_eq!(got, Value::Int(1));

        router.shutdown();
        router.join().unwrap();
        worker.join().unwrap();
    }

    #[test]
    fn test_unchained_failure_not_remembered() {
        let router = master();
        router.registry().register("example.fail", |_: &Invocation| {
            Err(CallError::new("ValueError", "boom"))
        });
        router
            .registry()
            .register("example.ok", |_: &Invocation| Ok(Value::Bool(true)));
        let worker = serve(&router);
        let me = router.myself();
        me.call_no_reply("example.fail", vec![], Kwargs::new()).unwrap();
        assert_eq!(me.call("example.ok", vec![], Kwargs::new()).unwrap(), Value::Bool(true));
        router.shutdown();
        router.join().unwrap();
        worker.join().unwrap();
    }
}
