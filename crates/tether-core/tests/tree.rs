//! Parent/child trees running in one process over real socket pairs.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tether_core::{
    CallError, CallResult, ConnectOptions, Context, InProcessConnector, InvokerKind, Kwargs,
    Message, MethodSpec, Receiver, ReceiverOptions, Router, RouterBuilder, Service, ServiceCall,
    ServicePolicy, ServiceRegistry, TetherError, Value, ValueKind,
};

fn master() -> Router {
    let router = RouterBuilder::new()
        .shutdown_timeout(Duration::from_secs(2))
        .build()
        .unwrap();
    router.registry().register("demo.add", |call| {
        Ok(Value::Int(call.arg_i64(0)? + call.arg_i64(1)?))
    });
    router
        .registry()
        .register("demo.fail", |_| Err(CallError::new("ValueError", "boom")));
    router
        .registry()
        .register("demo.echo", |call| Ok(Value::List(call.args.clone())));
    router
}

fn spawn_child(router: &Router) -> Context {
    router
        .connect(
            &InProcessConnector::for_router(router),
            ConnectOptions::default().setup_stdio(false),
        )
        .unwrap()
}

fn stop(router: &Router) {
    router.shutdown();
    router.join().unwrap();
}

#[test]
fn test_call_into_child() {
    let router = master();
    let child = spawn_child(&router);
    assert_eq!(child.id(), 1);
    assert_eq!(child.name().as_deref(), Some("in_process.1"));

    let sum = child
        .call("demo.add", vec![Value::from(2), Value::from(3)], Kwargs::new())
        .unwrap();
    assert_eq!(sum, Value::Int(5));

    match child.call("demo.fail", Vec::new(), Kwargs::new()) {
        Err(TetherError::Call(e)) => {
            assert_eq!(e.kind, "ValueError");
            assert_eq!(e.message, "boom");
        }
        other => panic!("expected call error, got {:?}", other),
    }
    match child.call("demo.missing", Vec::new(), Kwargs::new()) {
        Err(TetherError::Call(_)) => {}
        other => panic!("expected call error, got {:?}", other),
    }
    stop(&router);
}

#[test]
fn test_grandchild_through_proxy_connect() {
    let router = master();
    let child = spawn_child(&router);
    let grandchild = router
        .proxy_connect_with(
            &child,
            "in_process",
            ConnectOptions::default().setup_stdio(false),
        )
        .unwrap();

    assert_ne!(grandchild.id(), child.id());
    assert_eq!(grandchild.via().map(|v| v.id()), Some(child.id()));
    assert!(grandchild
        .name()
        .unwrap()
        .starts_with("in_process.1.in_process."));
    assert_eq!(router.route_via(grandchild.id()).unwrap(), Some(child.id()));

    let echoed = grandchild
        .call("demo.echo", vec![Value::from("hi")], Kwargs::new())
        .unwrap();
    assert_eq!(echoed, Value::List(vec![Value::from("hi")]));
    stop(&router);
}

#[test]
fn test_pipelined_chain_stops_after_failure() {
    let router = master();
    let runs = Arc::new(AtomicUsize::new(0));
    let counter = runs.clone();
    router.registry().register("demo.count", move |_| {
        Ok(Value::from(counter.fetch_add(1, Ordering::SeqCst) as i64 + 1))
    });
    let child = spawn_child(&router);

    let chain = child.pipelined_call_chain();
    chain.call_no_reply("demo.fail", Vec::new(), Kwargs::new()).unwrap();
    chain.call_no_reply("demo.count", Vec::new(), Kwargs::new()).unwrap();
    match chain.call("demo.count", Vec::new(), Kwargs::new()) {
        Err(TetherError::Call(e)) => assert_eq!(e.message, "boom"),
        other => panic!("expected the first failure, got {:?}", other),
    }
    assert_eq!(runs.load(Ordering::SeqCst), 0);

    chain.reset().unwrap();
    assert_eq!(
        chain.call("demo.count", Vec::new(), Kwargs::new()).unwrap(),
        Value::Int(1)
    );
    stop(&router);
}

#[test]
fn test_dead_reply_is_not_a_timeout() {
    let router = master();
    let child = spawn_child(&router);

    let err = child
        .send_await(Message::new(4242, Vec::new()), Some(Duration::from_secs(5)))
        .unwrap_err();
    assert!(err.is_disconnect(), "{:?}", err);
    assert!(!err.is_timeout());

    let idle = Receiver::new(&router, ReceiverOptions::default());
    let err = idle.get(Some(Duration::from_millis(50))).unwrap_err();
    assert!(err.is_timeout(), "{:?}", err);
    stop(&router);
}

#[test]
fn test_child_shutdown_withdraws_route() {
    let router = master();
    let child = spawn_child(&router);
    assert_eq!(router.route_via(child.id()).unwrap(), Some(child.id()));

    child.shutdown(true).unwrap();
    assert!(child.is_disconnected());
    assert_eq!(router.route_via(child.id()).unwrap(), None);

    let err = child
        .call("demo.add", vec![Value::from(1), Value::from(1)], Kwargs::new())
        .unwrap_err();
    assert!(err.is_disconnect(), "{:?}", err);
    stop(&router);
}

#[test]
fn test_oversized_message_refused_without_dropping_stream() {
    let router = RouterBuilder::new()
        .max_message_size(1024)
        .shutdown_timeout(Duration::from_secs(2))
        .build()
        .unwrap();
    router
        .registry()
        .register("demo.len", |call| Ok(Value::from(call.arg_str(0)?.len() as i64)));
    let child = spawn_child(&router);

    let big = "x".repeat(4096);
    let err = child
        .call("demo.len", vec![Value::from(big)], Kwargs::new())
        .unwrap_err();
    assert!(err.is_disconnect(), "{:?}", err);

    let small = child
        .call("demo.len", vec![Value::from("xyz")], Kwargs::new())
        .unwrap();
    assert_eq!(small, Value::Int(3));
    stop(&router);
}

struct SlowLookup {
    runs: Arc<AtomicUsize>,
}

impl Service for SlowLookup {
    fn name(&self) -> &str {
        "demo.lookup"
    }

    fn methods(&self) -> Vec<MethodSpec> {
        vec![MethodSpec::new("get")
            .expose(ServicePolicy::AllowParents)
            .arg("key", ValueKind::Str)]
    }

    fn invoker_kind(&self) -> InvokerKind {
        InvokerKind::Deduplicating
    }

    fn dispatch(&self, _method: &str, kwargs: Kwargs, _call: &ServiceCall) -> CallResult {
        self.runs.fetch_add(1, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(300));
        let key = kwargs.get("key").and_then(Value::as_str).unwrap_or_default();
        Ok(Value::from(format!("value of {}", key)))
    }
}

#[test]
fn test_service_in_child_deduplicates() {
    let runs = Arc::new(AtomicUsize::new(0));
    let services = ServiceRegistry::new();
    let shared = runs.clone();
    services.register("demo.lookup", move |_| {
        Ok(Arc::new(SlowLookup {
            runs: shared.clone(),
        }) as Arc<dyn Service>)
    });
    let router = RouterBuilder::new()
        .services(services)
        .shutdown_timeout(Duration::from_secs(2))
        .build()
        .unwrap();
    let child = spawn_child(&router);

    let callers: Vec<_> = (0..2)
        .map(|_| {
            let child = child.clone();
            thread::spawn(move || {
                child.call_service("demo.lookup", "get", Kwargs::new().with("key", "x"))
            })
        })
        .collect();
    for caller in callers {
        assert_eq!(caller.join().unwrap().unwrap(), Value::from("value of x"));
    }
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    let err = child
        .call_service("demo.lookup", "get", Kwargs::new())
        .unwrap_err();
    match err {
        TetherError::Call(e) => assert!(e.message.contains("missing"), "{}", e),
        other => panic!("expected call error, got {:?}", other),
    }
    stop(&router);
}
