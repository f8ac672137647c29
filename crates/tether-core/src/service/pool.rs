//! Worker threads shared by every service of a context.

use super::{Activator, Invoker, Service, ServiceCall};
use crate::config::PoolConfig;
use crate::error::{CallError, Result, TetherError};
use crate::message::{Message, CALL_SERVICE};
use crate::receiver::{Receiver, ReceiverOptions};
use crate::router::Router;
use crate::select::{Member, Select};
use crate::value::{Kwargs, Value};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

struct PoolInner {
    router: Router,
    activator: Activator,
    receiver: Receiver,
    select: Select,
    /// Also serializes service construction.
    invokers: Mutex<HashMap<String, Arc<Invoker>>>,
    /// Services that brought their own receivers.
    watched: Mutex<Vec<(Member, Arc<dyn Service>)>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

/// N worker threads consuming `CALL_SERVICE` plus every service's own
/// receivers through one [`Select`]. Cheap to clone.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    pub fn new(router: &Router, services: Vec<Arc<dyn Service>>, size: usize) -> Result<Self> {
        let receiver = Receiver::new(
            router,
            ReceiverOptions::default()
                .handle(CALL_SERVICE)
                .overwrite(true),
        );
        let select = Select::new(false);
        select.add(receiver.clone())?;
        let pool = Self {
            inner: Arc::new(PoolInner {
                router: router.clone(),
                activator: Activator,
                receiver,
                select,
                invokers: Mutex::new(HashMap::new()),
                watched: Mutex::new(Vec::new()),
                threads: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            }),
        };
        for service in services {
            pool.add(service)?;
        }

        let mut threads = Vec::with_capacity(size);
        for index in 0..size.max(1) {
            let worker = pool.clone();
            let handle = thread::Builder::new()
                .name(format!("{}-{}", PoolConfig::THREAD_PREFIX, index))
                .spawn(move || worker.worker_main())?;
            threads.push(handle);
        }
        *pool.inner.threads.lock() = threads;
        debug!("{:?}: initialized", pool);
        Ok(pool)
    }

    /// The context's pool, created with the default size on first use.
    pub fn get_or_create(router: &Router) -> Result<Self> {
        let mut slot = router.pool_slot().lock();
        if let Some(pool) = slot.as_ref() {
            return Ok(pool.clone());
        }
        let pool = Pool::new(router, Vec::new(), PoolConfig::DEFAULT_POOL_SIZE)?;
        *slot = Some(pool.clone());
        drop(slot);

        let owner = router.clone();
        router.broker().on_exit(move || {
            let pool = owner.pool_slot().lock().take();
            if let Some(pool) = pool {
                if let Err(e) = pool.stop(false) {
                    warn!("{:?}: stop failed: {}", pool, e);
                }
            }
        });
        Ok(pool)
    }

    pub fn size(&self) -> usize {
        self.inner.threads.lock().len()
    }

    pub fn router(&self) -> &Router {
        &self.inner.router
    }

    pub(crate) fn receiver(&self) -> &Receiver {
        &self.inner.receiver
    }

    pub fn add(&self, service: Arc<dyn Service>) -> Result<()> {
        let mut invokers = self.inner.invokers.lock();
        self.add_locked(&mut invokers, service).map(|_| ())
    }

    fn add_locked(
        &self,
        invokers: &mut HashMap<String, Arc<Invoker>>,
        service: Arc<dyn Service>,
    ) -> Result<Arc<Invoker>> {
        let name = service.name().to_string();
        if invokers.contains_key(&name) {
            return Err(TetherError::Service(format!(
                "service named {:?} already registered",
                name
            )));
        }
        if let Some(select) = service.select() {
            let member = Member::Select(select.clone());
            self.inner.select.add(select)?;
            self.inner.watched.lock().push((member, service.clone()));
        }
        let invoker = Arc::new(Invoker::new(service));
        invokers.insert(name, invoker.clone());
        Ok(invoker)
    }

    fn get_invoker(&self, name: &str, msg: Option<&Message>) -> std::result::Result<Arc<Invoker>, CallError> {
        let mut invokers = self.inner.invokers.lock();
        if let Some(invoker) = invokers.get(name) {
            return Ok(invoker.clone());
        }
        let service = self.inner.activator.activate(&self.inner.router, name, msg)?;
        self.add_locked(&mut invokers, service).map_err(CallError::from)
    }

    /// The named service, activating it if needed.
    pub fn get_service(&self, name: &str) -> Result<Arc<dyn Service>> {
        Ok(self.get_invoker(name, None)?.service().clone())
    }

    /// Stop the workers. With `join`, wait for them and run every service's
    /// shutdown hook.
    pub fn stop(&self, join: bool) -> Result<()> {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.select.close();
        if join {
            self.join()?;
        }
        Ok(())
    }

    pub fn join(&self) -> Result<()> {
        let threads = std::mem::take(&mut *self.inner.threads.lock());
        for handle in threads {
            if handle.join().is_err() {
                error!("{:?}: worker panicked", self);
            }
        }
        let invokers: Vec<Arc<Invoker>> = self.inner.invokers.lock().values().cloned().collect();
        for invoker in invokers {
            invoker.service().on_shutdown();
        }
        Ok(())
    }

    fn parse(msg: &Message) -> std::result::Result<(String, String, Kwargs), CallError> {
        let invalid = || CallError::msg("Invalid message format.");
        let Ok(Value::Tuple(items)) = msg.unpickle(false) else {
            return Err(invalid());
        };
        let [service, method, kwargs]: [Value; 3] = items.try_into().map_err(|_| invalid())?;
        match (service, method, kwargs) {
            (Value::Str(service), Value::Str(method), Value::Kwargs(kwargs)) => {
                Ok((service, method, kwargs))
            }
            (Value::Str(service), Value::Str(method), Value::Dict(map)) => {
                Ok((service, method, Kwargs::from(map)))
            }
            _ => Err(invalid()),
        }
    }

    fn on_service_call(&self, msg: Message) {
        let call = ServiceCall::new(self.inner.router.clone(), msg.clone());
        let mut target = None;
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            let (service, method, kwargs) = Self::parse(&msg)?;
            target = Some((service.clone(), method.clone()));
            let invoker = self.get_invoker(&service, Some(&msg))?;
            invoker.invoke(&method, kwargs, call.clone())
        }));
        let err = match outcome {
            Ok(Ok(())) => return,
            Ok(Err(err)) => {
                warn!("{:?}: call error: {:?}: {}", self, msg, err);
                err
            }
            Err(_) => {
                let (service, method) = target.unwrap_or_default();
                error!("{:?}: while invoking {:?} of {:?}: panicked", self, method, service);
                CallError::new("PanicError", format!("{}.{} panicked", service, method))
            }
        };
        if let Err(e) = call.reply(&Value::CallError(err)) {
            error!("{:?}: cannot reply to {:?}: {}", self, msg, e);
        }
    }

    fn worker_run(&self) {
        let own = Member::Receiver(self.inner.receiver.clone());
        while !self.inner.closed.load(Ordering::Acquire) {
            let event = match self.inner.select.get(None) {
                Ok(event) => event,
                Err(e) => {
                    info!("{:?}: channel or latch closed, exiting: {}", self, e);
                    return;
                }
            };
            if event.source == own {
                self.on_service_call(event.message);
                continue;
            }
            let service = self
                .inner
                .watched
                .lock()
                .iter()
                .find(|(member, _)| *member == event.source)
                .map(|(_, service)| service.clone());
            match service {
                Some(service) => {
                    let name = service.name().to_string();
                    let message = event.message;
                    if catch_unwind(AssertUnwindSafe(|| service.on_message(message))).is_err() {
                        error!("{:?}: {}.on_message() panicked", self, name);
                    }
                }
                None => warn!("{:?}: message from unknown member {:?}", self, event.source),
            }
        }
    }

    fn worker_main(&self) {
        self.worker_run();
        debug!("{:?}: worker {:?} exiting", self, thread::current().name());
    }
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Pool(context={}, size={})",
            self.inner.router.context_id(),
            self.inner.threads.try_lock().map(|t| t.len()).unwrap_or(0)
        )
    }
}
