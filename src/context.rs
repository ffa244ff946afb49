//! Execution contexts, and the registry that creates and tears them down.
//!
//! A [`Context`] owns one transport, its channel cache, subscriptions, pending
//! operations and PV cache. Transport events land on the context's queue and are
//! handed out by exactly one dispatcher at a time, so callbacks belonging to one
//! context never run concurrently. A preemptive context runs that dispatcher on its
//! own pump thread; a non-preemptive context only processes events while one of
//! its calls is waiting.

use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    fmt,
    sync::{
        Arc, Mutex, OnceLock, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread::{self, JoinHandle, ThreadId},
    time::{Duration, Instant},
};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, error, trace};

use crate::{
    channel::ChannelCache,
    config::ClientConfig,
    decode::DecodeMode,
    error::CaError,
    pv::Pv,
    subscription::{Subscription, SubscriptionManager},
    tracker::CompletionTracker,
    transport::{EventSender, Transport, TransportEvent},
};

thread_local! {
    static CURRENT: RefCell<Option<Context>> = const { RefCell::new(None) };
    static DISPATCHING: Cell<bool> = const { Cell::new(false) };
}

/// Blocking calls would deadlock the dispatcher if made from one of its callbacks
pub(crate) fn ensure_blocking_allowed(operation: &'static str) -> Result<(), CaError> {
    if DISPATCHING.with(Cell::get) {
        Err(CaError::InsideCallback { operation })
    } else {
        Ok(())
    }
}

pub(crate) struct ContextInner {
    id: u64,
    preemptive: bool,
    owner: ThreadId,
    registry: Weak<RegistryInner>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) config: ClientConfig,
    pub(crate) channels: ChannelCache,
    pub(crate) subscriptions: SubscriptionManager,
    pub(crate) tracker: CompletionTracker,
    pub(crate) pvs: Mutex<HashMap<(String, DecodeMode), Pv>>,
    pub(crate) camonitors: Mutex<HashMap<String, Subscription>>,
    pub(crate) events_tx: EventSender,
    events_rx: Mutex<mpsc::UnboundedReceiver<TransportEvent>>,
    cancel: CancellationToken,
    pump: Mutex<Option<JoinHandle<()>>>,
    destroyed: AtomicBool,
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Handle to one client execution scope
///
/// Cheap to clone; every clone refers to the same context.
#[derive(Clone)]
pub struct Context {
    pub(crate) inner: Arc<ContextInner>,
}

impl PartialEq for Context {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.inner.id)
            .field("preemptive", &self.inner.preemptive)
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

impl Context {
    fn new(
        id: u64,
        preemptive: bool,
        registry: Weak<RegistryInner>,
        config: ClientConfig,
        transport: Arc<dyn Transport>,
    ) -> Context {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let context = Context {
            inner: Arc::new(ContextInner {
                id,
                preemptive,
                owner: thread::current().id(),
                registry,
                transport,
                config,
                channels: ChannelCache::default(),
                subscriptions: SubscriptionManager::default(),
                tracker: CompletionTracker::default(),
                pvs: Mutex::new(HashMap::new()),
                camonitors: Mutex::new(HashMap::new()),
                events_tx,
                events_rx: Mutex::new(events_rx),
                cancel: CancellationToken::new(),
                pump: Mutex::new(None),
                destroyed: AtomicBool::new(false),
            }),
        };
        if preemptive {
            context.start_pump();
        }
        context
    }

    pub(crate) fn from_weak(weak: &Weak<ContextInner>) -> Result<Context, CaError> {
        let inner = weak.upgrade().ok_or(CaError::ContextDestroyed)?;
        let context = Context { inner };
        context.ensure_alive()?;
        Ok(context)
    }

    pub(crate) fn downgrade(&self) -> Weak<ContextInner> {
        Arc::downgrade(&self.inner)
    }

    fn start_pump(&self) {
        let weak = self.downgrade();
        let cancel = self.inner.cancel.clone();
        let slice = self.inner.config.poll_interval;
        let spawned = thread::Builder::new()
            .name(format!("ca-pump-{}", self.inner.id))
            .spawn(move || {
                while !cancel.is_cancelled() {
                    let Some(inner) = weak.upgrade() else {
                        break;
                    };
                    let context = Context { inner };
                    CURRENT.with(|c| *c.borrow_mut() = Some(context.clone()));
                    context.inner.transport.pend_event(slice);
                    context.dispatch_pending();
                    CURRENT.with(|c| c.borrow_mut().take());
                }
                trace!("Event pump exiting");
            });
        match spawned {
            Ok(handle) => *self.inner.pump.lock().unwrap() = Some(handle),
            Err(e) => error!("Could not start event pump for context {}: {e}", self.inner.id),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn is_preemptive(&self) -> bool {
        self.inner.preemptive
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub(crate) fn ensure_alive(&self) -> Result<(), CaError> {
        if self.is_destroyed() {
            Err(CaError::ContextDestroyed)
        } else {
            Ok(())
        }
    }

    /// Make this the current context of the calling thread
    ///
    /// A no-op if it already is. A non-preemptive context can only be attached by
    /// the thread that created it.
    pub fn attach(&self) -> Result<(), CaError> {
        self.ensure_alive()?;
        if CURRENT.with(|c| c.borrow().as_ref() == Some(self)) {
            return Ok(());
        }
        if !self.inner.preemptive && thread::current().id() != self.inner.owner {
            return Err(CaError::NotThreaded);
        }
        CURRENT.with(|c| *c.borrow_mut() = Some(self.clone()));
        trace!("Attached thread to context {}", self.inner.id);
        Ok(())
    }

    /// Destroy this context, through its registry if that still exists
    pub fn destroy(&self) {
        match self.inner.registry.upgrade() {
            Some(inner) => ContextRegistry { inner }.destroy(self),
            None => self.shutdown(),
        }
    }

    /// Process events for `timeout`
    ///
    /// Preemptive contexts process events on their pump thread, so for them this
    /// only waits.
    pub fn pend_event(&self, timeout: Duration) -> Result<(), CaError> {
        ensure_blocking_allowed("pend_event")?;
        self.ensure_alive()?;
        self.wait_until(timeout, || false);
        Ok(())
    }

    /// Handle everything already queued without waiting
    pub(crate) fn poll_nonblocking(&self) {
        if !self.inner.preemptive && !DISPATCHING.with(Cell::get) {
            self.inner.transport.pend_event(Duration::ZERO);
            self.dispatch_pending();
        }
    }

    fn poll(&self, slice: Duration) {
        if self.inner.preemptive {
            thread::sleep(slice);
        } else {
            self.inner.transport.pend_event(slice);
            self.dispatch_pending();
        }
    }

    /// Pump in bounded slices until `done` or the timeout passes
    ///
    /// Returns the final result of `done`.
    pub(crate) fn wait_until(&self, timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if done() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline || self.is_destroyed() {
                return done();
            }
            self.poll(self.inner.config.poll_interval.min(deadline - now));
        }
    }

    /// Drain the event queue, if no other thread is already doing so
    pub(crate) fn dispatch_pending(&self) -> usize {
        let Ok(mut events) = self.inner.events_rx.try_lock() else {
            return 0;
        };
        let mut handled = 0;
        while let Ok(event) = events.try_recv() {
            let was_dispatching = DISPATCHING.with(|d| d.replace(true));
            self.dispatch(event);
            DISPATCHING.with(|d| d.set(was_dispatching));
            handled += 1;
        }
        handled
    }

    fn dispatch(&self, event: TransportEvent) {
        trace!("Context {} dispatching {event:?}", self.inner.id);
        match event {
            TransportEvent::Connection { channel, connected } => {
                self.handle_connection(channel, connected)
            }
            TransportEvent::AccessRights { channel, access } => {
                self.handle_access_rights(channel, access)
            }
            TransportEvent::ReadComplete { ioid, result } => self.handle_read(ioid, result),
            TransportEvent::WriteComplete { ioid, status } => self.handle_write(ioid, status),
            TransportEvent::Monitor { monitor, result } => self.handle_monitor(monitor, result),
        }
    }

    /// Release everything this context owns. Safe to call more than once.
    fn shutdown(&self) {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _span = debug_span!("destroy_context", id = self.inner.id).entered();
        let pvs: Vec<Pv> = self
            .inner
            .pvs
            .lock()
            .unwrap()
            .drain()
            .map(|(_, pv)| pv)
            .collect();
        for pv in pvs {
            pv.release();
        }
        let monitors: Vec<Subscription> = self
            .inner
            .camonitors
            .lock()
            .unwrap()
            .drain()
            .map(|(_, sub)| sub)
            .collect();
        for monitor in monitors {
            monitor.unsubscribe();
        }
        for name in self.channel_names() {
            self.close_channel(&name);
        }
        self.inner.cancel.cancel();
        let pump = self.inner.pump.lock().unwrap().take();
        if let Some(handle) = pump
            && handle.thread().id() != thread::current().id()
        {
            let _ = handle.join();
        }
        debug!("Context destroyed");
    }
}

pub(crate) struct RegistryInner {
    config: ClientConfig,
    factory: Box<dyn Fn() -> Arc<dyn Transport> + Send + Sync>,
    contexts: Mutex<HashMap<u64, Context>>,
    initial: Mutex<Option<Context>>,
    next_id: AtomicU64,
}

static GLOBAL: OnceLock<ContextRegistry> = OnceLock::new();

/// Process scoped set of contexts sharing one configuration and transport factory
///
/// Tests build isolated registries with [`ContextRegistry::new`]; an application
/// installs one with [`ContextRegistry::install_global`] for the free-function
/// convenience calls in [`crate::ca`].
#[derive(Clone)]
pub struct ContextRegistry {
    inner: Arc<RegistryInner>,
}

impl ContextRegistry {
    /// Build a registry. `factory` is called once for every new context.
    pub fn new<F>(config: ClientConfig, factory: F) -> Self
    where
        F: Fn() -> Arc<dyn Transport> + Send + Sync + 'static,
    {
        ContextRegistry {
            inner: Arc::new(RegistryInner {
                config,
                factory: Box::new(factory),
                contexts: Mutex::new(HashMap::new()),
                initial: Mutex::new(None),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Make this the process-wide registry. Fails if one is already installed.
    pub fn install_global(self) -> Result<&'static ContextRegistry, CaError> {
        let mut installed = false;
        let registry = GLOBAL.get_or_init(|| {
            installed = true;
            self
        });
        if installed {
            Ok(registry)
        } else {
            Err(CaError::AlreadyInitialized)
        }
    }

    pub fn global() -> Option<&'static ContextRegistry> {
        GLOBAL.get()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn create_context(&self, preemptive: bool) -> Context {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let context = Context::new(
            id,
            preemptive,
            Arc::downgrade(&self.inner),
            self.inner.config.clone(),
            (self.inner.factory)(),
        );
        self.inner
            .contexts
            .lock()
            .unwrap()
            .insert(id, context.clone());
        debug!(
            "Created {} context {id}",
            if preemptive {
                "preemptive"
            } else {
                "non-preemptive"
            }
        );
        context
    }

    /// The context used when a thread has not attached to any other
    pub fn initial_context(&self) -> Context {
        let mut initial = self.inner.initial.lock().unwrap();
        if let Some(context) = initial.as_ref()
            && !context.is_destroyed()
        {
            return context.clone();
        }
        let context = self.create_context(self.inner.config.preemptive);
        *initial = Some(context.clone());
        context
    }

    /// The context the calling thread is attached to
    pub fn current_context() -> Option<Context> {
        CURRENT
            .with(|c| c.borrow().clone())
            .filter(|c| !c.is_destroyed())
    }

    /// Detach the calling thread from its context, returning it
    pub fn detach() -> Option<Context> {
        CURRENT.with(|c| c.borrow_mut().take())
    }

    fn owns(&self, context: &Context) -> bool {
        context
            .inner
            .registry
            .upgrade()
            .is_some_and(|r| Arc::ptr_eq(&r, &self.inner))
    }

    /// The current context, attaching the initial context if there is none
    pub fn context(&self) -> Result<Context, CaError> {
        if let Some(context) = Self::current_context()
            && self.owns(&context)
        {
            return Ok(context);
        }
        let initial = self.initial_context();
        initial.attach()?;
        Ok(initial)
    }

    /// Run `f` on a new thread attached to the initial context
    pub fn spawn_worker<F, T>(&self, f: F) -> Result<JoinHandle<T>, CaError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let context = self.initial_context();
        if !context.is_preemptive() {
            return Err(CaError::NotThreaded);
        }
        Ok(thread::spawn(move || {
            if let Err(e) = context.attach() {
                error!("Worker could not attach to context {}: {e}", context.id());
            }
            let result = f();
            Self::detach();
            result
        }))
    }

    /// Clear every channel of `context`, stop its pump and forget it
    pub fn destroy(&self, context: &Context) {
        context.shutdown();
        self.inner.contexts.lock().unwrap().remove(&context.id());
        {
            let mut initial = self.inner.initial.lock().unwrap();
            if initial.as_ref() == Some(context) {
                *initial = None;
            }
        }
        CURRENT.with(|c| {
            let mut current = c.borrow_mut();
            if current.as_ref() == Some(context) {
                *current = None;
            }
        });
    }

    /// Destroy every context
    pub fn shutdown(&self) {
        let contexts: Vec<Context> = self.contexts();
        for context in contexts {
            self.destroy(&context);
        }
    }

    pub fn contexts(&self) -> Vec<Context> {
        self.inner
            .contexts
            .lock()
            .unwrap()
            .values()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;

    fn registry(preemptive: bool) -> ContextRegistry {
        let transport = MemoryTransport::new();
        ContextRegistry::new(ClientConfig::default().preemptive(preemptive), move || {
            Arc::new(transport.clone())
        })
    }

    #[test]
    fn initial_context_is_shared() {
        let registry = registry(true);
        let a = registry.initial_context();
        let b = registry.context().unwrap();
        assert_eq!(a, b);
        assert_eq!(ContextRegistry::current_context(), Some(a.clone()));
        assert_eq!(registry.contexts().len(), 1);
        registry.destroy(&a);
        assert!(a.is_destroyed());
        assert_eq!(ContextRegistry::current_context(), None);
        assert!(registry.contexts().is_empty());
    }

    #[test]
    fn attach_is_idempotent() {
        let registry = registry(true);
        let context = registry.create_context(false);
        context.attach().unwrap();
        context.attach().unwrap();
        assert_eq!(ContextRegistry::current_context(), Some(context.clone()));
        ContextRegistry::detach();
        assert_eq!(ContextRegistry::current_context(), None);
    }

    #[test]
    fn non_preemptive_contexts_stay_on_their_thread() {
        let registry = registry(false);
        let context = registry.create_context(false);
        let other = context.clone();
        let result = thread::spawn(move || other.attach()).join().unwrap();
        assert_eq!(result, Err(CaError::NotThreaded));
        assert!(matches!(
            registry.spawn_worker(|| ()),
            Err(CaError::NotThreaded)
        ));
    }

    #[test]
    fn workers_attach_to_initial_context() {
        let registry = registry(true);
        let initial = registry.initial_context();
        let handle = registry
            .spawn_worker(ContextRegistry::current_context)
            .unwrap();
        assert_eq!(handle.join().unwrap(), Some(initial));
    }

    #[test]
    fn destroyed_contexts_refuse_work() {
        let registry = registry(false);
        let context = registry.create_context(false);
        context.destroy();
        assert_eq!(context.attach(), Err(CaError::ContextDestroyed));
        assert_eq!(
            context.pend_event(Duration::from_millis(1)),
            Err(CaError::ContextDestroyed)
        );
        // A second destroy is harmless
        registry.destroy(&context);
    }
}
