//! Contracts for the systems that surround this crate but aren't implemented
//! by it: an event bus, RPC, a KVS, leveled logging, and a service-plugin
//! loader.
//!
//! KVS, eventlog, and RPC wire protocols stay out of this crate — only the
//! interfaces the core invokes are specified here, as traits. [`PluginStack`]
//! is the one piece of this module that is *not* an external collaborator:
//! it's plumbing the core owns directly, a concrete type alongside the trait
//! contracts for the actually-external services. The [`inmemory`] submodule
//! gives each trait one reference test double, so callers can exercise the
//! contract without standing up a real event bus, RPC layer, or KVS.

use crate::error::Result;
use crate::future::Future;
use crate::observability::Level;
use std::collections::HashMap;
use std::sync::Arc;

/// Opaque handle returned by [`EventBus::subscribe`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Dotted-topic publish/subscribe with `*`-suffix wildcards.
///
/// A subscriber pulls its lazy sequence of `(topic, payload)` pairs through
/// [`EventBus::poll`] rather than via a callback, so the core's single
/// reactor thread stays in control of when delivery happens.
pub trait EventBus: Send + Sync {
    fn subscribe(&self, topic_glob: &str) -> Result<SubscriptionId>;
    fn unsubscribe(&self, id: SubscriptionId) -> Result<()>;
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()>;
    /// Pops the next buffered event for `id`, or `Ok(None)` if none is
    /// currently queued. Returns `Err(NotFound)` once `id` has been
    /// unsubscribed.
    fn poll(&self, id: SubscriptionId) -> Result<Option<(String, Vec<u8>)>>;
}

/// Request/response calls composed on top of the message transport.
pub trait Rpc: Send + Sync {
    fn call(&self, peer: &str, method: &str, payload: Vec<u8>) -> Future<Vec<u8>>;
    fn register(
        &self,
        service: &str,
        handler: Box<dyn Fn(Vec<u8>) -> Result<Vec<u8>> + Send + Sync>,
    ) -> Result<()>;
}

bitflags::bitflags! {
    /// `WAIT_CREATE` requests "wait for creation instead of failing
    /// not-found" lookup semantics.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct KvsFlags: u8 {
        const WAIT_CREATE = 0b01;
    }
}

/// One key set or unset in a [`Kvs::commit`]. `value: None` removes the key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KvsOp {
    pub namespace: String,
    pub key: String,
    pub value: Option<Vec<u8>>,
}

/// A batch of key operations applied atomically by [`Kvs::commit`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KvsTxn {
    pub ops: Vec<KvsOp>,
}

impl KvsTxn {
    pub fn new() -> Self {
        KvsTxn::default()
    }

    pub fn put(mut self, namespace: impl Into<String>, key: impl Into<String>, value: Vec<u8>) -> Self {
        self.ops.push(KvsOp { namespace: namespace.into(), key: key.into(), value: Some(value) });
        self
    }

    pub fn remove(mut self, namespace: impl Into<String>, key: impl Into<String>) -> Self {
        self.ops.push(KvsOp { namespace: namespace.into(), key: key.into(), value: None });
        self
    }
}

/// A cancellable lazy sequence of value versions for a watched key; finite
/// if the key is removed, otherwise unbounded until cancelled.
pub trait KvsWatch: Send {
    /// `Ok(Some(value))` for the next version, `Ok(None)` once the stream
    /// has terminated (key removed, or cancelled).
    fn next(&mut self) -> Result<Option<Vec<u8>>>;
    fn cancel(&mut self);
}

pub trait Kvs: Send + Sync {
    fn lookup(&self, namespace: &str, key: &str, flags: KvsFlags) -> Future<Vec<u8>>;
    fn commit(&self, txn: KvsTxn) -> Future<()>;
    fn watch(&self, namespace: &str, key: &str, flags: KvsFlags) -> Box<dyn KvsWatch>;
}

/// Leveled logging sink; the core only ever calls through this
/// trait, never a concrete backend — see [`crate::observability`] for the
/// `tracing`-backed facade most hosts will hand it.
pub trait Logger: Send + Sync {
    fn log(&self, level: Level, msg: &str, fields: &[(&str, &str)]);
}

type PluginHandler = Box<dyn Fn(&[u8]) -> Result<()> + Send + Sync>;

/// A stack of named plugins, each registering handlers by topic string.
/// [`PluginStack::call`] invokes every matching handler in push order,
/// continuing past a failing handler but reporting the first error.
pub struct PluginStack {
    entries: parking_lot::Mutex<Vec<(String, String, PluginHandler)>>,
}

impl PluginStack {
    pub fn new() -> Self {
        PluginStack { entries: parking_lot::Mutex::new(Vec::new()) }
    }

    /// Registers `handler` under `plugin_name` for `topic`. A plugin may
    /// register more than one topic by calling this repeatedly.
    pub fn push(&self, plugin_name: impl Into<String>, topic: impl Into<String>, handler: PluginHandler) {
        self.entries.lock().push((plugin_name.into(), topic.into(), handler));
    }

    pub fn call(&self, topic: &str, args: &[u8]) -> Result<()> {
        let entries = self.entries.lock();
        let mut first_err = None;
        for (_, t, handler) in entries.iter() {
            if t != topic {
                continue;
            }
            if let Err(e) = handler(args) {
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Names of every registered plugin, in push order, without duplicates.
    pub fn plugin_names(&self) -> Vec<String> {
        let mut seen = Vec::new();
        for (name, _, _) in self.entries.lock().iter() {
            if !seen.contains(name) {
                seen.push(name.clone());
            }
        }
        seen
    }
}

impl Default for PluginStack {
    fn default() -> Self {
        PluginStack::new()
    }
}

impl std::fmt::Debug for PluginStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginStack").field("plugins", &self.plugin_names()).finish()
    }
}

/// In-memory reference implementations of the traits above, for tests and
/// for a single-process host that doesn't need the real collaborators.
pub mod inmemory {
    use super::*;
    use crate::error::CoreError;
    use parking_lot::{Condvar, Mutex};
    use std::collections::VecDeque;

    fn glob_matches(glob: &str, topic: &str) -> bool {
        match glob.strip_suffix('*') {
            Some(prefix) => topic.starts_with(prefix),
            None => glob == topic,
        }
    }

    struct Subscription {
        glob: String,
        queue: VecDeque<(String, Vec<u8>)>,
        live: bool,
    }

    /// A single-process event bus: `publish` fans out synchronously to every
    /// live subscription whose glob matches, queuing for later `poll`.
    pub struct InMemoryEventBus {
        next_id: Mutex<u64>,
        subs: Mutex<HashMap<SubscriptionId, Subscription>>,
    }

    impl InMemoryEventBus {
        pub fn new() -> Self {
            InMemoryEventBus { next_id: Mutex::new(1), subs: Mutex::new(HashMap::new()) }
        }
    }

    impl Default for InMemoryEventBus {
        fn default() -> Self {
            InMemoryEventBus::new()
        }
    }

    impl EventBus for InMemoryEventBus {
        fn subscribe(&self, topic_glob: &str) -> Result<SubscriptionId> {
            let mut next_id = self.next_id.lock();
            let id = SubscriptionId(*next_id);
            *next_id += 1;
            self.subs.lock().insert(
                id,
                Subscription { glob: topic_glob.to_string(), queue: VecDeque::new(), live: true },
            );
            Ok(id)
        }

        fn unsubscribe(&self, id: SubscriptionId) -> Result<()> {
            match self.subs.lock().remove(&id) {
                Some(_) => Ok(()),
                None => Err(CoreError::not_found("no such subscription")),
            }
        }

        fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
            for sub in self.subs.lock().values_mut() {
                if sub.live && glob_matches(&sub.glob, topic) {
                    sub.queue.push_back((topic.to_string(), payload.clone()));
                }
            }
            Ok(())
        }

        fn poll(&self, id: SubscriptionId) -> Result<Option<(String, Vec<u8>)>> {
            let mut subs = self.subs.lock();
            let sub = subs.get_mut(&id).ok_or_else(|| CoreError::not_found("no such subscription"))?;
            Ok(sub.queue.pop_front())
        }
    }

    /// An in-process RPC double: `register` stores a handler by
    /// `"service.method"`, and `call` invokes it inline and returns an
    /// already-fulfilled future. A real collaborator would route the
    /// request/response pair through [`crate::itransport`]; this double
    /// skips the wire for test ergonomics.
    pub struct InMemoryRpc {
        handlers: Mutex<HashMap<String, Arc<dyn Fn(Vec<u8>) -> Result<Vec<u8>> + Send + Sync>>>,
    }

    impl InMemoryRpc {
        pub fn new() -> Self {
            InMemoryRpc { handlers: Mutex::new(HashMap::new()) }
        }
    }

    impl Default for InMemoryRpc {
        fn default() -> Self {
            InMemoryRpc::new()
        }
    }

    impl Rpc for InMemoryRpc {
        fn call(&self, _peer: &str, method: &str, payload: Vec<u8>) -> Future<Vec<u8>> {
            let handler = self.handlers.lock().get(method).cloned();
            let f: Future<Vec<u8>> = Future::create(|_| {});
            match handler {
                Some(h) => match h(payload) {
                    Ok(resp) => {
                        let _ = f.fulfill(resp);
                    }
                    Err(e) => {
                        let _ = f.fulfill_error(e.status());
                    }
                },
                None => {
                    let _ = f.fulfill_error(crate::error::Status::NotFound);
                }
            }
            f
        }

        fn register(
            &self,
            service: &str,
            handler: Box<dyn Fn(Vec<u8>) -> Result<Vec<u8>> + Send + Sync>,
        ) -> Result<()> {
            self.handlers.lock().insert(service.to_string(), Arc::from(handler));
            Ok(())
        }
    }

    struct WatchState {
        values: VecDeque<Vec<u8>>,
        finished: bool,
        cancelled: bool,
    }

    /// A [`KvsWatch`] fed by [`InMemoryKvs::commit`], guarded by a condvar so
    /// [`KvsWatch::next`] can block until the next version (or termination)
    /// arrives.
    struct InMemoryKvsWatch {
        state: Arc<Mutex<WatchState>>,
        cv: Arc<Condvar>,
    }

    impl KvsWatch for InMemoryKvsWatch {
        fn next(&mut self) -> Result<Option<Vec<u8>>> {
            let mut state = self.state.lock();
            loop {
                if let Some(v) = state.values.pop_front() {
                    return Ok(Some(v));
                }
                if state.finished || state.cancelled {
                    return Ok(None);
                }
                self.cv.wait(&mut state);
            }
        }

        fn cancel(&mut self) {
            let mut state = self.state.lock();
            state.cancelled = true;
            self.cv.notify_all();
        }
    }

    /// An in-process KVS double: a flat `(namespace, key) -> value` map plus
    /// waiters for `WAIT_CREATE` lookups and subscribers for `watch`.
    pub struct InMemoryKvs {
        store: Mutex<HashMap<(String, String), Vec<u8>>>,
        create_waiters: Mutex<HashMap<(String, String), Vec<Future<Vec<u8>>>>>,
        watchers: Mutex<HashMap<(String, String), Vec<(Arc<Mutex<WatchState>>, Arc<Condvar>)>>>,
    }

    impl InMemoryKvs {
        pub fn new() -> Self {
            InMemoryKvs {
                store: Mutex::new(HashMap::new()),
                create_waiters: Mutex::new(HashMap::new()),
                watchers: Mutex::new(HashMap::new()),
            }
        }
    }

    impl Default for InMemoryKvs {
        fn default() -> Self {
            InMemoryKvs::new()
        }
    }

    impl Kvs for InMemoryKvs {
        fn lookup(&self, namespace: &str, key: &str, flags: KvsFlags) -> Future<Vec<u8>> {
            let id = (namespace.to_string(), key.to_string());
            if let Some(v) = self.store.lock().get(&id).cloned() {
                return Future::ready(v);
            }
            if flags.contains(KvsFlags::WAIT_CREATE) {
                let f: Future<Vec<u8>> = Future::create(|_| {});
                self.create_waiters.lock().entry(id).or_default().push(f.clone());
                f
            } else {
                let f: Future<Vec<u8>> = Future::create(|_| {});
                let _ = f.fulfill_error(crate::error::Status::NotFound);
                f
            }
        }

        fn commit(&self, txn: KvsTxn) -> Future<()> {
            for op in &txn.ops {
                let id = (op.namespace.clone(), op.key.clone());
                match &op.value {
                    Some(v) => {
                        self.store.lock().insert(id.clone(), v.clone());
                        if let Some(waiters) = self.create_waiters.lock().remove(&id) {
                            for waiter in waiters {
                                let _ = waiter.fulfill(v.clone());
                            }
                        }
                        if let Some(subs) = self.watchers.lock().get(&id) {
                            for (state, cv) in subs {
                                state.lock().values.push_back(v.clone());
                                cv.notify_all();
                            }
                        }
                    }
                    None => {
                        self.store.lock().remove(&id);
                        if let Some(subs) = self.watchers.lock().remove(&id) {
                            for (state, cv) in subs {
                                state.lock().finished = true;
                                cv.notify_all();
                            }
                        }
                    }
                }
            }
            Future::ready(())
        }

        fn watch(&self, namespace: &str, key: &str, _flags: KvsFlags) -> Box<dyn KvsWatch> {
            let id = (namespace.to_string(), key.to_string());
            let state = Arc::new(Mutex::new(WatchState {
                values: VecDeque::new(),
                finished: false,
                cancelled: false,
            }));
            let cv = Arc::new(Condvar::new());
            if let Some(v) = self.store.lock().get(&id).cloned() {
                state.lock().values.push_back(v);
            }
            self.watchers.lock().entry(id).or_default().push((state.clone(), cv.clone()));
            Box::new(InMemoryKvsWatch { state, cv })
        }
    }

    /// Collects every logged line (for test assertions) and forwards it to
    /// [`crate::observability::log`].
    pub struct InMemoryLogger {
        lines: Mutex<Vec<(Level, String)>>,
    }

    impl InMemoryLogger {
        pub fn new() -> Self {
            InMemoryLogger { lines: Mutex::new(Vec::new()) }
        }

        pub fn lines(&self) -> Vec<(Level, String)> {
            self.lines.lock().clone()
        }
    }

    impl Default for InMemoryLogger {
        fn default() -> Self {
            InMemoryLogger::new()
        }
    }

    impl Logger for InMemoryLogger {
        fn log(&self, level: Level, msg: &str, fields: &[(&str, &str)]) {
            self.lines.lock().push((level, msg.to_string()));
            crate::observability::log(level, msg, fields);
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn event_bus_delivers_only_to_matching_wildcard_subscribers() {
            let bus = InMemoryEventBus::new();
            let job_sub = bus.subscribe("job.*").unwrap();
            let other_sub = bus.subscribe("sched.*").unwrap();
            bus.publish("job.submit", b"payload".to_vec()).unwrap();
            assert_eq!(bus.poll(job_sub).unwrap(), Some(("job.submit".into(), b"payload".to_vec())));
            assert_eq!(bus.poll(other_sub).unwrap(), None);
        }

        #[test]
        fn event_bus_poll_after_unsubscribe_is_not_found() {
            let bus = InMemoryEventBus::new();
            let sub = bus.subscribe("x.*").unwrap();
            bus.unsubscribe(sub).unwrap();
            assert!(bus.poll(sub).is_err());
        }

        #[test]
        fn rpc_call_routes_to_registered_handler() {
            let rpc = InMemoryRpc::new();
            rpc.register("echo", Box::new(|payload| Ok(payload))).unwrap();
            let f = rpc.call("peer0", "echo", b"hi".to_vec());
            assert_eq!(f.get().unwrap(), b"hi".to_vec());
        }

        #[test]
        fn rpc_call_to_unregistered_method_is_not_found() {
            let rpc = InMemoryRpc::new();
            let f = rpc.call("peer0", "missing", Vec::new());
            let err = f.get().unwrap_err();
            assert_eq!(err.status(), crate::error::Status::NotFound);
        }

        #[test]
        fn kvs_lookup_then_commit_resolves_wait_create() {
            let kvs = InMemoryKvs::new();
            let f = kvs.lookup("ns", "key", KvsFlags::WAIT_CREATE);
            kvs.commit(KvsTxn::new().put("ns", "key", b"v1".to_vec())).get().unwrap();
            assert_eq!(f.get().unwrap(), b"v1".to_vec());
        }

        #[test]
        fn kvs_lookup_without_wait_create_is_not_found() {
            let kvs = InMemoryKvs::new();
            let err = kvs.lookup("ns", "missing", KvsFlags::empty()).get().unwrap_err();
            assert_eq!(err.status(), crate::error::Status::NotFound);
        }

        #[test]
        fn kvs_watch_terminates_on_key_removal() {
            let kvs = InMemoryKvs::new();
            let mut w = kvs.watch("ns", "key", KvsFlags::empty());
            kvs.commit(KvsTxn::new().put("ns", "key", b"v1".to_vec())).get().unwrap();
            assert_eq!(w.next().unwrap(), Some(b"v1".to_vec()));
            kvs.commit(KvsTxn::new().remove("ns", "key")).get().unwrap();
            assert_eq!(w.next().unwrap(), None);
        }

        #[test]
        fn plugin_stack_calls_every_matching_handler_in_push_order() {
            let stack = PluginStack::new();
            let order = Arc::new(Mutex::new(Vec::new()));
            let order1 = order.clone();
            stack.push("first", "job.new", Box::new(move |_| {
                order1.lock().push("first");
                Ok(())
            }));
            let order2 = order.clone();
            stack.push("second", "job.new", Box::new(move |_| {
                order2.lock().push("second");
                Ok(())
            }));
            stack.call("job.new", b"").unwrap();
            assert_eq!(*order.lock(), vec!["first", "second"]);
        }

        #[test]
        fn plugin_stack_continues_past_a_failing_handler_and_reports_first_error() {
            let stack = PluginStack::new();
            let order = Arc::new(Mutex::new(Vec::new()));
            let order1 = order.clone();
            stack.push(
                "bad",
                "job.new",
                Box::new(move |_| {
                    order1.lock().push("bad");
                    Err(CoreError::invalid("plugin refused"))
                }),
            );
            let order2 = order.clone();
            stack.push("good", "job.new", Box::new(move |_| {
                order2.lock().push("good");
                Ok(())
            }));
            let err = stack.call("job.new", b"").unwrap_err();
            assert_eq!(err.status(), crate::error::Status::Invalid);
            assert_eq!(*order.lock(), vec!["bad", "good"]);
        }

        #[test]
        fn logger_records_and_forwards_lines() {
            let logger = InMemoryLogger::new();
            logger.log(Level::Warn, "reactor stalled", &[]);
            assert_eq!(logger.lines(), vec![(Level::Warn, "reactor stalled".to_string())]);
        }
    }
}
