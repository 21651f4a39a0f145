//! Single eventual-result primitive, generalized over plain, composite and
//! chained construction.
//!
//! One opaque handle with a pending/fulfilled state machine, a lazy
//! `init_cb` fired on first observation, and a single installable
//! continuation. Chain and composite state live in the future's own
//! [`crate::aux::Aux`] slot rather than a bespoke union of future kinds, and
//! composites are driven through the same `then`-based continuation
//! mechanism plain futures use rather than a separate state machine.

pub mod chain;
pub mod composite;

pub use chain::{and_then, continue_error, continue_with, fulfill_next, or_then};
pub use composite::{CompositeFuture, CompositeMode};

use crate::aux::Aux;
use crate::error::{CoreError, Result, Status};
use crate::reactor::{Reactor, TimerSpec};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

type InitFn<T> = Box<dyn FnOnce(Future<T>) + Send>;
type ContinuationFn<T> = Box<dyn FnMut(Future<T>) + Send>;

pub(crate) enum Slot<T> {
    Pending,
    Ready(std::result::Result<T, Status>),
}

pub(crate) struct Shared<T> {
    reactor: Mutex<Option<Arc<dyn Reactor>>>,
    pub(crate) slot: Mutex<Slot<T>>,
    init: Mutex<Option<InitFn<T>>>,
    observed: Mutex<bool>,
    continuation: Mutex<Option<ContinuationFn<T>>>,
    timed_out: Mutex<bool>,
    aux: Mutex<Aux>,
}

/// A handle to one eventual `Result<T, Status>`. Cheap to clone (an `Arc`
/// underneath); every clone observes the same underlying state.
pub struct Future<T> {
    pub(crate) shared: Arc<Shared<T>>,
}

impl<T> Clone for Future<T> {
    fn clone(&self) -> Self {
        Future { shared: self.shared.clone() }
    }
}

impl<T: Send + 'static> Future<T> {
    /// Creates a pending future. `init_cb` runs at most once, the first time
    /// the future is observed (first `wait_for`/`get`/`then`).
    pub fn create(init_cb: impl FnOnce(Future<T>) + Send + 'static) -> Self {
        Future {
            shared: Arc::new(Shared {
                reactor: Mutex::new(None),
                slot: Mutex::new(Slot::Pending),
                init: Mutex::new(Some(Box::new(init_cb))),
                observed: Mutex::new(false),
                continuation: Mutex::new(None),
                timed_out: Mutex::new(false),
                aux: Mutex::new(Aux::new()),
            }),
        }
    }

    /// A future that is already fulfilled; never invokes an `init_cb`.
    pub fn ready(value: T) -> Self {
        let f = Future::create(|_| {});
        let _ = f.fulfill(value);
        f
    }

    /// Associates a reactor. Composite children inherit their parent's
    /// reactor when pushed (see [`composite`]).
    pub fn set_reactor(&self, reactor: Arc<dyn Reactor>) {
        *self.shared.reactor.lock() = Some(reactor);
    }

    pub fn reactor(&self) -> Option<Arc<dyn Reactor>> {
        self.shared.reactor.lock().clone()
    }

    fn observe(&self) {
        {
            let mut observed = self.shared.observed.lock();
            if *observed {
                return;
            }
            *observed = true;
        }
        if let Some(init) = self.shared.init.lock().take() {
            init(self.clone());
        }
    }

    pub fn fulfill(&self, value: T) -> Result<()> {
        self.set_slot(Ok(value))
    }

    pub fn fulfill_error(&self, status: Status) -> Result<()> {
        self.set_slot(Err(status))
    }

    fn set_slot(&self, result: std::result::Result<T, Status>) -> Result<()> {
        {
            let mut slot = self.shared.slot.lock();
            // Multi-fulfill is allowed only after an explicit reset() has put
            // the slot back to Pending; fulfilling an already-ready future
            // otherwise is a programmer error.
            if let Slot::Ready(_) = &*slot {
                return Err(CoreError::already_set("future is already fulfilled"));
            }
            *slot = Slot::Ready(result);
        }
        *self.shared.timed_out.lock() = false;
        self.fire_continuation();
        Ok(())
    }

    /// Clears fulfillment while preserving the installed continuation.
    pub fn reset(&self) -> Result<()> {
        let mut slot = self.shared.slot.lock();
        match &*slot {
            Slot::Ready(_) => {
                *slot = Slot::Pending;
                Ok(())
            }
            Slot::Pending => Err(CoreError::invalid(
                "reset called on a future that has not been fulfilled",
            )),
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(&*self.shared.slot.lock(), Slot::Ready(_))
    }

    fn fire_continuation(&self) {
        let mut cont = self.shared.continuation.lock();
        if let Some(cb) = cont.as_mut() {
            cb(self.clone());
        }
    }

    /// Installs the future's single continuation. `timeout` arms a one-shot
    /// timer (requires a reactor); on expiry, if the future is still
    /// pending, the continuation fires once with the future left pending
    /// internally but reporting `timeout` from `get`/`wait_for` in the
    /// interim (a "timed-out" observable state).
    pub fn then(
        &self,
        timeout: Option<Duration>,
        cb: impl FnMut(Future<T>) + Send + 'static,
    ) -> Result<()> {
        {
            let mut cont = self.shared.continuation.lock();
            if cont.is_some() {
                return Err(CoreError::already_set("future already has a continuation"));
            }
            *cont = Some(Box::new(cb));
        }
        self.observe();
        if let Some(timeout) = timeout {
            if !timeout.is_zero() {
                if let Some(reactor) = self.reactor() {
                    let weak = Arc::downgrade(&self.shared);
                    reactor.add_timer(
                        TimerSpec::once(timeout),
                        Box::new(move || {
                            if let Some(shared) = weak.upgrade() {
                                let fut = Future { shared };
                                if !fut.is_ready() {
                                    *fut.shared.timed_out.lock() = true;
                                    fut.fire_continuation();
                                }
                            }
                        }),
                    );
                }
            }
        }
        if self.is_ready() {
            self.fire_continuation();
        }
        Ok(())
    }

    /// Runs the reactor until ready or `timeout` elapses (`None` = forever).
    pub fn wait_for(&self, timeout: Option<Duration>) -> Result<()> {
        self.observe();
        let deadline = timeout.map(|d| Instant::now() + d);
        loop {
            if self.is_ready() {
                return match &*self.shared.slot.lock() {
                    Slot::Ready(Err(status)) => {
                        Err(CoreError::new(*status, "future fulfilled with an error status"))
                    }
                    _ => Ok(()),
                };
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Err(CoreError::timeout("wait_for timed out"));
                }
            }
            match self.reactor() {
                Some(reactor) => reactor.run_once()?,
                None => return Err(CoreError::invalid("future has no reactor to wait on")),
            }
        }
    }

    /// Blocks (running the reactor) until ready, then returns the value,
    /// cloning it out from the future's owned slot.
    pub fn get(&self) -> Result<T>
    where
        T: Clone,
    {
        self.observe();
        loop {
            {
                let slot = self.shared.slot.lock();
                if let Slot::Ready(result) = &*slot {
                    return match result {
                        Ok(v) => Ok(v.clone()),
                        Err(status) => {
                            Err(CoreError::new(*status, "future fulfilled with an error status"))
                        }
                    };
                }
            }
            if *self.shared.timed_out.lock() {
                return Err(CoreError::timeout("future timed out before a value arrived"));
            }
            match self.reactor() {
                Some(reactor) => reactor.run_once()?,
                None => return Err(CoreError::invalid("future has no reactor to wait on")),
            }
        }
    }

    pub fn aux_set<V: std::any::Any + Send + Sync>(&self, value: V) -> Option<V> {
        self.shared.aux.lock().insert(value)
    }

    pub fn aux_get<V: std::any::Any + Send + Sync + Clone>(&self) -> Option<V> {
        self.shared.aux.lock().get::<V>().cloned()
    }

    pub(crate) fn ready_result(&self) -> Option<std::result::Result<T, Status>>
    where
        T: Clone,
    {
        match &*self.shared.slot.lock() {
            Slot::Ready(r) => Some(r.clone()),
            Slot::Pending => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_is_lazy_until_first_observation() {
        use std::sync::atomic::{AtomicBool, Ordering};
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        let f: Future<i32> = Future::create(move |fut| {
            fired2.store(true, Ordering::SeqCst);
            let _ = fut.fulfill(7);
        });
        assert!(!fired.load(Ordering::SeqCst));
        assert_eq!(f.get().unwrap(), 7);
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn fulfill_error_surfaces_through_get() {
        let f: Future<i32> = Future::create(|fut| {
            let _ = fut.fulfill_error(Status::NotFound);
        });
        let err = f.get().unwrap_err();
        assert_eq!(err.status(), Status::NotFound);
    }

    #[test]
    fn then_fires_immediately_when_already_ready() {
        let f: Future<i32> = Future::ready(42);
        let seen = Arc::new(parking_lot::Mutex::new(None));
        let seen2 = seen.clone();
        f.then(None, move |fut| {
            *seen2.lock() = fut.ready_result();
        })
        .unwrap();
        assert!(matches!(*seen.lock(), Some(Ok(42))));
    }

    #[test]
    fn then_rejects_a_second_continuation() {
        let f: Future<i32> = Future::ready(1);
        f.then(None, |_| {}).unwrap();
        let err = f.then(None, |_| {}).unwrap_err();
        assert_eq!(err.status(), Status::AlreadySet);
    }

    #[test]
    fn reset_requires_prior_fulfillment() {
        let f: Future<i32> = Future::create(|_| {});
        assert!(f.reset().is_err());
        f.fulfill(1).unwrap();
        assert!(f.reset().is_ok());
        assert!(!f.is_ready());
    }
}
