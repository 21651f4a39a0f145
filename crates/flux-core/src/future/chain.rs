//! `and_then` / `or_then` chained futures.
//!
//! Each `prev` future owns at most one chain: the first call to either
//! `and_then` or `or_then` allocates the `next` future and stores it (plus
//! both callback slots) in `prev`'s [`crate::aux::Aux`] store, keyed by
//! type. Subsequent calls on the same `prev` reuse that state, so repeated
//! `and_then`/`or_then` calls on one `prev` always return the same `next`
//! rather than reaching for a bespoke "chain node" type.

use super::{Future, Slot};
use crate::error::Status;
use parking_lot::Mutex;
use std::sync::Arc;

type ChainCallback<T> = Box<dyn FnMut(&Future<T>) + Send>;

struct ChainState<T> {
    next: Future<T>,
    and_then_cb: Option<ChainCallback<T>>,
    or_then_cb: Option<ChainCallback<T>>,
    continuation_installed: bool,
}

fn chain_handle<T: Send + Clone + 'static>(prev: &Future<T>) -> Arc<Mutex<ChainState<T>>> {
    if let Some(existing) = prev.aux_get::<Arc<Mutex<ChainState<T>>>>() {
        return existing;
    }
    let handle = Arc::new(Mutex::new(ChainState {
        next: Future::create(|_| {}),
        and_then_cb: None,
        or_then_cb: None,
        continuation_installed: false,
    }));
    // aux_set returns the previous value (None here); another thread losing
    // this race would be a correctness bug, but chains are built on the
    // single reactor thread that owns the future.
    prev.aux_set(handle.clone());
    handle
}

fn ensure_continuation<T: Send + Clone + 'static>(prev: &Future<T>, handle: &Arc<Mutex<ChainState<T>>>) {
    let mut guard = handle.lock();
    if guard.continuation_installed {
        return;
    }
    guard.continuation_installed = true;
    drop(guard);

    let handle = handle.clone();
    let _ = prev.then(None, move |ready_prev| {
        let Some(result) = ready_prev.ready_result() else { return };
        let mut guard = handle.lock();
        match &result {
            Ok(_) => {
                if let Some(cb) = guard.and_then_cb.as_mut() {
                    cb(&ready_prev);
                    return;
                }
            }
            Err(_) => {
                if let Some(cb) = guard.or_then_cb.as_mut() {
                    cb(&ready_prev);
                    return;
                }
            }
        }
        let next = guard.next.clone();
        drop(guard);
        match result {
            Ok(v) => {
                let _ = next.fulfill(v);
            }
            Err(status) => {
                let _ = next.fulfill_error(status);
            }
        }
    });
}

/// Installs (or reuses) the `next` future and arranges for `cb` to run when
/// `prev` fulfills successfully. Returns `next`.
pub fn and_then<T: Send + Clone + 'static>(
    prev: &Future<T>,
    cb: impl FnMut(&Future<T>) + Send + 'static,
) -> Future<T> {
    let handle = chain_handle(prev);
    handle.lock().and_then_cb = Some(Box::new(cb));
    ensure_continuation(prev, &handle);
    handle.lock().next.clone()
}

/// As [`and_then`], but `cb` runs when `prev` fulfills with an error.
pub fn or_then<T: Send + Clone + 'static>(
    prev: &Future<T>,
    cb: impl FnMut(&Future<T>) + Send + 'static,
) -> Future<T> {
    let handle = chain_handle(prev);
    handle.lock().or_then_cb = Some(Box::new(cb));
    ensure_continuation(prev, &handle);
    handle.lock().next.clone()
}

/// Transfers fulfillment: when `replacement` becomes ready, `prev`'s `next`
/// future is fulfilled (or errored) with `replacement`'s outcome.
pub fn continue_with<T: Send + Clone + 'static>(prev: &Future<T>, replacement: Future<T>) {
    let handle = chain_handle(prev);
    let next = handle.lock().next.clone();
    if let Some(reactor) = prev.reactor() {
        if replacement.reactor().is_none() {
            replacement.set_reactor(reactor);
        }
    }
    let _ = replacement.then(None, move |ready| {
        if let Slot::Ready(result) = &*ready.shared.slot.lock() {
            match result.clone() {
                Ok(v) => {
                    let _ = next.fulfill(v);
                }
                Err(status) => {
                    let _ = next.fulfill_error(status);
                }
            }
        }
    });
}

/// Directly fulfills `prev`'s `next` future with an error.
pub fn continue_error<T: Send + Clone + 'static>(prev: &Future<T>, status: Status) {
    let handle = chain_handle(prev);
    let next = handle.lock().next.clone();
    let _ = next.fulfill_error(status);
}

/// Shorthand for fulfilling `prev`'s `next` future directly with a value.
pub fn fulfill_next<T: Send + Clone + 'static>(prev: &Future<T>, value: T) {
    let handle = chain_handle(prev);
    let next = handle.lock().next.clone();
    let _ = next.fulfill(value);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::future::Future;

    #[test]
    fn and_then_runs_only_on_success_and_shares_next() {
        let prev: Future<i32> = Future::create(|_| {});
        let next_a = and_then(&prev, |p| {
            let v = p.ready_result().unwrap().unwrap();
            fulfill_next(p, v * 2);
        });
        let next_b = and_then(&prev, |p| {
            let v = p.ready_result().unwrap().unwrap();
            fulfill_next(p, v * 2);
        });
        prev.fulfill(21).unwrap();
        assert_eq!(next_a.get().unwrap(), 42);
        assert_eq!(next_b.get().unwrap(), 42);
    }

    #[test]
    fn error_propagates_when_no_or_then_installed() {
        let prev: Future<i32> = Future::create(|_| {});
        let next = and_then(&prev, |_| {});
        prev.fulfill_error(Status::NotFound).unwrap();
        let err = next.get().unwrap_err();
        assert_eq!(err.status(), Status::NotFound);
    }

    #[test]
    fn or_then_recovers_from_an_error() {
        let prev: Future<i32> = Future::create(|_| {});
        let next = or_then(&prev, |p| {
            let _ = p;
            fulfill_next(p, -1);
        });
        prev.fulfill_error(Status::Timeout).unwrap();
        assert_eq!(next.get().unwrap(), -1);
    }

    #[test]
    fn reset_then_refulfill_refires_the_chain_exactly_once_per_cycle() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let prev: Future<i32> = Future::create(|_| {});
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = seen.clone();
        let next = and_then(&prev, move |p| {
            seen2.fetch_add(1, Ordering::SeqCst);
            let v = p.ready_result().unwrap().unwrap();
            fulfill_next(p, v);
        });

        prev.fulfill(1).unwrap();
        assert_eq!(next.get().unwrap(), 1);
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        prev.reset().unwrap();
        next.reset().unwrap();
        prev.fulfill(2).unwrap();
        assert_eq!(next.get().unwrap(), 2);
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }
}
