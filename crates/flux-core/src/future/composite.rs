//! `wait_any` / `wait_all` composite futures.
//!
//! A composite is itself a [`Future`], driven by `then` continuations
//! installed on each pushed child — there is no separate composite state
//! machine, just the ordinary single-continuation mechanism wired up N
//! times, instead of a bespoke union of future kinds.

use super::Future;
use crate::error::{CoreError, Result, Status};
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompositeMode {
    Any,
    All,
}

struct ChildEntry<T> {
    name: Option<String>,
    future: Future<T>,
}

struct State<T> {
    children: Vec<ChildEntry<T>>,
    remaining: usize,
    first_error: Option<Status>,
    iter_pos: usize,
}

/// A `wait_any`/`wait_all` composite over children of type `T`.
///
/// `wait_all` composites carry `T = ()`: the aggregate has no single
/// "the" value among heterogeneous children, only a combined ok/error
/// status, matching the contract ("otherwise ok" — no payload named).
/// `wait_any` composites stay generic over `T` and inherit the first ready
/// child's value verbatim.
pub struct CompositeFuture<T> {
    future: Future<T>,
    mode: CompositeMode,
    state: Arc<Mutex<State<T>>>,
}

impl<T: Send + Clone + 'static> CompositeFuture<T> {
    /// Becomes ready with the first child's status and value.
    pub fn wait_any_create() -> Self {
        CompositeFuture {
            future: Future::create(|_| {}),
            mode: CompositeMode::Any,
            state: Arc::new(Mutex::new(State {
                children: Vec::new(),
                remaining: 0,
                first_error: None,
                iter_pos: 0,
            })),
        }
    }

    /// The composite's own future handle (clone freely; shares identity).
    pub fn future(&self) -> Future<T> {
        self.future.clone()
    }

    pub fn mode(&self) -> CompositeMode {
        self.mode
    }

    /// Adds `child` under `name`, inheriting the composite's reactor and
    /// synchronously triggering the child's first observation. Valid only
    /// on a `wait_any` composite — `wait_all` composites take heterogeneous
    /// children through [`CompositeFuture::push_any`] instead.
    pub fn push(&self, name: Option<&str>, child: Future<T>) -> Result<()> {
        if self.mode != CompositeMode::Any {
            return Err(CoreError::invalid("push is only valid on a wait_any composite; use push_any"));
        }
        if let Some(reactor) = self.future.reactor() {
            if child.reactor().is_none() {
                child.set_reactor(reactor);
            }
        }
        {
            let mut state = self.state.lock();
            state.children.push(ChildEntry { name: name.map(str::to_owned), future: child.clone() });
            state.remaining += 1;
        }

        let composite_future = self.future.clone();
        let _ = child.then(None, move |ready_child| {
            let Some(result) = ready_child.ready_result() else { return };
            if !composite_future.is_ready() {
                match result {
                    Ok(v) => { let _ = composite_future.fulfill(v); }
                    Err(status) => { let _ = composite_future.fulfill_error(status); }
                }
            }
        });
        Ok(())
    }

    pub fn get_child(&self, name: &str) -> Option<Future<T>> {
        self.state.lock().children.iter().find(|c| c.name.as_deref() == Some(name)).map(|c| c.future.clone())
    }

    /// Resets the ordered-iteration cursor and returns the first child, if
    /// any.
    pub fn first_child(&self) -> Option<Future<T>> {
        let mut state = self.state.lock();
        state.iter_pos = 0;
        let f = state.children.first().map(|c| c.future.clone());
        if f.is_some() {
            state.iter_pos = 1;
        }
        f
    }

    /// Continues ordered iteration from the cursor left by `first_child`.
    pub fn next_child(&self) -> Option<Future<T>> {
        let mut state = self.state.lock();
        let pos = state.iter_pos;
        let f = state.children.get(pos).map(|c| c.future.clone());
        if f.is_some() {
            state.iter_pos = pos + 1;
        }
        f
    }
}

impl CompositeFuture<()> {
    /// Becomes ready (ok) once every child is ready, or with the first
    /// error observed among children. An empty wait-all is immediately
    /// fulfilled.
    pub fn wait_all_create() -> Self {
        let composite = CompositeFuture {
            future: Future::create(|_| {}),
            mode: CompositeMode::All,
            state: Arc::new(Mutex::new(State {
                children: Vec::new(),
                remaining: 0,
                first_error: None,
                iter_pos: 0,
            })),
        };
        let _ = composite.future.fulfill(());
        composite
    }

    pub fn push_any<V: Send + Clone + 'static>(&self, name: Option<&str>, child: Future<V>) -> Result<()> {
        if !matches!(self.mode, CompositeMode::All) {
            return Err(CoreError::invalid("push_any is only valid on a wait_all composite"));
        }
        if self.future.is_ready() && self.state.lock().children.is_empty() {
            // undo the "empty composite is immediately ready" default now
            // that a real child is being attached.
            self.future.reset().ok();
        }
        if let Some(reactor) = self.future.reactor() {
            if child.reactor().is_none() {
                child.set_reactor(reactor.clone());
            }
        }
        // `child` is `Future<V>` for whatever `V` the caller pushed, but
        // `state.children` is `Vec<ChildEntry<()>>` shared with `push` — a
        // wait_all composite is always `CompositeFuture<()>`. A unit-valued
        // shadow future stands in for the child in that list: it settles
        // (dropping the value, keeping ok/error) the moment the real child
        // does, so `get_child`/`first_child`/`next_child` still see this
        // child instead of finding the list silently empty.
        let shadow: Future<()> = Future::create(|_| {});
        if let Some(reactor) = self.future.reactor() {
            shadow.set_reactor(reactor);
        }
        {
            let mut state = self.state.lock();
            state.children.push(ChildEntry { name: name.map(str::to_owned), future: shadow.clone() });
            state.remaining += 1;
        }
        let composite_future = self.future.clone();
        let state = self.state.clone();
        let _ = child.then(None, move |ready_child| {
            let Some(result) = ready_child.ready_result() else { return };
            match &result {
                Ok(_) => { let _ = shadow.fulfill(()); }
                Err(status) => { let _ = shadow.fulfill_error(*status); }
            }
            let mut state = state.lock();
            if let Err(status) = result {
                state.first_error.get_or_insert(status);
            }
            state.remaining = state.remaining.saturating_sub(1);
            if state.remaining == 0 {
                let first_error = state.first_error;
                drop(state);
                match first_error {
                    Some(status) => { let _ = composite_future.fulfill_error(status); }
                    None => { let _ = composite_future.fulfill(()); }
                }
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::future::Future;

    #[test]
    fn wait_any_becomes_ready_with_the_first_fulfilled_child() {
        let comp = CompositeFuture::wait_any_create();
        let a: Future<i32> = Future::create(|_| {});
        let b: Future<i32> = Future::create(|_| {});
        comp.push(Some("a"), a.clone()).unwrap();
        comp.push(Some("b"), b.clone()).unwrap();
        b.fulfill(7).unwrap();
        assert_eq!(comp.future().get().unwrap(), 7);
        // `a` is untouched — fulfilling it afterwards must not disturb the
        // composite, which has already settled on `b`'s outcome.
        a.fulfill(99).unwrap();
        assert_eq!(comp.future().get().unwrap(), 7);
    }

    #[test]
    fn wait_all_is_ok_iff_every_child_is_ok() {
        let comp = CompositeFuture::<()>::wait_all_create();
        let a: Future<i32> = Future::create(|_| {});
        let b: Future<i32> = Future::create(|_| {});
        comp.push_any(None, a.clone()).unwrap();
        comp.push_any(None, b.clone()).unwrap();
        a.fulfill(1).unwrap();
        assert!(!comp.future().is_ready());
        b.fulfill(2).unwrap();
        assert!(comp.future().get().is_ok());
    }

    #[test]
    fn wait_all_adopts_the_first_child_error() {
        let comp = CompositeFuture::<()>::wait_all_create();
        let a: Future<i32> = Future::create(|_| {});
        let b: Future<i32> = Future::create(|_| {});
        comp.push_any(None, a.clone()).unwrap();
        comp.push_any(None, b.clone()).unwrap();
        a.fulfill_error(Status::NotFound).unwrap();
        b.fulfill(2).unwrap();
        let err = comp.future().get().unwrap_err();
        assert_eq!(err.status(), Status::NotFound);
    }

    #[test]
    fn empty_wait_all_is_ready_at_creation() {
        let comp = CompositeFuture::<()>::wait_all_create();
        assert!(comp.future().is_ready());
        assert!(comp.future().get().is_ok());
    }

    #[test]
    fn wait_all_tracks_named_children_for_lookup_and_iteration() {
        let comp = CompositeFuture::<()>::wait_all_create();
        let a: Future<i32> = Future::create(|_| {});
        let b: Future<String> = Future::create(|_| {});
        comp.push_any(Some("a"), a.clone()).unwrap();
        comp.push_any(Some("b"), b.clone()).unwrap();

        let named = comp.get_child("a").expect("named child must be findable");
        assert!(!named.is_ready());
        a.fulfill(1).unwrap();
        assert!(named.is_ready());

        let first = comp.first_child().unwrap();
        let second = comp.next_child().unwrap();
        assert!(comp.next_child().is_none());
        assert!(first.is_ready());
        assert!(!second.is_ready());
        b.fulfill("done".to_string()).unwrap();
        assert!(second.is_ready());
    }
}
