//! Thread-local stack of deferred-release registrations bounding object
//! lifetimes to dynamic call scopes.
//!
//! "Every push has a matching scope-pop on every exit path" is exactly the
//! property Rust's `Drop` is for, so on top of
//! the literal `scope_push`/`scope_pop` API this module also exposes
//! [`AutoScope`], a guard whose `Drop` pops the scope even if the caller
//! returns early or unwinds.
//!
//! Objects are registered through [`Arc`] rather than by raw pointer: the
//! caller keeps using its own `Arc` handle as normal, while the stack holds a
//! second clone that keeps the value alive until the owning scope pops (at
//! which point an optional release callback runs and the stack's clone is
//! dropped).

use std::any::Any;
use std::cell::RefCell;
use std::sync::Arc;

enum Entry {
    /// A scope boundary marker.
    Sentinel,
    Object {
        value: Arc<dyn Any + Send + Sync>,
        release: Option<Box<dyn FnOnce(Arc<dyn Any + Send + Sync>)>>,
    },
}

thread_local! {
    static STACK: RefCell<Vec<Entry>> = RefCell::new(Vec::new());
}

fn run_release(entry: Entry) {
    if let Entry::Object { value, release } = entry {
        match release {
            Some(f) => f(value),
            None => drop(value),
        }
    }
}

/// Pushes a new scope boundary. Returns the stack index of the sentinel so a
/// matching [`scope_pop`] knows how far down to unwind. Returns `-1` if the
/// stack was empty.
pub fn scope_push() -> i64 {
    STACK.with(|s| {
        let mut s = s.borrow_mut();
        if s.is_empty() {
            s.push(Entry::Sentinel);
            return -1;
        }
        s.push(Entry::Sentinel);
        (s.len() - 1) as i64
    })
}

/// Pops entries from the top of the stack down to and including the
/// sentinel at `scope_id`, releasing each popped object in LIFO order.
pub fn scope_pop(scope_id: i64) {
    STACK.with(|s| loop {
        let entry = {
            let mut s = s.borrow_mut();
            if scope_id >= 0 && (s.len() as i64) <= scope_id {
                break;
            }
            s.pop()
        };
        match entry {
            Some(Entry::Sentinel) => break,
            Some(obj @ Entry::Object { .. }) => run_release(obj),
            None => break,
        }
    });
}

/// Pops and releases a single non-sentinel entry; stops (without popping) at
/// a sentinel.
pub fn scope_pop_one() {
    STACK.with(|s| {
        let at_sentinel_or_empty = matches!(s.borrow().last(), Some(Entry::Sentinel) | None);
        if at_sentinel_or_empty {
            return;
        }
        if let Some(entry) = s.borrow_mut().pop() {
            run_release(entry);
        }
    });
}

/// Pushes `object` with an optional release callback and returns the same
/// handle back to the caller.
pub fn auto_call<T: Any + Send + Sync>(
    object: Arc<T>,
    release: Option<Box<dyn FnOnce(Arc<T>)>>,
) -> Arc<T> {
    let stack_clone: Arc<dyn Any + Send + Sync> = object.clone();
    let release = release.map(|f| -> Box<dyn FnOnce(Arc<dyn Any + Send + Sync>)> {
        Box::new(move |value| {
            if let Ok(typed) = value.downcast::<T>() {
                f(typed);
            }
        })
    });
    STACK.with(|s| {
        s.borrow_mut().push(Entry::Object {
            value: stack_clone,
            release,
        })
    });
    object
}

/// Shorthand for `auto_call(object, None)`.
pub fn autorelease<T: Any + Send + Sync>(object: Arc<T>) -> Arc<T> {
    auto_call(object, None)
}

/// RAII guard: `AutoScope::enter()` pushes a scope; `Drop` pops it.
pub struct AutoScope {
    scope_id: i64,
}

impl AutoScope {
    pub fn enter() -> Self {
        AutoScope {
            scope_id: scope_push(),
        }
    }
}

impl Drop for AutoScope {
    fn drop(&mut self) {
        scope_pop(self.scope_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[test]
    fn scope_pop_releases_in_lifo_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let scope = scope_push();
        for i in 0..3 {
            let order = order.clone();
            auto_call(
                Arc::new(i),
                Some(Box::new(move |v: Arc<i32>| order.lock().unwrap().push(*v))),
            );
        }
        scope_pop(scope);
        assert_eq!(*order.lock().unwrap(), vec![2, 1, 0]);
    }

    #[test]
    fn auto_scope_guard_pops_on_drop() {
        let released = Arc::new(AtomicUsize::new(0));
        {
            let _scope = AutoScope::enter();
            let released = released.clone();
            auto_call(
                Arc::new(()),
                Some(Box::new(move |_| {
                    released.fetch_add(1, Ordering::SeqCst);
                })),
            );
        }
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn scope_pop_one_stops_at_sentinel() {
        let scope = scope_push();
        autorelease(Arc::new(1u32));
        scope_pop_one();
        // nothing left above the sentinel; a further pop_one is a no-op.
        scope_pop_one();
        scope_pop(scope);
    }
}
