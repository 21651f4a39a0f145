//! Reactor glue shared by the future, reduction, interthread and
//! message-channel modules.
//!
//! The core algorithms never talk to an OS event loop directly; they only
//! depend on the [`Reactor`] trait below, the same seam transport logic
//! elsewhere puts between itself and `runtime-tokio`. One concrete,
//! runnable backend is shipped ([`tokio_reactor::TokioReactor`]) behind the
//! `runtime-tokio` feature so the crate is not purely abstract, but anything
//! implementing `Reactor` (a test double, a different async runtime) can
//! drive the rest of the crate.

#[cfg(feature = "runtime-tokio")]
pub mod tokio_reactor;

use crate::error::Result;
use std::fmt;
use std::time::Duration;

/// Readiness bitset for a watched file descriptor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PollMask {
    pub poll_in: bool,
    pub poll_out: bool,
    pub poll_err: bool,
}

impl PollMask {
    pub const NONE: PollMask = PollMask { poll_in: false, poll_out: false, poll_err: false };

    pub fn readable() -> Self {
        PollMask { poll_in: true, ..PollMask::NONE }
    }

    pub fn writable() -> Self {
        PollMask { poll_out: true, ..PollMask::NONE }
    }

    pub fn is_empty(self) -> bool {
        !self.poll_in && !self.poll_out && !self.poll_err
    }
}

/// Opaque handle to a registered timer watcher.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TimerId(pub(crate) u64);

/// Opaque handle to a registered fd watcher.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FdId(pub(crate) u64);

/// A repeating or one-shot timer registration.
#[derive(Clone, Copy, Debug)]
pub struct TimerSpec {
    pub after: Duration,
    /// `None` means one-shot; `Some(period)` re-arms after each firing.
    pub repeat: Option<Duration>,
}

impl TimerSpec {
    pub fn once(after: Duration) -> Self {
        TimerSpec { after, repeat: None }
    }

    pub fn repeating(after: Duration, period: Duration) -> Self {
        TimerSpec { after, repeat: Some(period) }
    }
}

/// Callback invoked when a timer fires.
pub type TimerCallback = Box<dyn FnMut() + Send + 'static>;

/// Callback invoked when a watched fd's readiness matches its interest mask.
pub type FdCallback = Box<dyn FnMut(PollMask) + Send + 'static>;

/// The event loop contract every primitive in this crate is generic over.
///
/// Implementations are single-threaded with respect to callback dispatch:
/// `run_once`/`run` never invoke two watcher callbacks concurrently, so
/// futures and reductions driven by a reactor never fire reentrantly.
pub trait Reactor: fmt::Debug + Send + Sync {
    /// Registers a timer per `spec`; `cb` fires on expiry (and again on each
    /// repeat, if any).
    fn add_timer(&self, spec: TimerSpec, cb: TimerCallback) -> TimerId;

    /// Cancels a previously registered timer. Idempotent.
    fn remove_timer(&self, id: TimerId);

    /// Registers interest in `fd` per `interest`; `cb` fires with the
    /// observed readiness whenever it overlaps `interest`.
    fn add_fd_watcher(&self, fd: std::os::fd::RawFd, interest: PollMask, cb: FdCallback) -> FdId;

    /// Updates the interest mask for an already-registered fd watcher.
    fn set_fd_interest(&self, id: FdId, interest: PollMask);

    /// Cancels a previously registered fd watcher. Idempotent.
    fn remove_fd_watcher(&self, id: FdId);

    /// Runs the loop until no watcher remains ready or armed in the near
    /// term, then returns without blocking indefinitely.
    fn run_once(&self) -> Result<()>;

    /// Runs until [`Reactor::stop`] / [`Reactor::stop_with_error`] is called.
    fn run(&self) -> Result<()>;

    /// Requests that the current or next `run` call return `Ok(())`.
    fn stop(&self);

    /// Requests that the current or next `run` call return `Err(err)`.
    fn stop_with_error(&self, err: crate::error::CoreError);
}
