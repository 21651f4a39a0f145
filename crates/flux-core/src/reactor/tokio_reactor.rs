//! The shipped [`Reactor`] backend, built on a single-threaded Tokio
//! runtime, behind the `runtime-tokio` feature: the core crate stays
//! generic over the `Reactor` trait, and this module is the one place a
//! concrete async runtime is named.

use super::{FdCallback, FdId, PollMask, Reactor, TimerCallback, TimerId, TimerSpec};
use crate::error::{CoreError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::unix::AsyncFd;
use tokio::runtime::Runtime;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

enum Event {
    TimerFired(TimerId),
    FdReady(FdId, PollMask),
}

struct BorrowedFd(RawFd);

impl AsRawFd for BorrowedFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

struct TimerEntry {
    callback: TimerCallback,
    _task: JoinHandle<()>,
}

struct FdEntry {
    callback: FdCallback,
    interest: Arc<Mutex<PollMask>>,
    _task: JoinHandle<()>,
}

/// A [`Reactor`] driven by a dedicated current-thread Tokio runtime.
///
/// Only `run`/`run_once` block; registration methods (`add_timer`,
/// `add_fd_watcher`, ...) are plain synchronous calls that may be made from
/// inside a watcher callback.
pub struct TokioReactor {
    rt: Runtime,
    next_id: AtomicU64,
    stop: AtomicBool,
    stop_err: Mutex<Option<CoreError>>,
    events_tx: mpsc::UnboundedSender<Event>,
    events_rx: Mutex<mpsc::UnboundedReceiver<Event>>,
    timers: Mutex<HashMap<TimerId, TimerEntry>>,
    fds: Mutex<HashMap<FdId, FdEntry>>,
}

impl std::fmt::Debug for TokioReactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokioReactor")
            .field("timers", &self.timers.lock().len())
            .field("fds", &self.fds.lock().len())
            .finish()
    }
}

impl TokioReactor {
    pub fn new() -> Result<Self> {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| CoreError::invalid("failed to start tokio runtime").with_cause(e))?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Ok(TokioReactor {
            rt,
            next_id: AtomicU64::new(1),
            stop: AtomicBool::new(false),
            stop_err: Mutex::new(None),
            events_tx,
            events_rx: Mutex::new(events_rx),
            timers: Mutex::new(HashMap::new()),
            fds: Mutex::new(HashMap::new()),
        })
    }

    fn dispatch(&self, event: Event) {
        match event {
            Event::TimerFired(id) => {
                let mut timers = self.timers.lock();
                let is_oneshot_and_gone = match timers.get_mut(&id) {
                    Some(entry) => {
                        (entry.callback)();
                        false
                    }
                    None => true,
                };
                let _ = is_oneshot_and_gone;
            }
            Event::FdReady(id, mask) => {
                let mut fds = self.fds.lock();
                if let Some(entry) = fds.get_mut(&id) {
                    (entry.callback)(mask);
                }
            }
        }
    }

    fn drain_ready(&self) {
        loop {
            let event = self.events_rx.lock().try_recv();
            match event {
                Ok(ev) => self.dispatch(ev),
                Err(_) => break,
            }
        }
    }
}

impl Reactor for TokioReactor {
    fn add_timer(&self, spec: TimerSpec, callback: TimerCallback) -> TimerId {
        let id = TimerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let tx = self.events_tx.clone();
        let task = self.rt.spawn(async move {
            tokio::time::sleep(spec.after).await;
            loop {
                if tx.send(Event::TimerFired(id)).is_err() {
                    return;
                }
                match spec.repeat {
                    Some(period) => tokio::time::sleep(period).await,
                    None => return,
                }
            }
        });
        self.timers.lock().insert(id, TimerEntry { callback, _task: task });
        id
    }

    fn remove_timer(&self, id: TimerId) {
        if let Some(entry) = self.timers.lock().remove(&id) {
            entry._task.abort();
        }
    }

    fn add_fd_watcher(&self, fd: RawFd, interest: PollMask, callback: FdCallback) -> FdId {
        let id = FdId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let interest = Arc::new(Mutex::new(interest));
        let tx = self.events_tx.clone();
        let interest_for_task = interest.clone();
        let task = self.rt.spawn(async move {
            let async_fd = match AsyncFd::new(BorrowedFd(fd)) {
                Ok(a) => a,
                Err(_) => return,
            };
            loop {
                let want = *interest_for_task.lock();
                if want.is_empty() {
                    tokio::task::yield_now().await;
                    continue;
                }
                let result = if want.poll_in && want.poll_out {
                    tokio::select! {
                        r = async_fd.readable() => r.map(|mut g| { g.clear_ready(); PollMask::readable() }),
                        r = async_fd.writable() => r.map(|mut g| { g.clear_ready(); PollMask::writable() }),
                    }
                } else if want.poll_in {
                    async_fd.readable().await.map(|mut g| { g.clear_ready(); PollMask::readable() })
                } else {
                    async_fd.writable().await.map(|mut g| { g.clear_ready(); PollMask::writable() })
                };
                match result {
                    Ok(mask) => {
                        if tx.send(Event::FdReady(id, mask)).is_err() {
                            return;
                        }
                    }
                    Err(_) => {
                        let _ = tx.send(Event::FdReady(
                            id,
                            PollMask { poll_err: true, ..PollMask::NONE },
                        ));
                        return;
                    }
                }
            }
        });
        self.fds.lock().insert(id, FdEntry { callback, interest, _task: task });
        id
    }

    fn set_fd_interest(&self, id: FdId, interest: PollMask) {
        if let Some(entry) = self.fds.lock().get(&id) {
            *entry.interest.lock() = interest;
        }
    }

    fn remove_fd_watcher(&self, id: FdId) {
        if let Some(entry) = self.fds.lock().remove(&id) {
            entry._task.abort();
        }
    }

    fn run_once(&self) -> Result<()> {
        self.rt.block_on(async {
            tokio::task::yield_now().await;
        });
        self.drain_ready();
        if let Some(err) = self.stop_err.lock().take() {
            return Err(err);
        }
        Ok(())
    }

    fn run(&self) -> Result<()> {
        self.stop.store(false, Ordering::SeqCst);
        loop {
            if self.stop.load(Ordering::SeqCst) {
                break;
            }
            self.rt.block_on(async {
                tokio::time::sleep(std::time::Duration::from_millis(1)).await;
            });
            self.drain_ready();
            if let Some(err) = self.stop_err.lock().take() {
                return Err(err);
            }
            if self.stop.load(Ordering::SeqCst) {
                break;
            }
        }
        Ok(())
    }

    fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    fn stop_with_error(&self, err: CoreError) {
        *self.stop_err.lock() = Some(err);
        self.stop.store(true, Ordering::SeqCst);
    }
}
