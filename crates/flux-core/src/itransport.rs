//! In-process, credit-flow-controlled message transport between two
//! cooperating threads.
//!
//! Two [`Endpoint`] handles opened on the same `"interthread://NAME"` URI
//! are bonded as peers, each with its own send/recv queue pair. A third open
//! on a name that already has two live peers fails with
//! [`Status::Exists`]-flavored `"address in use"`.
//!
//! Readiness is exposed as a process-local, edge-triggered fd
//! ([`Endpoint::pollfd`]): rather than reach for a raw `eventfd(2)` (which
//! would pull in `libc` for one syscall), the notifier is a loopback
//! `UnixStream` pair — one byte written on every state change the caller
//! should re-examine, drained in full by [`Endpoint::pollevents`] so the fd
//! goes non-readable again until the next change (edge-triggered, not
//! level-triggered).

use crate::error::{CoreError, Result, Status};
use crate::reactor::PollMask;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Weak};

/// One in-process message. `route` is the ordered stack of router names it
/// has traversed, pushed on a router-named send and popped when a response
/// is derived — message routing via a stack attached to each message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub payload: Option<Vec<u8>>,
    pub route: Vec<String>,
}

impl Message {
    pub fn new(topic: impl Into<String>, payload: Option<Vec<u8>>) -> Self {
        Message { topic: topic.into(), payload, route: Vec::new() }
    }

    /// The most recently pushed router name, or `None` if the message has
    /// never crossed a router-named handle.
    pub fn route_last(&self) -> Option<&str> {
        self.route.last().map(String::as_str)
    }

    /// Derives a response to this request: same topic, caller-supplied
    /// payload, and the route stack popped by one (the hop back toward the
    /// original sender).
    pub fn derive_response(&self, payload: Option<Vec<u8>>) -> Message {
        let mut route = self.route.clone();
        route.pop();
        Message { topic: self.topic.clone(), payload, route }
    }
}

/// Selects which queued message [`Endpoint::recv`] returns.
#[derive(Clone, Debug, Default)]
pub enum Matcher {
    #[default]
    Any,
    Topic(String),
}

impl Matcher {
    fn matches(&self, msg: &Message) -> bool {
        match self {
            Matcher::Any => true,
            Matcher::Topic(t) => msg.topic == *t,
        }
    }
}

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct Flags: u8 {
        const NONBLOCK = 0b01;
    }
}

/// Head or tail, for [`Endpoint::requeue`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequeuePosition {
    Head,
    Tail,
}

const DEFAULT_HWM: usize = 1024;

struct SideQueue {
    items: Mutex<VecDeque<Message>>,
    hwm: Mutex<usize>,
    closed: std::sync::atomic::AtomicBool,
    notify_write: UnixStream,
    notify_read: UnixStream,
    notify_cv: Condvar,
}

impl SideQueue {
    fn new() -> Result<Self> {
        let (notify_write, notify_read) = UnixStream::pair()
            .map_err(|e| CoreError::invalid("failed to create notifier pipe").with_cause(e))?;
        notify_read
            .set_nonblocking(true)
            .map_err(|e| CoreError::invalid("failed to set notifier pipe nonblocking").with_cause(e))?;
        Ok(SideQueue {
            items: Mutex::new(VecDeque::new()),
            hwm: Mutex::new(DEFAULT_HWM),
            closed: std::sync::atomic::AtomicBool::new(false),
            notify_write,
            notify_read,
            notify_cv: Condvar::new(),
        })
    }

    fn signal(&self) {
        let mut s = &self.notify_write;
        let _ = s.write(&[1]);
        self.notify_cv.notify_all();
    }
}

struct PairState {
    queues: [SideQueue; 2],
    router_name: [Mutex<Option<String>>; 2],
    opened_mask: std::sync::atomic::AtomicU8,
}

impl PairState {
    /// Wakes both sides' pollfds and condvars. Any push, pop, requeue, or
    /// close can change either side's "can I send"/"can I recv" answer, so
    /// rather than track exactly who needs waking, both are signalled and
    /// the (cheap) recomputation in `pollevents`/the recv loop settles it —
    /// an explicitly allowed spurious wake-up.
    fn signal_both(&self) {
        self.queues[0].signal();
        self.queues[1].signal();
    }
}

/// Process-wide table of named pairs, keyed by URI name. Entries live only
/// as long as at least one [`Endpoint`] for that name is alive; once both
/// sides drop, the name becomes reusable by a fresh `open`.
static REGISTRY: Mutex<Option<HashMap<String, Weak<PairState>>>> = Mutex::new(None);

fn registry() -> parking_lot::MutexGuard<'static, Option<HashMap<String, Weak<PairState>>>> {
    let mut guard = REGISTRY.lock();
    if guard.is_none() {
        *guard = Some(HashMap::new());
    }
    guard
}

/// A handle to one side of an interthread pair.
pub struct Endpoint {
    name: String,
    side: usize,
    pair: Arc<PairState>,
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint").field("name", &self.name).field("side", &self.side).finish()
    }
}

/// Opens (or joins) the named interthread pair. The first call for a given
/// name creates it; the second joins as the peer; a third fails with
/// `"address in use"`.
pub fn open(uri: &str) -> Result<Endpoint> {
    let name = uri
        .strip_prefix("interthread://")
        .ok_or_else(|| CoreError::invalid(format!("'{uri}' is not an interthread:// URI")))?
        .to_string();
    if name.is_empty() {
        return Err(CoreError::invalid("interthread:// URI requires a non-empty name"));
    }

    let mut reg = registry();
    let map = reg.as_mut().unwrap();

    if let Some(weak) = map.get(&name) {
        if let Some(pair) = weak.upgrade() {
            let mask = pair.opened_mask.load(std::sync::atomic::Ordering::SeqCst);
            if mask == 0b11 {
                return Err(CoreError::exists(format!(
                    "interthread://{name} already has two open peers (address in use)"
                )));
            }
            let side = if mask & 0b01 == 0 { 0 } else { 1 };
            pair.opened_mask.fetch_or(1 << side, std::sync::atomic::Ordering::SeqCst);
            return Ok(Endpoint { name, side, pair });
        }
        map.remove(&name);
    }

    let pair = Arc::new(PairState {
        queues: [SideQueue::new()?, SideQueue::new()?],
        router_name: [Mutex::new(None), Mutex::new(None)],
        opened_mask: std::sync::atomic::AtomicU8::new(0b01),
    });
    map.insert(name.clone(), Arc::downgrade(&pair));
    Ok(Endpoint { name, side: 0, pair })
}

impl Endpoint {
    fn own_queue(&self) -> &SideQueue {
        &self.pair.queues[self.side]
    }

    fn peer_queue(&self) -> &SideQueue {
        &self.pair.queues[1 - self.side]
    }

    /// Tags every subsequent send with `name` as a route-stack entry.
    pub fn set_router_name(&self, name: impl Into<String>) {
        *self.pair.router_name[self.side].lock() = Some(name.into());
    }

    pub fn set_send_hwm(&self, hwm: usize) {
        *self.peer_queue().hwm.lock() = hwm;
    }

    pub fn set_recv_hwm(&self, hwm: usize) {
        *self.own_queue().hwm.lock() = hwm;
    }

    pub fn send_queue_count(&self) -> usize {
        self.peer_queue().items.lock().len()
    }

    pub fn recv_queue_count(&self) -> usize {
        self.own_queue().items.lock().len()
    }

    /// Enqueues `msg` for the peer, tagging it with this handle's router
    /// name (or the `"self-peer-name"` default when none is set).
    pub fn send(&self, mut msg: Message, flags: Flags) -> Result<()> {
        if self.peer_queue().closed.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(CoreError::connection_reset("interthread peer has closed its end"));
        }
        let router_name = self.pair.router_name[self.side]
            .lock()
            .clone()
            .unwrap_or_else(|| "self-peer-name".to_string());
        msg.route.push(router_name);

        let peer = self.peer_queue();
        loop {
            {
                let mut items = peer.items.lock();
                let hwm = *peer.hwm.lock();
                if items.len() < hwm {
                    items.push_back(msg);
                    drop(items);
                    self.pair.signal_both();
                    return Ok(());
                }
            }
            if flags.contains(Flags::NONBLOCK) {
                return Err(CoreError::would_block("peer's recv queue is at its high-water mark"));
            }
            if peer.closed.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(CoreError::connection_reset("interthread peer has closed its end"));
            }
            let mut items = peer.items.lock();
            peer.notify_cv.wait(&mut items);
        }
    }

    /// Dequeues the next message matching `matcher` from this handle's own
    /// recv queue (messages the peer sent).
    pub fn recv(&self, matcher: &Matcher, flags: Flags) -> Result<Message> {
        loop {
            {
                let mut items = self.own_queue().items.lock();
                if let Some(pos) = items.iter().position(|m| matcher.matches(m)) {
                    let msg = items.remove(pos).unwrap();
                    drop(items);
                    self.pair.signal_both();
                    return Ok(msg);
                }
            }
            if self.peer_queue().closed.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(CoreError::connection_reset("interthread peer has closed its end"));
            }
            if flags.contains(Flags::NONBLOCK) {
                return Err(CoreError::would_block("own recv queue has no matching message"));
            }
            let mut items = self.own_queue().items.lock();
            self.own_queue().notify_cv.wait(&mut items);
        }
    }

    /// Pushes `msg` back onto this handle's own recv queue, at `position`.
    pub fn requeue(&self, msg: Message, position: RequeuePosition) -> Result<()> {
        let own = self.own_queue();
        let mut items = own.items.lock();
        let hwm = *own.hwm.lock();
        if items.len() >= hwm {
            return Err(CoreError::no_space("own recv queue is already at its high-water mark"));
        }
        match position {
            RequeuePosition::Head => items.push_front(msg),
            RequeuePosition::Tail => items.push_back(msg),
        }
        drop(items);
        self.pair.signal_both();
        Ok(())
    }

    /// A process-local fd that becomes readable whenever [`Endpoint::pollevents`]
    /// should be re-examined. Edge-triggered: reading `pollevents` drains it.
    pub fn pollfd(&self) -> RawFd {
        self.own_queue().notify_read.as_raw_fd()
    }

    /// Current level-triggered readiness, drained from [`Endpoint::pollfd`]'s
    /// notifier as a side effect.
    pub fn pollevents(&self) -> PollMask {
        let mut buf = [0u8; 64];
        loop {
            let mut s = &self.own_queue().notify_read;
            match s.read(&mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(_) => break,
            }
        }
        let recv_ready = !self.own_queue().items.lock().is_empty();
        let peer_closed = self.peer_queue().closed.load(std::sync::atomic::Ordering::SeqCst);
        let send_ready = {
            let items = self.peer_queue().items.lock();
            let hwm = *self.peer_queue().hwm.lock();
            items.len() < hwm
        };
        PollMask { poll_in: recv_ready, poll_out: send_ready && !peer_closed, poll_err: peer_closed }
    }

    /// Blocks until the peer's recv queue has room (a "get-credit" request),
    /// or returns immediately if it already does.
    pub fn get_credit(&self) {
        let peer = self.peer_queue();
        loop {
            let mut items = peer.items.lock();
            let hwm = *peer.hwm.lock();
            if items.len() < hwm || peer.closed.load(std::sync::atomic::Ordering::SeqCst) {
                return;
            }
            peer.notify_cv.wait(&mut items);
        }
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.own_queue().closed.store(true, std::sync::atomic::Ordering::SeqCst);
        self.pair.signal_both();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_preserves_payload_equality() {
        let a = open("interthread://t-roundtrip").unwrap();
        let b = open("interthread://t-roundtrip").unwrap();
        let msg = Message::new("foo.bar", Some(b"baz".to_vec()));
        a.send(msg.clone(), Flags::empty()).unwrap();
        let got = b.recv(&Matcher::Any, Flags::empty()).unwrap();
        assert_eq!(got.topic, msg.topic);
        assert_eq!(got.payload, msg.payload);
    }

    #[test]
    fn fifo_per_direction() {
        let a = open("interthread://t-fifo").unwrap();
        let b = open("interthread://t-fifo").unwrap();
        for i in 0..16 {
            a.send(Message::new(format!("m.{i}"), None), Flags::empty()).unwrap();
        }
        for i in 0..16 {
            let got = b.recv(&Matcher::Any, Flags::empty()).unwrap();
            assert_eq!(got.topic, format!("m.{i}"));
        }
    }

    #[test]
    fn third_open_fails_address_in_use() {
        let _a = open("interthread://t-triple").unwrap();
        let _b = open("interthread://t-triple").unwrap();
        let err = open("interthread://t-triple").unwrap_err();
        assert_eq!(err.status(), Status::Exists);
    }

    #[test]
    fn send_at_hwm_would_block_until_drained() {
        let a = open("interthread://t-hwm").unwrap();
        let b = open("interthread://t-hwm").unwrap();
        a.set_send_hwm(2);
        a.send(Message::new("x", None), Flags::empty()).unwrap();
        a.send(Message::new("x", None), Flags::empty()).unwrap();
        let err = a.send(Message::new("x", None), Flags::NONBLOCK).unwrap_err();
        assert_eq!(err.status(), Status::WouldBlock);
        b.recv(&Matcher::Any, Flags::empty()).unwrap();
        a.send(Message::new("x", None), Flags::NONBLOCK).unwrap();
    }

    #[test]
    fn router_name_tags_route_stack_and_response_pops_it() {
        let a = open("interthread://t-router").unwrap();
        let b = open("interthread://t-router").unwrap();
        a.set_router_name("testrouter");
        a.send(Message::new("foo.bar", None), Flags::empty()).unwrap();
        let req = b.recv(&Matcher::Any, Flags::empty()).unwrap();
        assert_eq!(req.route_last(), Some("testrouter"));
        let resp = req.derive_response(None);
        assert!(resp.route.is_empty());
    }

    #[test]
    fn unnamed_handle_shows_self_peer_name() {
        let a = open("interthread://t-unnamed").unwrap();
        let b = open("interthread://t-unnamed").unwrap();
        a.send(Message::new("foo.bar", None), Flags::empty()).unwrap();
        let req = b.recv(&Matcher::Any, Flags::empty()).unwrap();
        assert_eq!(req.route_last(), Some("self-peer-name"));
    }

    #[test]
    fn requeue_at_head_is_seen_first() {
        let a = open("interthread://t-requeue").unwrap();
        let b = open("interthread://t-requeue").unwrap();
        a.send(Message::new("first", None), Flags::empty()).unwrap();
        a.send(Message::new("second", None), Flags::empty()).unwrap();
        let first = b.recv(&Matcher::Any, Flags::empty()).unwrap();
        b.requeue(first.clone(), RequeuePosition::Head).unwrap();
        let got = b.recv(&Matcher::Any, Flags::empty()).unwrap();
        assert_eq!(got.topic, "first");
    }

    #[test]
    fn send_after_peer_drop_is_connection_reset() {
        let a = open("interthread://t-reset").unwrap();
        let b = open("interthread://t-reset").unwrap();
        drop(b);
        let err = a.send(Message::new("x", None), Flags::empty()).unwrap_err();
        assert_eq!(err.status(), Status::ConnectionReset);
    }
}
