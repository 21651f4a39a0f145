//! Bidirectional reactive bridge between a socket pair and a relay endpoint.
//!
//! A `socketpair(2)` (here `UnixStream::pair`), a one-byte handshake in both
//! directions so each opener's first "auth" read is pre-satisfied, and two
//! [`WatchedHandle`]s — one wrapping the socket-pair end, one wrapping the
//! relay endpoint — copying messages between each other through a pair of
//! reactor fd watchers per side. The watcher dance: on read success, try a
//! non-blocking send to the peer; if the peer would block, requeue the
//! message on the read side, stop that side's read watcher, and start the
//! peer's write watcher, which (on firing once) stops itself and re-enables
//! the original read watcher — backpressure with no polling.

use crate::error::{CoreError, Result, Status};
use crate::itransport::{self, Flags, Matcher, Message, RequeuePosition};
use crate::reactor::{FdId, PollMask, Reactor};
use parking_lot::Mutex;
use std::io::{ErrorKind, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Weak};

/// Per-side counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    pub sends: u64,
    pub recvs: u64,
    pub send_errors: u64,
    pub recv_errors: u64,
    pub requeue_errors: u64,
    pub stalls: u64,
}

/// Outcome of a non-blocking send attempt: either consumed, or handed back
/// unsent so the caller can requeue it.
enum SendOutcome {
    Sent,
    WouldBlock(Message),
}

/// The minimal surface a `msgchannel` side needs: non-blocking recv/send, a
/// single-slot requeue (for the one message that may be in flight when the
/// peer stalls), and a pollable fd to drive from the reactor.
trait ChannelSide: Send + Sync {
    fn try_recv(&self) -> Result<Option<Message>>;
    fn try_send(&self, msg: Message) -> Result<SendOutcome>;
    fn requeue_front(&self, msg: Message) -> Result<()>;
    fn raw_fd(&self) -> RawFd;
}

impl ChannelSide for itransport::Endpoint {
    fn try_recv(&self) -> Result<Option<Message>> {
        match self.recv(&Matcher::Any, Flags::NONBLOCK) {
            Ok(msg) => Ok(Some(msg)),
            Err(e) if e.status() == Status::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn try_send(&self, msg: Message) -> Result<SendOutcome> {
        match self.send(msg.clone(), Flags::NONBLOCK) {
            Ok(()) => Ok(SendOutcome::Sent),
            Err(e) if e.status() == Status::WouldBlock => Ok(SendOutcome::WouldBlock(msg)),
            Err(e) => Err(e),
        }
    }

    fn requeue_front(&self, msg: Message) -> Result<()> {
        self.requeue(msg, RequeuePosition::Head)
    }

    fn raw_fd(&self) -> RawFd {
        self.pollfd()
    }
}

/// Writes `u32` length-prefixed topic/payload/route fields. This is the
/// msgchannel's own wire format for the `fd://` socket side — intentionally
/// small and independent of any higher-level RPC encoding; this framing only
/// carries a [`Message`] across a raw byte stream, nothing more. Public
/// because whatever opens the `fd://` URI (typically a subprocess) needs to
/// speak it.
pub fn encode_message(msg: &Message) -> Vec<u8> {
    let mut body = Vec::new();
    push_u32(&mut body, msg.topic.len() as u32);
    body.extend_from_slice(msg.topic.as_bytes());
    match &msg.payload {
        Some(p) => {
            body.push(1);
            push_u32(&mut body, p.len() as u32);
            body.extend_from_slice(p);
        }
        None => body.push(0),
    }
    push_u32(&mut body, msg.route.len() as u32);
    for r in &msg.route {
        push_u32(&mut body, r.len() as u32);
        body.extend_from_slice(r.as_bytes());
    }
    let mut frame = Vec::with_capacity(4 + body.len());
    push_u32(&mut frame, body.len() as u32);
    frame.extend_from_slice(&body);
    frame
}

/// Attempts to decode one complete frame from the front of `buf`. Returns
/// `Ok(None)` if `buf` doesn't yet hold a whole frame.
pub fn try_decode_frame(buf: &[u8]) -> Result<Option<(Message, usize)>> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let len = read_u32(&buf[0..4]) as usize;
    if buf.len() < 4 + len {
        return Ok(None);
    }
    let body = &buf[4..4 + len];
    let mut pos = 0usize;
    let topic_len = take_u32(body, &mut pos)? as usize;
    let topic = take_str(body, &mut pos, topic_len)?;
    let has_payload = take_u8(body, &mut pos)?;
    let payload = if has_payload == 1 {
        let plen = take_u32(body, &mut pos)? as usize;
        Some(take_bytes(body, &mut pos, plen)?)
    } else {
        None
    };
    let route_count = take_u32(body, &mut pos)? as usize;
    let mut route = Vec::with_capacity(route_count);
    for _ in 0..route_count {
        let rlen = take_u32(body, &mut pos)? as usize;
        route.push(take_str(body, &mut pos, rlen)?);
    }
    Ok(Some((Message { topic, payload, route }, 4 + len)))
}

fn push_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn malformed() -> CoreError {
    CoreError::invalid("malformed msgchannel frame")
}

fn take_u32(body: &[u8], pos: &mut usize) -> Result<u32> {
    if *pos + 4 > body.len() {
        return Err(malformed());
    }
    let v = read_u32(&body[*pos..*pos + 4]);
    *pos += 4;
    Ok(v)
}

fn take_u8(body: &[u8], pos: &mut usize) -> Result<u8> {
    if *pos + 1 > body.len() {
        return Err(malformed());
    }
    let v = body[*pos];
    *pos += 1;
    Ok(v)
}

fn take_bytes(body: &[u8], pos: &mut usize, len: usize) -> Result<Vec<u8>> {
    if *pos + len > body.len() {
        return Err(malformed());
    }
    let v = body[*pos..*pos + len].to_vec();
    *pos += len;
    Ok(v)
}

fn take_str(body: &[u8], pos: &mut usize, len: usize) -> Result<String> {
    let bytes = take_bytes(body, pos, len)?;
    String::from_utf8(bytes).map_err(|_| malformed())
}

/// The socket-pair side: a length-prefixed framing over a non-blocking
/// [`UnixStream`], with a one-message requeue slot for the case where the
/// peer stalled mid-delivery.
struct SocketSide {
    stream: UnixStream,
    read_buf: Mutex<Vec<u8>>,
    write_buf: Mutex<Vec<u8>>,
    requeued: Mutex<Option<Message>>,
}

impl SocketSide {
    fn new(stream: UnixStream) -> Result<Self> {
        stream
            .set_nonblocking(true)
            .map_err(|e| CoreError::invalid("failed to set socket nonblocking").with_cause(e))?;
        Ok(SocketSide {
            stream,
            read_buf: Mutex::new(Vec::new()),
            write_buf: Mutex::new(Vec::new()),
            requeued: Mutex::new(None),
        })
    }

    fn flush_write_buf(&self, wbuf: &mut Vec<u8>) -> Result<()> {
        let mut sent = 0;
        loop {
            if sent == wbuf.len() {
                break;
            }
            match (&self.stream).write(&wbuf[sent..]) {
                Ok(0) => return Err(CoreError::connection_reset("msgchannel socket write returned 0")),
                Ok(n) => sent += n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    return Err(CoreError::connection_reset("msgchannel socket write failed").with_cause(e))
                }
            }
        }
        wbuf.drain(..sent);
        Ok(())
    }
}

impl ChannelSide for SocketSide {
    fn try_recv(&self) -> Result<Option<Message>> {
        if let Some(msg) = self.requeued.lock().take() {
            return Ok(Some(msg));
        }
        let mut rbuf = self.read_buf.lock();
        let mut tmp = [0u8; 4096];
        loop {
            match (&self.stream).read(&mut tmp) {
                Ok(0) => return Err(CoreError::connection_reset("msgchannel socket peer closed")),
                Ok(n) => {
                    rbuf.extend_from_slice(&tmp[..n]);
                    if n < tmp.len() {
                        break;
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    return Err(CoreError::connection_reset("msgchannel socket read failed").with_cause(e))
                }
            }
        }
        if let Some((msg, consumed)) = try_decode_frame(&rbuf)? {
            rbuf.drain(..consumed);
            return Ok(Some(msg));
        }
        Ok(None)
    }

    fn try_send(&self, msg: Message) -> Result<SendOutcome> {
        let mut wbuf = self.write_buf.lock();
        if !wbuf.is_empty() {
            self.flush_write_buf(&mut wbuf)?;
            if !wbuf.is_empty() {
                return Ok(SendOutcome::WouldBlock(msg));
            }
        }
        wbuf.extend_from_slice(&encode_message(&msg));
        self.flush_write_buf(&mut wbuf)?;
        Ok(SendOutcome::Sent)
    }

    fn requeue_front(&self, msg: Message) -> Result<()> {
        let mut slot = self.requeued.lock();
        if slot.is_some() {
            return Err(CoreError::no_space("msgchannel socket side already has a requeued message"));
        }
        *slot = Some(msg);
        Ok(())
    }

    fn raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

/// One side of the bridge: the transport plus its watchers, stats, and a
/// weak back-reference to the other side.
struct WatchedHandle {
    side: Arc<dyn ChannelSide>,
    reactor: Arc<dyn Reactor>,
    stats: Mutex<Stats>,
    read_id: FdId,
    write_id: FdId,
    peer: Mutex<Weak<WatchedHandle>>,
}

impl WatchedHandle {
    fn new(reactor: Arc<dyn Reactor>, side: Arc<dyn ChannelSide>) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| {
            let fd = side.raw_fd();
            let read_weak = weak_self.clone();
            let read_id = reactor.add_fd_watcher(
                fd,
                PollMask::readable(),
                Box::new(move |_mask| WatchedHandle::on_readable(&read_weak)),
            );
            let write_weak = weak_self.clone();
            let write_id = reactor.add_fd_watcher(
                fd,
                PollMask::NONE,
                Box::new(move |_mask| WatchedHandle::on_writable(&write_weak)),
            );
            WatchedHandle {
                side,
                reactor,
                stats: Mutex::new(Stats::default()),
                read_id,
                write_id,
                peer: Mutex::new(Weak::new()),
            }
        })
    }

    fn wire_peers(a: &Arc<WatchedHandle>, b: &Arc<WatchedHandle>) {
        *a.peer.lock() = Arc::downgrade(b);
        *b.peer.lock() = Arc::downgrade(a);
    }

    fn stop_read(&self) {
        self.reactor.set_fd_interest(self.read_id, PollMask::NONE);
    }

    fn start_read(&self) {
        self.reactor.set_fd_interest(self.read_id, PollMask::readable());
    }

    fn stop_write(&self) {
        self.reactor.set_fd_interest(self.write_id, PollMask::NONE);
    }

    fn start_write(&self) {
        self.reactor.set_fd_interest(self.write_id, PollMask::writable());
    }

    fn on_readable(weak: &Weak<WatchedHandle>) {
        let Some(me) = weak.upgrade() else { return };
        match me.side.try_recv() {
            Ok(Some(msg)) => {
                me.stats.lock().recvs += 1;
                let Some(peer) = me.peer.lock().upgrade() else { return };
                match peer.side.try_send(msg) {
                    Ok(SendOutcome::Sent) => peer.stats.lock().sends += 1,
                    Ok(SendOutcome::WouldBlock(msg)) => {
                        me.stats.lock().stalls += 1;
                        if me.side.requeue_front(msg).is_err() {
                            me.stats.lock().requeue_errors += 1;
                        }
                        me.stop_read();
                        peer.start_write();
                    }
                    Err(_) => peer.stats.lock().send_errors += 1,
                }
            }
            Ok(None) => {}
            Err(_) => me.stats.lock().recv_errors += 1,
        }
    }

    fn on_writable(weak: &Weak<WatchedHandle>) {
        let Some(me) = weak.upgrade() else { return };
        me.stop_write();
        if let Some(peer) = me.peer.lock().upgrade() {
            peer.start_read();
        }
    }

    fn snapshot(&self) -> Stats {
        *self.stats.lock()
    }
}

impl Drop for WatchedHandle {
    fn drop(&mut self) {
        self.reactor.remove_fd_watcher(self.read_id);
        self.reactor.remove_fd_watcher(self.write_id);
    }
}

/// A snapshot of both sides' counters, as returned by [`MsgChan::get_stats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ChannelStats {
    pub fd_side: Stats,
    pub relay_side: Stats,
}

/// Bridges a fresh socket pair to a relay endpoint, copying messages
/// bidirectionally between them under reactor-driven backpressure.
pub struct MsgChan {
    fd_handle: Arc<WatchedHandle>,
    relay_handle: Arc<WatchedHandle>,
    fduri: String,
    subprocess_sock: UnixStream,
}

impl MsgChan {
    /// `relay_uri` is opened through [`crate::itransport::open`] (any other
    /// relay scheme would need its own `ChannelSide` impl; the core only
    /// ships the interthread one). `get_uri`/`get_fd` expose the socket
    /// pair's other end for handing to a subprocess.
    pub fn create(reactor: Arc<dyn Reactor>, relay_uri: &str) -> Result<MsgChan> {
        if relay_uri.is_empty() {
            return Err(CoreError::invalid("msgchannel requires a non-empty relay URI"));
        }
        let (server_sock, subprocess_sock) = UnixStream::pair()
            .map_err(|e| CoreError::invalid("failed to create socketpair").with_cause(e))?;

        // One-byte handshake, both directions, before switching to
        // non-blocking I/O: pre-satisfies each opener's first "auth" read.
        (&server_sock)
            .write_all(&[0u8])
            .map_err(|e| CoreError::invalid("msgchannel handshake write failed").with_cause(e))?;
        (&subprocess_sock)
            .write_all(&[0u8])
            .map_err(|e| CoreError::invalid("msgchannel handshake write failed").with_cause(e))?;
        let mut ack = [0u8; 1];
        (&server_sock)
            .read_exact(&mut ack)
            .map_err(|e| CoreError::invalid("msgchannel handshake read failed").with_cause(e))?;
        (&subprocess_sock)
            .read_exact(&mut ack)
            .map_err(|e| CoreError::invalid("msgchannel handshake read failed").with_cause(e))?;

        let relay = itransport::open(relay_uri)
            .map_err(|e| CoreError::invalid(format!("failed to open relay '{relay_uri}'")).with_cause(e))?;

        let fduri = format!("fd://{}", subprocess_sock.as_raw_fd());
        let socket_side: Arc<dyn ChannelSide> = Arc::new(SocketSide::new(server_sock)?);
        let relay_side: Arc<dyn ChannelSide> = Arc::new(relay);

        let fd_handle = WatchedHandle::new(reactor.clone(), socket_side);
        let relay_handle = WatchedHandle::new(reactor, relay_side);
        WatchedHandle::wire_peers(&fd_handle, &relay_handle);

        Ok(MsgChan { fd_handle, relay_handle, fduri, subprocess_sock })
    }

    /// The `fd://` URI for the subprocess side of the socket pair.
    pub fn get_uri(&self) -> &str {
        &self.fduri
    }

    /// The raw descriptor backing [`MsgChan::get_uri`].
    pub fn get_fd(&self) -> RawFd {
        self.subprocess_sock.as_raw_fd()
    }

    /// A duplicate handle on the subprocess side, e.g. to hand off to a
    /// child process or drive directly in a test without touching the fd
    /// this struct keeps open.
    pub fn try_clone_subprocess_stream(&self) -> Result<UnixStream> {
        self.subprocess_sock
            .try_clone()
            .map_err(|e| CoreError::invalid("failed to duplicate subprocess socket").with_cause(e))
    }

    pub fn get_stats(&self) -> ChannelStats {
        ChannelStats { fd_side: self.fd_handle.snapshot(), relay_side: self.relay_handle.snapshot() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::tokio_reactor::TokioReactor;
    use std::time::Duration;

    fn reactor() -> Arc<dyn Reactor> {
        Arc::new(TokioReactor::new().unwrap())
    }

    #[test]
    fn frame_round_trips_through_encode_decode() {
        let msg = Message { topic: "foo.bar".into(), payload: Some(b"baz".to_vec()), route: vec!["r1".into()] };
        let frame = encode_message(&msg);
        let (decoded, consumed) = try_decode_frame(&frame).unwrap().unwrap();
        assert_eq!(consumed, frame.len());
        assert_eq!(decoded, msg);
    }

    #[test]
    fn incomplete_frame_is_not_yet_decodable() {
        let msg = Message::new("foo.bar", Some(b"baz".to_vec()));
        let frame = encode_message(&msg);
        assert!(try_decode_frame(&frame[..frame.len() - 1]).unwrap().is_none());
    }

    #[test]
    fn socket_to_relay_bridges_one_message() {
        let reactor = reactor();
        let relay_peer = itransport::open("interthread://msgchan-bridge-1").unwrap();
        let chan = MsgChan::create(reactor.clone(), "interthread://msgchan-bridge-1").unwrap();

        let mut client = chan.try_clone_subprocess_stream().unwrap();
        let msg = Message::new("ping", Some(b"payload".to_vec()));
        client.write_all(&encode_message(&msg)).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        let got = loop {
            reactor.run_once().unwrap();
            match relay_peer.recv(&Matcher::Any, Flags::NONBLOCK) {
                Ok(got) => break got,
                Err(_) if std::time::Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(5));
                    continue;
                }
                Err(e) => panic!("message never arrived at relay: {e}"),
            }
        };
        assert_eq!(got.topic, "ping");
        assert_eq!(got.payload, Some(b"payload".to_vec()));
        let stats = chan.get_stats();
        assert!(stats.fd_side.recvs >= 1);
        assert!(stats.relay_side.sends >= 1);
    }
}
