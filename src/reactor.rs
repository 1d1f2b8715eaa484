//! The event loop for the readiness-poller back-end.
//!
//! One OS thread drives the loop. Each poll tick it waits for readiness,
//! fires the tick callback when due, expires dial timeouts, and dispatches
//! every ready token through the per-connection state machine
//! (accept → opened → read → write → close). All connection state lives
//! behind a single mutex; the lock is held for state transitions and
//! released for the duration of every user callback, so callbacks may
//! re-enter the loop through [`Server::wake`] and [`Server::dial`].

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, error, trace, warn};
use mio::{Interest, Registry, Token, Waker};

use crate::addr::parse_addr;
use crate::conn::{ConnTable, Connection, DetachedStream, Stream};
use crate::error::{Error, Result};
use crate::event::{Action, Addr, Events, Info};
use crate::listener::{resolve_ip, Listener};
use crate::poll::{self, Poller, WAKE};
use crate::server::{Control, Server};
use crate::timeout::TimeoutQueue;

/// Upper bound on a single read.
const READ_BUF_SIZE: usize = 64 * 1024;

/// The poll timeout never exceeds this, so wake notes and timer drift are
/// observed promptly even with a distant tick deadline.
const MAX_POLL_INTERVAL: Duration = Duration::from_millis(250);

const EVENTS_CAPACITY: usize = 256;

/// Loop-wide mutable state. One mutex guards all of it.
struct State {
    conns: ConnTable,
    /// Ids with a pending wake, in arrival order.
    wakes: Vec<u64>,
    timeouts: TimeoutQueue,
    done: bool,
}

/// State shared with [`Server`] handles on other threads.
struct Shared {
    state: Mutex<State>,
    registry: Registry,
    waker: Arc<Waker>,
}

impl Control for Shared {
    fn wake(&self, id: u64) -> bool {
        let mut guard = self.state.lock().unwrap();
        let st = &mut *guard;
        if st.done {
            return false;
        }
        match st.conns.get_mut(id) {
            Some(conn) => {
                if !conn.wake {
                    conn.wake = true;
                    st.wakes.push(id);
                }
            }
            None => return false,
        }
        drop(guard);
        let _ = self.waker.wake();
        true
    }

    fn dial(&self, addr: &str, timeout: Option<Duration>) -> Result<u64> {
        let parsed = parse_addr(addr)?;
        if parsed.kind.is_udp() {
            return Err(Error::Unsupported("dial is not available for udp"));
        }
        let mut stream = if parsed.kind.is_unix() {
            Stream::Unix(mio::net::UnixStream::connect(&parsed.address)?)
        } else {
            let sa = resolve_ip(parsed.kind, &parsed.address)?;
            Stream::Tcp(mio::net::TcpStream::connect(sa)?)
        };

        let mut guard = self.state.lock().unwrap();
        let st = &mut *guard;
        if st.done {
            return Err(Error::ServerClosed);
        }
        let id = st.conns.alloc_id();
        // Write-readiness reports connect completion.
        stream.register(
            &self.registry,
            poll::conn_token(id),
            Interest::READABLE | Interest::WRITABLE,
        )?;
        let mut conn = Connection::new(id, stream, None);
        conn.opening = true;
        conn.write_on = true;
        if let Some(t) = timeout {
            st.timeouts.push(Instant::now() + t, id);
        }
        st.conns.insert(conn);
        drop(guard);
        let _ = self.waker.wake();
        Ok(id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Shutdown,
}

pub(crate) fn serve<E: Events>(events: &mut E, listeners: Vec<Listener>) -> Result<()> {
    let mut reactor = Reactor::new(listeners)?;
    reactor.run(events)
}

struct Reactor {
    poller: Poller,
    listeners: Vec<Listener>,
    shared: Arc<Shared>,
    server: Server,
    /// UDP virtual connections, keyed by (listener index, peer address).
    udp_peers: HashMap<(usize, SocketAddr), u64>,
    scratch: Box<[u8]>,
    next_tick: Instant,
}

impl Reactor {
    fn new(mut listeners: Vec<Listener>) -> Result<Self> {
        let poller = Poller::new(EVENTS_CAPACITY)?;
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                conns: ConnTable::new(),
                wakes: Vec::new(),
                timeouts: TimeoutQueue::default(),
                done: false,
            }),
            registry: poller.registry()?,
            waker: poller.waker(),
        });
        for (i, ln) in listeners.iter_mut().enumerate() {
            ln.register(&shared.registry, poll::listener_token(i))?;
        }
        let addrs = listeners.iter().map(|ln| ln.addr.clone()).collect();
        let server = Server::new(addrs, shared.clone());
        Ok(Reactor {
            poller,
            listeners,
            shared,
            server,
            udp_peers: HashMap::new(),
            scratch: vec![0u8; READ_BUF_SIZE].into_boxed_slice(),
            next_tick: Instant::now(),
        })
    }

    fn run<E: Events>(&mut self, events: &mut E) -> Result<()> {
        let result = self.run_inner(events);
        if let Err(e) = &result {
            error!("event loop failed: {e}");
        }
        self.shutdown_traversal(events);
        result
    }

    fn run_inner<E: Events>(&mut self, events: &mut E) -> Result<()> {
        if events.serving(&self.server) == Action::Shutdown {
            return Ok(());
        }
        loop {
            let timeout = self
                .next_tick
                .saturating_duration_since(Instant::now())
                .min(MAX_POLL_INTERVAL);
            let ready = self.poller.wait(timeout)?;

            if Instant::now() >= self.next_tick {
                let (delay, action) = events.tick();
                if action == Action::Shutdown {
                    return Ok(());
                }
                self.next_tick += delay;
            }

            if self.expire_dials(events) {
                // Expired dials closed sockets that may still be in this
                // readiness batch; drop it and wait again.
                continue;
            }

            for token in ready {
                let flow = self.dispatch(events, token)?;
                if flow == Flow::Shutdown {
                    return Ok(());
                }
            }
            // Wakes raised by callbacks in this batch are serviced without
            // waiting for the waker round-trip.
            if self.process_wakes(events)? == Flow::Shutdown {
                return Ok(());
            }
        }
    }

    fn dispatch<E: Events>(&mut self, events: &mut E, token: Token) -> Result<Flow> {
        if token == WAKE {
            return self.process_wakes(events);
        }
        if let Some(idx) = poll::as_listener_index(token) {
            if idx >= self.listeners.len() {
                return Ok(Flow::Continue);
            }
            return if self.listeners[idx].is_udp() {
                self.udp_machine(events, idx)
            } else {
                self.accept_machine(events, idx)
            };
        }
        if let Some(id) = poll::as_conn_id(token) {
            return self.conn_machine(events, id);
        }
        Ok(Flow::Continue)
    }

    fn process_wakes<E: Events>(&mut self, events: &mut E) -> Result<Flow> {
        loop {
            let ids = std::mem::take(&mut self.shared.state.lock().unwrap().wakes);
            if ids.is_empty() {
                return Ok(Flow::Continue);
            }
            for id in ids {
                if self.conn_machine(events, id)? == Flow::Shutdown {
                    return Ok(Flow::Shutdown);
                }
            }
        }
    }

    /// accept: drain the listener backlog, admitting each connection
    /// through opened and the write step.
    fn accept_machine<E: Events>(&mut self, events: &mut E, idx: usize) -> Result<Flow> {
        loop {
            let stream = match self.listeners[idx].accept() {
                Ok(stream) => stream,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Flow::Continue),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    // a failed accept skips the connection, not the server
                    debug!("accept on listener {idx} failed: {e}");
                    return Ok(Flow::Continue);
                }
            };
            let id = {
                let mut guard = self.shared.state.lock().unwrap();
                let st = &mut *guard;
                let id = st.conns.alloc_id();
                let mut conn = Connection::new(id, stream, Some(idx));
                conn.stream
                    .register(&self.shared.registry, poll::conn_token(id), Interest::READABLE)?;
                st.conns.insert(conn);
                id
            };
            trace!("accepted connection {id} on listener {idx}");
            self.opened_step(events, id)?;
            if self.write_step(events, id)? == Flow::Shutdown {
                return Ok(Flow::Shutdown);
            }
        }
    }

    /// opened: fill in addresses, fire the callback, apply options, queue
    /// any greeting bytes.
    fn opened_step<E: Events>(&mut self, events: &mut E, id: u64) -> Result<()> {
        let info = {
            let mut guard = self.shared.state.lock().unwrap();
            let Some(conn) = guard.conns.get_mut(id) else {
                return Ok(());
            };
            conn.opening = false;
            Info {
                closing: false,
                addr_index: conn.addr_index,
                local_addr: conn.stream.local_addr(),
                remote_addr: conn.stream.peer_addr(),
            }
        };
        let (out, opts, action) = events.opened(id, &info);
        let mut guard = self.shared.state.lock().unwrap();
        let Some(conn) = guard.conns.get_mut(id) else {
            return Ok(());
        };
        conn.opts = opts;
        if let Some(t) = opts.tcp_keepalive {
            if let Err(e) = conn.stream.set_keepalive(t) {
                warn!("keepalive on connection {id} failed: {e}");
            }
        }
        if !out.is_empty() {
            conn.out.push(&out);
        }
        conn.action.raise(action);
        Ok(())
    }

    /// read (and the preceding opened for dialed connections): consume a
    /// pending wake or drain the socket, delivering data callbacks in read
    /// order, then fall through to write.
    fn conn_machine<E: Events>(&mut self, events: &mut E, id: u64) -> Result<Flow> {
        let opening = {
            let mut guard = self.shared.state.lock().unwrap();
            match guard.conns.get_mut(id) {
                Some(conn) => conn.opening,
                None => {
                    trace!("readiness for unknown connection {id}");
                    return Ok(Flow::Continue);
                }
            }
        };
        if opening {
            self.opened_step(events, id)?;
            return self.write_step(events, id);
        }

        loop {
            let mut guard = self.shared.state.lock().unwrap();
            let Some(conn) = guard.conns.get_mut(id) else {
                return Ok(Flow::Continue);
            };
            if conn.action != Action::None {
                drop(guard);
                break;
            }

            let woke;
            let mut n = 0;
            if conn.wake {
                conn.wake = false;
                woke = true;
            } else {
                woke = false;
                match conn.stream.read(&mut self.scratch) {
                    Ok(0) => {
                        drop(guard);
                        return self.close_step(events, id);
                    }
                    Ok(m) => n = m,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        drop(guard);
                        break;
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        trace!("read on connection {id} failed: {e}");
                        conn.last_err = Some(e.into());
                        drop(guard);
                        return self.close_step(events, id);
                    }
                }
            }
            let reuse = conn.opts.reuse_input_buffer;
            drop(guard);

            let copied;
            let input: &[u8] = if woke {
                &[]
            } else if reuse {
                &self.scratch[..n]
            } else {
                copied = self.scratch[..n].to_vec();
                &copied
            };
            let (out, action) = events.data(id, input);

            let mut guard = self.shared.state.lock().unwrap();
            let Some(conn) = guard.conns.get_mut(id) else {
                return Ok(Flow::Continue);
            };
            if !out.is_empty() {
                conn.out.push(&out);
            }
            conn.action.raise(action);
            let stop = conn.action != Action::None;
            drop(guard);
            if stop {
                break;
            }
            // a consumed wake falls through to drain the socket as well;
            // the poller is edge-triggered and will not repeat this event
        }

        self.write_step(events, id)
    }

    /// write: attempt to drain the buffer, bracketing every attempt with
    /// prewrite/postwrite; park write-interest on EAGAIN, close on error or
    /// a pending close action once drained.
    fn write_step<E: Events>(&mut self, events: &mut E, id: u64) -> Result<Flow> {
        loop {
            let pending_len = {
                let mut guard = self.shared.state.lock().unwrap();
                match guard.conns.get_mut(id) {
                    Some(conn) if conn.out.has_pending() => conn.out.pending_len(),
                    Some(_) => break,
                    None => return Ok(Flow::Continue),
                }
            };

            let pre = events.prewrite(id, pending_len);
            let mut guard = self.shared.state.lock().unwrap();
            let Some(conn) = guard.conns.get_mut(id) else {
                return Ok(Flow::Continue);
            };
            if pre == Action::Shutdown {
                conn.action = Action::Shutdown;
            }

            let res = conn.stream.write(conn.out.pending());
            let (written, err) = match res {
                Ok(n) => (n, None),
                Err(e) => (0, Some(e)),
            };
            conn.out.advance(written);
            let remaining = conn.out.pending_len();
            drop(guard);

            let post = events.postwrite(id, written, remaining);
            let mut guard = self.shared.state.lock().unwrap();
            let Some(conn) = guard.conns.get_mut(id) else {
                return Ok(Flow::Continue);
            };
            if post == Action::Shutdown {
                conn.action = Action::Shutdown;
            }

            match err {
                None => {
                    if conn.action == Action::Shutdown {
                        drop(guard);
                        return self.close_step(events, id);
                    }
                    if written == 0 {
                        // the kernel accepted nothing; the peer is gone
                        drop(guard);
                        return self.close_step(events, id);
                    }
                }
                Some(e) => {
                    if conn.action == Action::Shutdown {
                        drop(guard);
                        return self.close_step(events, id);
                    }
                    match e.kind() {
                        io::ErrorKind::WouldBlock => {
                            set_write_interest(&self.shared.registry, conn, true)?;
                            return Ok(Flow::Continue);
                        }
                        io::ErrorKind::Interrupted => {}
                        _ => {
                            trace!("write on connection {id} failed: {e}");
                            conn.last_err = Some(e.into());
                            drop(guard);
                            return self.close_step(events, id);
                        }
                    }
                }
            }
        }

        let mut guard = self.shared.state.lock().unwrap();
        let Some(conn) = guard.conns.get_mut(id) else {
            return Ok(Flow::Continue);
        };
        if conn.action == Action::Shutdown {
            drop(guard);
            return self.close_step(events, id);
        }
        if conn.out.has_pending() {
            set_write_interest(&self.shared.registry, conn, true)?;
            return Ok(Flow::Continue);
        }
        if !conn.wake && conn.write_on {
            set_write_interest(&self.shared.registry, conn, false)?;
        }
        if conn.action != Action::None {
            drop(guard);
            return self.close_step(events, id);
        }
        Ok(Flow::Continue)
    }

    /// close: remove from the table, then either hand the socket to the
    /// detached callback or close it and fire closed.
    fn close_step<E: Events>(&mut self, events: &mut E, id: u64) -> Result<Flow> {
        let mut conn = {
            let mut guard = self.shared.state.lock().unwrap();
            match guard.conns.remove(id) {
                Some(conn) => conn,
                None => return Ok(Flow::Continue),
            }
        };
        let _ = conn.stream.deregister(&self.shared.registry);

        if conn.action == Action::Detach {
            let pending = conn.out.take_pending();
            match conn.stream.into_blocking() {
                Ok(sock) => {
                    trace!("detaching connection {id} with {} buffered bytes", pending.len());
                    let action = events.detached(id, DetachedStream::new(sock, pending));
                    return Ok(if action == Action::Shutdown {
                        Flow::Shutdown
                    } else {
                        Flow::Continue
                    });
                }
                Err(e) => {
                    let err = Error::from(e);
                    let action = events.closed(id, Some(&err));
                    return Ok(if action == Action::Shutdown {
                        Flow::Shutdown
                    } else {
                        Flow::Continue
                    });
                }
            }
        }

        drop(conn.stream);
        let action = events.closed(id, conn.last_err.as_ref());
        conn.action.raise(action);
        Ok(if conn.action == Action::Shutdown {
            Flow::Shutdown
        } else {
            Flow::Continue
        })
    }

    /// udpread: drain datagrams, keying each origin address into the
    /// per-peer virtual connection map.
    fn udp_machine<E: Events>(&mut self, events: &mut E, idx: usize) -> Result<Flow> {
        loop {
            let (n, peer) = match self.listeners[idx].recv_from(&mut self.scratch) {
                Ok(v) => v,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Flow::Continue),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("udp recv on listener {idx} failed: {e}");
                    return Ok(Flow::Continue);
                }
            };
            let key = (idx, peer);
            let mut action = Action::None;
            let id = match self.udp_peers.get(&key) {
                Some(&id) => id,
                None => {
                    let id = self.shared.state.lock().unwrap().conns.alloc_id();
                    self.udp_peers.insert(key, id);
                    let info = Info {
                        closing: false,
                        addr_index: Some(idx),
                        local_addr: Some(self.listeners[idx].addr.clone()),
                        remote_addr: Some(Addr::Ip(peer)),
                    };
                    let (out, _opts, a) = events.opened(id, &info);
                    if !out.is_empty() {
                        let _ = self.listeners[idx].send_to(&out, peer);
                    }
                    action = a;
                    id
                }
            };
            if action == Action::None {
                let (out, a) = events.data(id, &self.scratch[..n]);
                if !out.is_empty() {
                    let _ = self.listeners[idx].send_to(&out, peer);
                }
                action = a;
            }
            if action != Action::None {
                // Close and Detach both retire the peer entry; UDP has no
                // socket to hand out.
                self.udp_peers.remove(&key);
                let a = events.closed(id, None);
                if action == Action::Shutdown || a == Action::Shutdown {
                    return Ok(Flow::Shutdown);
                }
            }
        }
    }

    /// Expires dials still opening past their deadline, synthesizing the
    /// opened(closing)+closed pair. Returns true when anything expired.
    fn expire_dials<E: Events>(&mut self, events: &mut E) -> bool {
        let now = Instant::now();
        let mut expired = Vec::new();
        {
            let mut guard = self.shared.state.lock().unwrap();
            let st = &mut *guard;
            while let Some(id) = st.timeouts.pop_expired(now) {
                let still_opening = st.conns.get_mut(id).map(|c| c.opening).unwrap_or(false);
                if still_opening {
                    expired.push(st.conns.remove(id).unwrap());
                }
            }
        }
        let any = !expired.is_empty();
        for conn in expired {
            let id = conn.id;
            let info = Info {
                closing: true,
                addr_index: None,
                local_addr: conn.stream.local_addr(),
                remote_addr: conn.stream.peer_addr(),
            };
            let mut stream = conn.stream;
            let _ = stream.deregister(&self.shared.registry);
            drop(stream);
            let _ = events.opened(id, &info);
            let _ = events.closed(id, Some(&Error::DialTimedOut));
        }
        any
    }

    /// On loop exit: close every connection, last-opened first, firing the
    /// synthetic opened(closing) for connections that never established and
    /// a final closed for each. Actions returned here are ignored; the loop
    /// is already gone.
    fn shutdown_traversal<E: Events>(&mut self, events: &mut E) {
        let conns = {
            let mut guard = self.shared.state.lock().unwrap();
            let st = &mut *guard;
            st.done = true;
            st.conns.drain_descending()
        };
        for conn in conns {
            let id = conn.id;
            let was_opening = conn.opening;
            let info = Info {
                closing: true,
                addr_index: None,
                local_addr: conn.stream.local_addr(),
                remote_addr: conn.stream.peer_addr(),
            };
            let mut stream = conn.stream;
            let _ = stream.deregister(&self.shared.registry);
            drop(stream);
            if was_opening {
                let _ = events.opened(id, &info);
            }
            let _ = events.closed(id, None);
        }
        // UDP virtual connections get the same closed pairing, last-opened
        // first; they have no socket of their own to release.
        let mut udp_ids: Vec<u64> = self.udp_peers.drain().map(|(_, id)| id).collect();
        udp_ids.sort_unstable_by(|a, b| b.cmp(a));
        for id in udp_ids {
            let _ = events.closed(id, None);
        }
    }
}

fn set_write_interest(registry: &Registry, conn: &mut Connection, on: bool) -> io::Result<()> {
    if conn.write_on == on {
        return Ok(());
    }
    let interest = if on {
        Interest::READABLE | Interest::WRITABLE
    } else {
        Interest::READABLE
    };
    conn.stream
        .reregister(registry, poll::conn_token(conn.id), interest)?;
    conn.write_on = on;
    Ok(())
}
