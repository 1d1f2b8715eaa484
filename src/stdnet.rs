//! The portable fallback back-end, selected by a `-net`/`-stdlib` scheme
//! suffix.
//!
//! No poller: one accept thread per listener and one reader thread per
//! connection perform blocking calls and forward typed notes over a channel
//! to a central dispatcher. The dispatcher re-enters the same
//! accept/read/write/close state machine as the reactor, with brief write
//! deadlines standing in for EAGAIN-driven write registration. Wake marks
//! the connection and queues a write turn; detach plants a past read
//! deadline so the reader thread can acknowledge before the socket is
//! handed over.

use std::collections::BTreeMap;
use std::io;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use log::{debug, warn};

use crate::addr::ParsedAddr;
use crate::conn::{DetachedStream, WriteBuffer};
use crate::error::{Error, Result};
use crate::event::{Action, Events, Info};
use crate::listener::{StdListener, StdStream};
use crate::object_pool::{ObjectPool, PooledObject};
use crate::server::{Control, Server};

const READ_BUF_SIZE: usize = 64 * 1024;
/// Reader threads block at most this long before re-checking teardown
/// flags.
const READ_TIMEOUT: Duration = Duration::from_millis(100);
/// Past-deadline planted on a detaching connection to turn the reader
/// around quickly.
const DETACH_TIMEOUT: Duration = Duration::from_millis(1);
const WRITE_TIMEOUT: Duration = Duration::from_millis(10);

/// Events flowing from the background threads into the dispatcher.
enum Note {
    Accept {
        id: u64,
        lnidx: usize,
        reader: StdStream,
    },
    Read {
        id: u64,
        buf: PooledObject<Vec<u8>>,
        len: usize,
    },
    /// Give the connection a write/wake turn.
    Write { id: u64 },
    /// The reader is done: EOF, error, or detach acknowledgement.
    Close { id: u64, err: Option<Error> },
    Tick,
    /// A listener failed; the server comes down.
    Fail(Error),
}

struct StdConn {
    stream: StdStream,
    out: WriteBuffer,
    action: Action,
    last_err: Option<Error>,
    wake: bool,
    detaching: bool,
    /// Inserted by the accept thread, not yet announced through `opened`.
    /// The accept note travels on the same channel as every other note, so
    /// a tick or wake from another sender can overtake it.
    opening: bool,
}

struct StdState {
    conns: BTreeMap<u64, StdConn>,
    next_id: u64,
    done: bool,
}

struct StdShared {
    state: Mutex<StdState>,
    tx: Sender<Note>,
}

impl Control for StdShared {
    fn wake(&self, id: u64) -> bool {
        let mut guard = self.state.lock().unwrap();
        if guard.done {
            return false;
        }
        let Some(conn) = guard.conns.get_mut(&id) else {
            return false;
        };
        let newly = !conn.wake;
        conn.wake = true;
        drop(guard);
        if newly {
            let _ = self.tx.send(Note::Write { id });
        }
        true
    }

    fn dial(&self, _addr: &str, _timeout: Option<Duration>) -> Result<u64> {
        Err(Error::Unsupported("dial is not available on the stdlib back-end"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Shutdown,
}

pub(crate) fn serve<E: Events>(events: &mut E, parsed: &[ParsedAddr]) -> Result<()> {
    let mut listeners = Vec::with_capacity(parsed.len());
    for p in parsed {
        listeners.push(Arc::new(StdListener::bind(p)?));
    }

    let (tx, rx) = mpsc::channel::<Note>();
    let shared = Arc::new(StdShared {
        state: Mutex::new(StdState {
            conns: BTreeMap::new(),
            next_id: 0,
            done: false,
        }),
        tx: tx.clone(),
    });
    let server = Server::new(
        listeners.iter().map(|ln| ln.addr.clone()).collect(),
        shared.clone(),
    );

    if events.serving(&server) == Action::Shutdown {
        shared.state.lock().unwrap().done = true;
        return Ok(());
    }

    for (lnidx, ln) in listeners.iter().enumerate() {
        let ln = ln.clone();
        let tx = tx.clone();
        let shared = shared.clone();
        thread::Builder::new()
            .name(format!("mill-serve-accept-{lnidx}"))
            .spawn(move || accept_loop(lnidx, ln, shared, tx))
            .expect("spawning the accept thread");
    }

    // The tick thread trades Tick notes for the next delay.
    let (tick_tx, tick_rx) = mpsc::channel::<Duration>();
    {
        let tx = tx.clone();
        thread::Builder::new()
            .name("mill-serve-tick".into())
            .spawn(move || loop {
                if tx.send(Note::Tick).is_err() {
                    return;
                }
                match tick_rx.recv() {
                    Ok(delay) => thread::sleep(delay),
                    Err(_) => return,
                }
            })
            .expect("spawning the tick thread");
    }

    let pool = ObjectPool::new(16, || vec![0u8; READ_BUF_SIZE], |b| b.resize(READ_BUF_SIZE, 0));
    let result = dispatch_loop(events, &rx, &shared, &tick_tx, &pool);
    shutdown_all(events, &shared, &listeners);
    result
}

fn accept_loop(lnidx: usize, ln: Arc<StdListener>, shared: Arc<StdShared>, tx: Sender<Note>) {
    loop {
        match ln.accept() {
            Ok(stream) => {
                if shared.state.lock().unwrap().done {
                    return;
                }
                let reader = match stream.try_clone() {
                    Ok(r) => r,
                    Err(e) => {
                        debug!("could not clone accepted stream: {e}");
                        continue;
                    }
                };
                let _ = reader.set_read_timeout(Some(READ_TIMEOUT));
                let _ = stream.set_write_timeout(Some(WRITE_TIMEOUT));
                let id = {
                    let mut guard = shared.state.lock().unwrap();
                    guard.next_id += 1;
                    let id = guard.next_id;
                    guard.conns.insert(
                        id,
                        StdConn {
                            stream,
                            out: WriteBuffer::default(),
                            action: Action::None,
                            last_err: None,
                            wake: false,
                            detaching: false,
                            opening: true,
                        },
                    );
                    id
                };
                if tx.send(Note::Accept { id, lnidx, reader }).is_err() {
                    return;
                }
            }
            Err(e) => {
                if shared.state.lock().unwrap().done {
                    return;
                }
                let _ = tx.send(Note::Fail(e.into()));
                return;
            }
        }
    }
}

fn reader_loop(
    id: u64,
    mut stream: StdStream,
    shared: Arc<StdShared>,
    tx: Sender<Note>,
    pool: ObjectPool<Vec<u8>>,
) {
    loop {
        let mut buf = pool.acquire();
        match stream.read(buf.as_mut_slice()) {
            Ok(0) => {
                let _ = tx.send(Note::Close { id, err: None });
                return;
            }
            Ok(n) => {
                if tx.send(Note::Read { id, buf, len: n }).is_err() {
                    return;
                }
            }
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut =>
            {
                // deadline lapsed: look for teardown flags
                let guard = shared.state.lock().unwrap();
                match guard.conns.get(&id) {
                    Some(conn) if conn.detaching => {
                        drop(guard);
                        // acknowledge the detach; the dispatcher completes
                        // the hand-off once the reader is out of the way
                        let _ = tx.send(Note::Close { id, err: None });
                        return;
                    }
                    Some(_) => continue,
                    None => return,
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                let _ = tx.send(Note::Close {
                    id,
                    err: Some(e.into()),
                });
                return;
            }
        }
    }
}

fn dispatch_loop<E: Events>(
    events: &mut E,
    rx: &Receiver<Note>,
    shared: &Arc<StdShared>,
    tick_tx: &Sender<Duration>,
    pool: &ObjectPool<Vec<u8>>,
) -> Result<()> {
    loop {
        let note = match rx.recv() {
            Ok(note) => note,
            Err(_) => return Ok(()),
        };
        match note {
            Note::Accept { id, lnidx, reader } => {
                let info = {
                    let guard = shared.state.lock().unwrap();
                    let Some(conn) = guard.conns.get(&id) else {
                        continue;
                    };
                    Info {
                        closing: false,
                        addr_index: Some(lnidx),
                        local_addr: conn.stream.local_addr(),
                        remote_addr: conn.stream.peer_addr(),
                    }
                };
                let (out, opts, action) = events.opened(id, &info);
                {
                    let mut guard = shared.state.lock().unwrap();
                    let Some(conn) = guard.conns.get_mut(&id) else {
                        continue;
                    };
                    conn.opening = false;
                    if let Some(t) = opts.tcp_keepalive {
                        if let Err(e) = conn.stream.set_keepalive(t) {
                            warn!("keepalive on connection {id} failed: {e}");
                        }
                    }
                    if !out.is_empty() {
                        conn.out.push(&out);
                    }
                    conn.action.raise(action);
                }
                {
                    let shared = shared.clone();
                    let tx = shared.tx.clone();
                    let pool = pool.clone();
                    thread::Builder::new()
                        .name(format!("mill-serve-reader-{id}"))
                        .spawn(move || reader_loop(id, reader, shared, tx, pool))
                        .expect("spawning the reader thread");
                }
                // a wake that overtook the accept note is serviced now
                if wake_turn(events, id, shared)? == Flow::Shutdown {
                    return Ok(());
                }
            }
            Note::Read { id, buf, len } => {
                let deliver = {
                    let guard = shared.state.lock().unwrap();
                    match guard.conns.get(&id) {
                        Some(conn) => conn.action == Action::None && !conn.detaching,
                        None => continue,
                    }
                };
                if deliver {
                    let (out, action) = events.data(id, &buf[..len]);
                    let mut guard = shared.state.lock().unwrap();
                    if let Some(conn) = guard.conns.get_mut(&id) {
                        if !out.is_empty() {
                            conn.out.push(&out);
                        }
                        conn.action.raise(action);
                    }
                }
                if flush(events, id, shared)? == Flow::Shutdown {
                    return Ok(());
                }
            }
            Note::Write { id } => {
                if wake_turn(events, id, shared)? == Flow::Shutdown {
                    return Ok(());
                }
            }
            Note::Close { id, err } => {
                let detach_ack = {
                    let mut guard = shared.state.lock().unwrap();
                    match guard.conns.get_mut(&id) {
                        Some(conn) => {
                            if let Some(e) = err {
                                conn.last_err.get_or_insert(e);
                            }
                            conn.detaching
                        }
                        None => continue,
                    }
                };
                let flow = if detach_ack {
                    complete_detach(events, id, shared)
                } else {
                    let mut guard = shared.state.lock().unwrap();
                    if let Some(conn) = guard.conns.get_mut(&id) {
                        conn.action.raise(Action::Close);
                    }
                    drop(guard);
                    close_conn(events, id, shared)
                };
                if flow == Flow::Shutdown {
                    return Ok(());
                }
            }
            Note::Tick => {
                let (delay, action) = events.tick();
                if action == Action::Shutdown {
                    return Ok(());
                }
                let _ = tick_tx.send(delay);
            }
            Note::Fail(e) => return Err(e),
        }
    }
}

/// Deliver a pending wake as an empty data callback, then flush. A wake on
/// a connection whose accept note has not been processed yet stays pending;
/// it is re-serviced right after `opened` fires, so data with empty input
/// never precedes it.
fn wake_turn<E: Events>(events: &mut E, id: u64, shared: &Arc<StdShared>) -> Result<Flow> {
    let deliver = {
        let mut guard = shared.state.lock().unwrap();
        match guard.conns.get_mut(&id) {
            Some(conn) if conn.opening => return Ok(Flow::Continue),
            Some(conn) => {
                let woke = conn.wake;
                conn.wake = false;
                woke && conn.action == Action::None && !conn.detaching
            }
            None => return Ok(Flow::Continue),
        }
    };
    if deliver {
        let (out, action) = events.data(id, &[]);
        let mut guard = shared.state.lock().unwrap();
        if let Some(conn) = guard.conns.get_mut(&id) {
            if !out.is_empty() {
                conn.out.push(&out);
            }
            conn.action.raise(action);
        }
    }
    flush(events, id, shared)
}

/// The dispatcher's write step: drain the buffer with brief write
/// deadlines, bracketing attempts with prewrite/postwrite, then run any
/// pending close action.
fn flush<E: Events>(events: &mut E, id: u64, shared: &Arc<StdShared>) -> Result<Flow> {
    loop {
        let pending_len = {
            let guard = shared.state.lock().unwrap();
            match guard.conns.get(&id) {
                Some(conn) if conn.out.has_pending() => conn.out.pending_len(),
                Some(_) => break,
                None => return Ok(Flow::Continue),
            }
        };

        let pre = events.prewrite(id, pending_len);
        let mut guard = shared.state.lock().unwrap();
        let Some(conn) = guard.conns.get_mut(&id) else {
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
        let mut guard = shared.state.lock().unwrap();
        let Some(conn) = guard.conns.get_mut(&id) else {
            return Ok(Flow::Continue);
        };
        if post == Action::Shutdown {
            conn.action = Action::Shutdown;
        }

        match err {
            None => {
                if conn.action == Action::Shutdown || written == 0 {
                    drop(guard);
                    return close_or_detach(events, id, shared);
                }
            }
            Some(e) => {
                if conn.action == Action::Shutdown {
                    drop(guard);
                    return close_or_detach(events, id, shared);
                }
                match e.kind() {
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
                        // try again after the channel gives others a turn
                        let _ = shared.tx.send(Note::Write { id });
                        return Ok(Flow::Continue);
                    }
                    io::ErrorKind::Interrupted => {}
                    _ => {
                        conn.last_err = Some(e.into());
                        drop(guard);
                        return close_or_detach(events, id, shared);
                    }
                }
            }
        }
    }

    let action = {
        let guard = shared.state.lock().unwrap();
        match guard.conns.get(&id) {
            Some(conn) => conn.action,
            None => return Ok(Flow::Continue),
        }
    };
    if action != Action::None {
        return close_or_detach(events, id, shared);
    }
    Ok(Flow::Continue)
}

fn close_or_detach<E: Events>(events: &mut E, id: u64, shared: &Arc<StdShared>) -> Result<Flow> {
    let begin_detach = {
        let mut guard = shared.state.lock().unwrap();
        match guard.conns.get_mut(&id) {
            Some(conn) => {
                if conn.action == Action::Detach && !conn.detaching {
                    // stop the reader first; the hand-off happens on its ack
                    conn.detaching = true;
                    let _ = conn.stream.set_read_timeout(Some(DETACH_TIMEOUT));
                    true
                } else if conn.detaching {
                    return Ok(Flow::Continue);
                } else {
                    false
                }
            }
            None => return Ok(Flow::Continue),
        }
    };
    if begin_detach {
        return Ok(Flow::Continue);
    }
    Ok(close_conn(events, id, shared))
}

fn close_conn<E: Events>(events: &mut E, id: u64, shared: &Arc<StdShared>) -> Flow {
    let Some(mut conn) = shared.state.lock().unwrap().conns.remove(&id) else {
        return Flow::Continue;
    };
    let _ = conn.stream.shutdown();
    drop(conn.stream);
    let action = events.closed(id, conn.last_err.as_ref());
    conn.action.raise(action);
    if conn.action == Action::Shutdown {
        Flow::Shutdown
    } else {
        Flow::Continue
    }
}

fn complete_detach<E: Events>(events: &mut E, id: u64, shared: &Arc<StdShared>) -> Flow {
    let Some(mut conn) = shared.state.lock().unwrap().conns.remove(&id) else {
        return Flow::Continue;
    };
    let pending = conn.out.take_pending();
    match conn.stream.into_socket() {
        Ok(sock) => {
            let action = events.detached(id, DetachedStream::new(sock, pending));
            if action == Action::Shutdown {
                Flow::Shutdown
            } else {
                Flow::Continue
            }
        }
        Err(e) => {
            let err = Error::from(e);
            let action = events.closed(id, Some(&err));
            if action == Action::Shutdown {
                Flow::Shutdown
            } else {
                Flow::Continue
            }
        }
    }
}

/// Close every connection, last-opened first, and unblock the accept
/// threads. Actions returned by these final closed callbacks are ignored.
fn shutdown_all<E: Events>(events: &mut E, shared: &Arc<StdShared>, listeners: &[Arc<StdListener>]) {
    shared.state.lock().unwrap().done = true;
    for ln in listeners {
        ln.nudge();
    }
    let conns: Vec<(u64, StdConn)> = {
        let mut guard = shared.state.lock().unwrap();
        let mut conns: Vec<_> = std::mem::take(&mut guard.conns).into_iter().collect();
        conns.reverse();
        conns
    };
    for (id, conn) in conns {
        let was_opening = conn.opening;
        let info = Info {
            closing: true,
            addr_index: None,
            local_addr: conn.stream.local_addr(),
            remote_addr: conn.stream.peer_addr(),
        };
        let _ = conn.stream.shutdown();
        drop(conn.stream);
        if was_opening {
            // the accept note never got its turn; keep the open/close
            // pairing symmetric
            let _ = events.opened(id, &info);
        }
        let _ = events.closed(id, None);
    }
}
