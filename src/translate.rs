//! Byte-level stream translation (compression, encryption, TLS) layered
//! over an [`Events`] implementation.
//!
//! [`translate`] wraps user events into new events that route every byte
//! through a user-supplied translator. Per opted-in connection two pipes
//! stand in for the wire: raw inbound bytes are pushed into one, translated
//! output is collected from the other, and background pump threads move
//! bytes through the translator, waking the loop whenever something is
//! ready. Connections rejected by the `should` predicate bypass the layer
//! entirely.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use log::trace;

use crate::error::Error;
use crate::event::{Action, Events, Info, Options};
use crate::pipe::{pipe, PipeReader, PipeWriter};
use crate::server::Server;

const PUMP_BUF_SIZE: usize = 2048;

/// The network side of a translated connection, handed to the translator
/// factory. Reading yields raw bytes received from the peer; writing queues
/// raw bytes for the peer.
///
/// A translator that needs independent read and write halves (most do, as
/// the pump threads run concurrently) calls [`split`](Wire::split).
pub struct Wire {
    reader: PipeReader,
    writer: PipeWriter,
}

impl Wire {
    pub fn split(self) -> (WireReader, WireWriter) {
        (WireReader(self.reader), WireWriter(self.writer))
    }
}

impl Read for Wire {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf)
    }
}

impl Write for Wire {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.writer.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

/// Read half of a [`Wire`].
pub struct WireReader(PipeReader);

impl Read for WireReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

/// Write half of a [`Wire`].
pub struct WireWriter(PipeWriter);

impl Write for WireWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

struct OutQueue {
    inner: Mutex<(Vec<u8>, bool)>,
    cond: Condvar,
}

impl OutQueue {
    fn new() -> Self {
        OutQueue {
            inner: Mutex::new((Vec::new(), false)),
            cond: Condvar::new(),
        }
    }

    fn push(&self, bytes: &[u8]) {
        let mut inner = self.inner.lock().unwrap();
        inner.0.extend_from_slice(bytes);
        self.cond.notify_all();
    }

    fn close(&self) {
        self.inner.lock().unwrap().1 = true;
        self.cond.notify_all();
    }

    fn wait_take(&self) -> Option<Vec<u8>> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if !inner.0.is_empty() {
                return Some(std::mem::take(&mut inner.0));
            }
            if inner.1 {
                return None;
            }
            inner = self.cond.wait(inner).unwrap();
        }
    }
}

struct TConn {
    /// Raw inbound bytes feed the translator through here.
    net_in: Mutex<PipeWriter>,
    /// Translated plaintext waiting for delivery to the user.
    plain_in: Mutex<Vec<u8>>,
    /// Translated raw output waiting to go out on the wire.
    net_out: Mutex<Vec<u8>>,
    /// User plaintext waiting to enter the translator.
    out_q: OutQueue,
    action: Mutex<Action>,
    err: Mutex<Option<Error>>,
}

impl TConn {
    fn record_err(&self, e: io::Error) {
        // pipe teardown noise is not a translator failure
        if matches!(
            e.kind(),
            io::ErrorKind::BrokenPipe | io::ErrorKind::UnexpectedEof
        ) {
            return;
        }
        self.err.lock().unwrap().get_or_insert(e.into());
    }

    fn destroy(&self) -> Option<Error> {
        self.net_in.lock().unwrap().close();
        self.out_q.close();
        self.err.lock().unwrap().take()
    }
}

struct TShared {
    server: Mutex<Option<Server>>,
    conns: Mutex<HashMap<u64, Arc<TConn>>>,
}

/// Events wrapper produced by [`translate`].
pub struct Translated<E, S, F> {
    inner: E,
    should: S,
    factory: F,
    shared: Arc<TShared>,
}

/// Wraps `events` so that each connection accepted by `should` runs its
/// byte streams through the translator built by `factory`.
///
/// The factory receives the connection id and the [`Wire`] (the network
/// side) and returns the translated read half (plaintext out of the
/// translator) and write half (plaintext into the translator). For a
/// null translation, return the split wire unchanged.
pub fn translate<E, S, F>(events: E, should: S, factory: F) -> Translated<E, S, F>
where
    E: Events,
    S: FnMut(u64, &Info) -> bool,
    F: FnMut(u64, Wire) -> (Box<dyn Read + Send>, Box<dyn Write + Send>),
{
    Translated {
        inner: events,
        should,
        factory,
        shared: Arc::new(TShared {
            server: Mutex::new(None),
            conns: Mutex::new(HashMap::new()),
        }),
    }
}

fn spawn_pumps(
    id: u64,
    conn: Arc<TConn>,
    server: Server,
    plain_rd: Box<dyn Read + Send>,
    plain_wr: Box<dyn Write + Send>,
    net_out_rd: PipeReader,
) {
    // translated plaintext → pending user delivery
    {
        let conn = conn.clone();
        let server = server.clone();
        let mut rd = plain_rd;
        thread::spawn(move || {
            let mut buf = [0u8; PUMP_BUF_SIZE];
            loop {
                match rd.read(&mut buf) {
                    Ok(0) => return,
                    Ok(n) => {
                        conn.plain_in.lock().unwrap().extend_from_slice(&buf[..n]);
                        server.wake(id);
                    }
                    Err(e) => {
                        conn.record_err(e);
                        return;
                    }
                }
            }
        });
    }

    // user plaintext → translator
    {
        let conn = conn.clone();
        let mut wr = plain_wr;
        thread::spawn(move || {
            while let Some(chunk) = conn.out_q.wait_take() {
                if let Err(e) = wr.write_all(&chunk).and_then(|_| wr.flush()) {
                    conn.record_err(e);
                    return;
                }
            }
        });
    }

    // translator wire output → pending send
    {
        let mut rd = net_out_rd;
        thread::spawn(move || {
            let mut buf = [0u8; PUMP_BUF_SIZE];
            loop {
                match rd.read(&mut buf) {
                    Ok(0) => return,
                    Ok(n) => {
                        conn.net_out.lock().unwrap().extend_from_slice(&buf[..n]);
                        server.wake(id);
                    }
                    Err(e) => {
                        conn.record_err(e);
                        return;
                    }
                }
            }
        });
    }
}

impl<E, S, F> Translated<E, S, F>
where
    E: Events,
    S: FnMut(u64, &Info) -> bool,
    F: FnMut(u64, Wire) -> (Box<dyn Read + Send>, Box<dyn Write + Send>),
{
    fn get(&self, id: u64) -> Option<Arc<TConn>> {
        self.shared.conns.lock().unwrap().get(&id).cloned()
    }

    fn wake(&self, id: u64) {
        if let Some(server) = self.shared.server.lock().unwrap().as_ref() {
            server.wake(id);
        }
    }

    fn create(&mut self, id: u64) -> Arc<TConn> {
        let (net_in_rd, net_in_wr) = pipe();
        let (net_out_rd, net_out_wr) = pipe();
        let conn = Arc::new(TConn {
            net_in: Mutex::new(net_in_wr),
            plain_in: Mutex::new(Vec::new()),
            net_out: Mutex::new(Vec::new()),
            out_q: OutQueue::new(),
            action: Mutex::new(Action::None),
            err: Mutex::new(None),
        });
        let wire = Wire {
            reader: net_in_rd,
            writer: net_out_wr,
        };
        let (plain_rd, plain_wr) = (self.factory)(id, wire);
        let server = self
            .shared
            .server
            .lock()
            .unwrap()
            .clone()
            .expect("serving fires before any connection opens");
        spawn_pumps(id, conn.clone(), server, plain_rd, plain_wr, net_out_rd);
        self.shared.conns.lock().unwrap().insert(id, conn.clone());
        conn
    }

    fn remove(&self, id: u64) -> Option<Arc<TConn>> {
        self.shared.conns.lock().unwrap().remove(&id)
    }
}

impl<E, S, F> Events for Translated<E, S, F>
where
    E: Events,
    S: FnMut(u64, &Info) -> bool,
    F: FnMut(u64, Wire) -> (Box<dyn Read + Send>, Box<dyn Write + Send>),
{
    fn serving(&mut self, server: &Server) -> Action {
        *self.shared.server.lock().unwrap() = Some(server.clone());
        self.inner.serving(server)
    }

    fn opened(&mut self, id: u64, info: &Info) -> (Vec<u8>, Options, Action) {
        if !(self.should)(id, info) {
            return self.inner.opened(id, info);
        }
        trace!("translating connection {id}");
        let conn = self.create(id);
        let (out, opts, action) = self.inner.opened(id, info);
        conn.action.lock().unwrap().raise(action);
        if !out.is_empty() {
            conn.out_q.push(&out);
            self.wake(id);
        }
        // the translated connection stays open until its own action drains
        // through the wake path
        (Vec::new(), opts, Action::None)
    }

    fn data(&mut self, id: u64, input: &[u8]) -> (Vec<u8>, Action) {
        let Some(conn) = self.get(id) else {
            return self.inner.data(id, input);
        };

        if !input.is_empty() {
            let action = *conn.action.lock().unwrap();
            if action != Action::None {
                return (Vec::new(), action);
            }
            if let Err(e) = conn.net_in.lock().unwrap().write_all(input) {
                conn.record_err(e);
            }
            return (Vec::new(), Action::None);
        }

        // wake turn: first drain translated wire output,
        let outbound = std::mem::take(&mut *conn.net_out.lock().unwrap());
        if !outbound.is_empty() {
            // wake again in case the translator produced more meanwhile
            self.wake(id);
            return (outbound, Action::None);
        }
        // then surface any pending action,
        let action = *conn.action.lock().unwrap();
        if action != Action::None {
            return (Vec::new(), action);
        }
        // then deliver translated plaintext to the user
        let plain = std::mem::take(&mut *conn.plain_in.lock().unwrap());
        if !plain.is_empty() {
            let (out, action) = self.inner.data(id, &plain);
            conn.action.lock().unwrap().raise(action);
            if !out.is_empty() {
                conn.out_q.push(&out);
            }
            self.wake(id);
        }
        (Vec::new(), Action::None)
    }

    fn prewrite(&mut self, id: u64, pending: usize) -> Action {
        self.inner.prewrite(id, pending)
    }

    fn postwrite(&mut self, id: u64, written: usize, remaining: usize) -> Action {
        self.inner.postwrite(id, written, remaining)
    }

    fn closed(&mut self, id: u64, error: Option<&Error>) -> Action {
        let terr = self.remove(id).and_then(|conn| conn.destroy());
        match error {
            Some(e) => self.inner.closed(id, Some(e)),
            None => self.inner.closed(id, terr.as_ref()),
        }
    }

    fn detached(&mut self, id: u64, stream: crate::conn::DetachedStream) -> Action {
        // detach hands out the raw socket; the translator state goes away
        if let Some(conn) = self.remove(id) {
            conn.destroy();
        }
        self.inner.detached(id, stream)
    }

    fn tick(&mut self) -> (std::time::Duration, Action) {
        self.inner.tick()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_queue_hands_over_and_closes() {
        let q = Arc::new(OutQueue::new());
        let q2 = q.clone();
        let handle = thread::spawn(move || {
            let mut got = Vec::new();
            while let Some(chunk) = q2.wait_take() {
                got.extend_from_slice(&chunk);
            }
            got
        });
        q.push(b"ab");
        q.push(b"cd");
        std::thread::sleep(std::time::Duration::from_millis(20));
        q.close();
        let got = handle.join().unwrap();
        assert_eq!(got, b"abcd");
    }

    #[test]
    fn wire_round_trips_through_split_halves() {
        let (net_in_rd, mut net_in_wr) = pipe();
        let (mut net_out_rd, net_out_wr) = pipe();
        let wire = Wire {
            reader: net_in_rd,
            writer: net_out_wr,
        };
        let (mut rd, mut wr) = wire.split();

        net_in_wr.write_all(b"inbound").unwrap();
        let mut buf = [0u8; 16];
        let n = rd.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"inbound");

        wr.write_all(b"outbound").unwrap();
        let n = net_out_rd.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"outbound");
    }
}
