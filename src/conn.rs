//! Per-connection state: the stream, the outbound write buffer with its
//! advancing cursor, the id-ordered connection table, and the detached
//! stream handle given out by the detach protocol.

use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use std::os::fd::{FromRawFd, IntoRawFd};
use std::time::Duration;

use mio::net::{TcpStream, UnixStream};
use mio::{Interest, Registry, Token};
use socket2::{SockRef, Socket, TcpKeepalive};

use crate::error::Error;
use crate::event::{Action, Addr, Options};

/// A live stream socket, TCP or Unix-domain.
pub(crate) enum Stream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Stream {
    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.read(buf),
            Stream::Unix(s) => s.read(buf),
        }
    }

    pub fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.write(buf),
            Stream::Unix(s) => s.write(buf),
        }
    }

    pub fn local_addr(&self) -> Option<Addr> {
        match self {
            Stream::Tcp(s) => s.local_addr().ok().map(Addr::Ip),
            Stream::Unix(s) => s
                .local_addr()
                .ok()
                .map(|a| Addr::Unix(a.as_pathname().map(Into::into))),
        }
    }

    pub fn peer_addr(&self) -> Option<Addr> {
        match self {
            Stream::Tcp(s) => s.peer_addr().ok().map(Addr::Ip),
            Stream::Unix(s) => s
                .peer_addr()
                .ok()
                .map(|a| Addr::Unix(a.as_pathname().map(Into::into))),
        }
    }

    /// Applies SO_KEEPALIVE with the given keepalive time. No-op for unix
    /// sockets.
    pub fn set_keepalive(&self, time: Duration) -> io::Result<()> {
        if let Stream::Tcp(s) = self {
            let sock = SockRef::from(s);
            sock.set_keepalive(true)?;
            sock.set_tcp_keepalive(&TcpKeepalive::new().with_time(time))?;
        }
        Ok(())
    }

    pub fn register(&mut self, registry: &Registry, token: Token, interest: Interest) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => registry.register(s, token, interest),
            Stream::Unix(s) => registry.register(s, token, interest),
        }
    }

    pub fn reregister(&mut self, registry: &Registry, token: Token, interest: Interest) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => registry.reregister(s, token, interest),
            Stream::Unix(s) => registry.reregister(s, token, interest),
        }
    }

    pub fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => registry.deregister(s),
            Stream::Unix(s) => registry.deregister(s),
        }
    }

    /// Consumes the stream and returns the underlying socket restored to
    /// blocking mode, for the detach hand-off.
    pub fn into_blocking(self) -> io::Result<Socket> {
        let raw = match self {
            Stream::Tcp(s) => s.into_raw_fd(),
            Stream::Unix(s) => s.into_raw_fd(),
        };
        // Ownership of the fd moves straight from the mio stream into the
        // socket2 handle.
        let sock = unsafe { Socket::from_raw_fd(raw) };
        sock.set_nonblocking(false)?;
        Ok(sock)
    }
}

/// Outbound byte queue with an advancing already-written cursor.
///
/// When the cursor catches up with the buffer the storage is reset (length
/// zero, capacity retained).
#[derive(Debug, Default)]
pub(crate) struct WriteBuffer {
    buf: Vec<u8>,
    pos: usize,
}

impl WriteBuffer {
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn pending(&self) -> &[u8] {
        &self.buf[self.pos..]
    }

    pub fn has_pending(&self) -> bool {
        self.pos < self.buf.len()
    }

    pub fn pending_len(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn advance(&mut self, n: usize) {
        debug_assert!(self.pos + n <= self.buf.len());
        self.pos += n;
        if self.pos == self.buf.len() {
            self.buf.clear();
            self.pos = 0;
        }
    }

    /// Removes and returns the unwritten tail, leaving the buffer empty.
    pub fn take_pending(&mut self) -> Vec<u8> {
        let tail = self.buf.split_off(self.pos);
        self.buf.clear();
        self.pos = 0;
        tail
    }
}

/// A live peer association owned by the event loop.
pub(crate) struct Connection {
    pub id: u64,
    pub stream: Stream,
    /// Listener index; `None` for dialed outbound connections.
    pub addr_index: Option<usize>,
    pub out: WriteBuffer,
    pub action: Action,
    pub opts: Options,
    pub last_err: Option<Error>,
    /// A wake is pending; the next service delivers `data` with empty input.
    pub wake: bool,
    /// Write-interest currently registered with the poller.
    pub write_on: bool,
    /// Dialed and not yet connected; the first readiness event fires
    /// `opened`.
    pub opening: bool,
}

impl Connection {
    pub fn new(id: u64, stream: Stream, addr_index: Option<usize>) -> Self {
        Connection {
            id,
            stream,
            addr_index,
            out: WriteBuffer::default(),
            action: Action::None,
            opts: Options::default(),
            last_err: None,
            wake: false,
            write_on: false,
            opening: false,
        }
    }
}

/// Connection index keyed by id. Ids are allocated from a single counter
/// that increments before use, so they start at 1 and strictly increase in
/// creation order; the ordered map gives the shutdown traversal its
/// descending-id walk for free.
pub(crate) struct ConnTable {
    conns: BTreeMap<u64, Connection>,
    next_id: u64,
}

impl ConnTable {
    pub fn new() -> Self {
        ConnTable {
            conns: BTreeMap::new(),
            next_id: 0,
        }
    }

    pub fn alloc_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    pub fn insert(&mut self, conn: Connection) {
        self.conns.insert(conn.id, conn);
    }

    pub fn get_mut(&mut self, id: u64) -> Option<&mut Connection> {
        self.conns.get_mut(&id)
    }

    pub fn contains(&self, id: u64) -> bool {
        self.conns.contains_key(&id)
    }

    pub fn remove(&mut self, id: u64) -> Option<Connection> {
        self.conns.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    /// Removes and returns every connection, last-opened first.
    pub fn drain_descending(&mut self) -> Vec<Connection> {
        let mut conns: Vec<_> = std::mem::take(&mut self.conns).into_values().collect();
        conns.reverse();
        conns
    }
}

/// Socket handle passed to the `detached` callback.
///
/// The loop has deregistered the socket and restored blocking mode; the
/// handle is the application's exclusive property. Any bytes that were still
/// queued at detach time are flushed ahead of the first `write`. Dropping
/// the handle closes the socket.
pub struct DetachedStream {
    sock: Socket,
    pending: Vec<u8>,
}

impl DetachedStream {
    pub(crate) fn new(sock: Socket, pending: Vec<u8>) -> Self {
        DetachedStream { sock, pending }
    }

    fn flush_pending(&mut self) -> io::Result<()> {
        while !self.pending.is_empty() {
            let n = self.sock.write(&self.pending)?;
            self.pending.drain(..n);
        }
        Ok(())
    }
}

impl Read for DetachedStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.sock.read(buf)
    }
}

impl Write for DetachedStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.flush_pending()?;
        self.sock.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_pending()?;
        self.sock.flush()
    }
}

impl std::fmt::Debug for DetachedStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DetachedStream")
            .field("pending", &self.pending.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_buffer_cursor_and_reset() {
        let mut wb = WriteBuffer::default();
        assert!(!wb.has_pending());
        wb.push(b"hello");
        wb.push(b" world");
        assert_eq!(wb.pending(), b"hello world");
        wb.advance(5);
        assert_eq!(wb.pending(), b" world");
        assert_eq!(wb.pending_len(), 6);
        wb.advance(6);
        assert!(!wb.has_pending());
        assert_eq!(wb.pending(), b"");
        // cursor reset: new pushes start from the beginning again
        wb.push(b"x");
        assert_eq!(wb.pending(), b"x");
    }

    #[test]
    fn write_buffer_take_pending() {
        let mut wb = WriteBuffer::default();
        wb.push(b"abcdef");
        wb.advance(2);
        assert_eq!(wb.take_pending(), b"cdef");
        assert!(!wb.has_pending());
    }

    #[test]
    fn conn_table_ids_are_monotonic() {
        let mut table = ConnTable::new();
        let a = table.alloc_id();
        let b = table.alloc_id();
        let c = table.alloc_id();
        assert_eq!((a, b, c), (1, 2, 3));
    }

    #[test]
    fn conn_table_drains_descending() {
        let mut table = ConnTable::new();
        for _ in 0..4 {
            let id = table.alloc_id();
            let (s, _peer) = std::os::unix::net::UnixStream::pair().unwrap();
            s.set_nonblocking(true).unwrap();
            let stream = Stream::Unix(UnixStream::from_std(s));
            table.insert(Connection::new(id, stream, Some(0)));
        }
        let ids: Vec<u64> = table.drain_descending().iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![4, 3, 2, 1]);
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn detached_stream_flushes_pending_before_first_write() {
        let (a, b) = std::os::unix::net::UnixStream::pair().unwrap();
        let mut detached = DetachedStream::new(Socket::from(a), b"ab".to_vec());
        detached.write_all(b"xyz").unwrap();
        drop(detached);

        let mut got = Vec::new();
        let mut b = b;
        b.read_to_end(&mut got).unwrap();
        assert_eq!(got, b"abxyz");
    }
}
