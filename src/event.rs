use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::conn::DetachedStream;
use crate::error::Error;
use crate::server::Server;

/// An action returned by an event callback, steering connection and server
/// state after the callback completes.
///
/// Actions form a severity lattice `None < Detach < Close < Shutdown`. Once
/// raised on a connection an action is never lowered; a callback returning a
/// weaker action than the one already pending is a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Action {
    /// Nothing happens after the event.
    #[default]
    None,
    /// Detach the connection from the loop and hand the raw socket to the
    /// `detached` callback. Not available for UDP connections.
    Detach,
    /// Close the connection once its outbound buffer drains.
    Close,
    /// Shut the whole server down.
    Shutdown,
}

impl Action {
    /// Fold `other` into `self`, keeping the more severe of the two.
    pub fn raise(&mut self, other: Action) {
        if other > *self {
            *self = other;
        }
    }
}

/// Per-connection options returned by the `opened` callback.
#[derive(Debug, Clone, Copy, Default)]
pub struct Options {
    /// Enables SO_KEEPALIVE with the given keepalive time. TCP only.
    pub tcp_keepalive: Option<Duration>,
    /// When set, `data` borrows the loop's shared input buffer directly
    /// instead of a per-connection copy. The slice is only valid for the
    /// duration of the callback either way; this merely skips one copy.
    pub reuse_input_buffer: bool,
}

/// A local or remote socket address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Addr {
    Ip(SocketAddr),
    /// Unix-domain address; `None` for unnamed peer sockets.
    Unix(Option<PathBuf>),
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Addr::Ip(sa) => write!(f, "{sa}"),
            Addr::Unix(Some(p)) => write!(f, "unix://{}", p.display()),
            Addr::Unix(None) => write!(f, "unix://"),
        }
    }
}

impl From<SocketAddr> for Addr {
    fn from(sa: SocketAddr) -> Self {
        Addr::Ip(sa)
    }
}

/// Information about a connection, passed to the `opened` callback.
#[derive(Debug, Clone, Default)]
pub struct Info {
    /// True when the connection is already on its way out; expect a `closed`
    /// event to fire soon. Set for dial failures and loop shutdown.
    pub closing: bool,
    /// Index into [`Server::addrs`] of the listener that accepted this
    /// connection. `None` for dialed outbound connections.
    pub addr_index: Option<usize>,
    pub local_addr: Option<Addr>,
    pub remote_addr: Option<Addr>,
}

/// The server event surface.
///
/// Implement the callbacks your application needs; every method has a no-op
/// default. Callbacks are invoked from the loop thread with the loop lock
/// released, so they may freely call [`Server::wake`] and [`Server::dial`].
/// They never receive a socket: they are handed already-buffered byte
/// slices and return bytes to send plus an [`Action`].
///
/// Ordering guarantees per connection id:
/// - exactly one `opened`, before any other callback,
/// - `data` calls are serialized in read order,
/// - `prewrite`/`postwrite` bracket every write attempt with pending bytes,
/// - exactly one of `closed` / `detached`, after which no callback fires.
pub trait Events {
    /// Fires once the server can accept connections. Returning
    /// [`Action::Shutdown`] stops the server before it serves anything.
    fn serving(&mut self, server: &Server) -> Action {
        let _ = server;
        Action::None
    }

    /// Fires when a connection has opened. The returned bytes are queued for
    /// writing and the options are applied to the socket.
    fn opened(&mut self, id: u64, info: &Info) -> (Vec<u8>, Options, Action) {
        let _ = (id, info);
        (Vec::new(), Options::default(), Action::None)
    }

    /// Fires when the connection has input, or with an empty slice when the
    /// connection was woken via [`Server::wake`].
    fn data(&mut self, id: u64, input: &[u8]) -> (Vec<u8>, Action) {
        let _ = (id, input);
        (Vec::new(), Action::None)
    }

    /// Fires before every write attempt with the number of pending bytes.
    /// Only [`Action::Shutdown`] is honored from this callback.
    fn prewrite(&mut self, id: u64, pending: usize) -> Action {
        let _ = (id, pending);
        Action::None
    }

    /// Fires after every write attempt with the bytes written by that
    /// attempt and the bytes still buffered. Only [`Action::Shutdown`] is
    /// honored from this callback.
    fn postwrite(&mut self, id: u64, written: usize, remaining: usize) -> Action {
        let _ = (id, written, remaining);
        Action::None
    }

    /// Fires when a connection has closed. `error` is the connection's last
    /// I/O error, if any.
    fn closed(&mut self, id: u64, error: Option<&Error>) -> Action {
        let _ = (id, error);
        Action::None
    }

    /// Fires after an [`Action::Detach`]; the stream is the application's to
    /// keep. No `closed` event follows a detach.
    fn detached(&mut self, id: u64, stream: DetachedStream) -> Action {
        let _ = (id, stream);
        Action::None
    }

    /// Fires immediately after `serving` and again after each returned
    /// delay. The default implementation ticks once an hour and does
    /// nothing.
    fn tick(&mut self) -> (Duration, Action) {
        (Duration::from_secs(3600), Action::None)
    }
}

/// Carry buffer for `data` callbacks that parse framed protocols across
/// packet boundaries: push each packet with [`begin`](InputStream::begin),
/// parse out of [`buffered`](InputStream::buffered), then discard what was
/// consumed with [`advance`](InputStream::advance).
#[derive(Debug, Default)]
pub struct InputStream {
    buf: Vec<u8>,
}

impl InputStream {
    /// Append a freshly received packet to the unprocessed sequence.
    pub fn begin(&mut self, packet: &[u8]) {
        self.buf.extend_from_slice(packet);
    }

    /// All bytes received but not yet consumed, in arrival order.
    pub fn buffered(&self) -> &[u8] {
        &self.buf
    }

    /// Drop the first `n` consumed bytes, keeping the unprocessed tail.
    pub fn advance(&mut self, n: usize) {
        self.buf.drain(..n);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_lattice() {
        assert!(Action::None < Action::Detach);
        assert!(Action::Detach < Action::Close);
        assert!(Action::Close < Action::Shutdown);

        let mut a = Action::Close;
        a.raise(Action::Detach);
        assert_eq!(a, Action::Close, "raise never lowers");
        a.raise(Action::Shutdown);
        assert_eq!(a, Action::Shutdown);
    }

    #[test]
    fn input_stream_carries_partial_frames() {
        let mut s = InputStream::default();
        s.begin(b"hel");
        s.begin(b"lo ");
        assert_eq!(s.buffered(), b"hello ");
        s.advance(6);
        s.begin(b"world");
        assert_eq!(s.buffered(), b"world");
        s.advance(5);
        assert!(s.buffered().is_empty());
    }

    #[test]
    fn addr_display() {
        let ip: Addr = "127.0.0.1:80".parse::<SocketAddr>().unwrap().into();
        assert_eq!(ip.to_string(), "127.0.0.1:80");
        let ux = Addr::Unix(Some("/tmp/app.sock".into()));
        assert_eq!(ux.to_string(), "unix:///tmp/app.sock");
    }
}
