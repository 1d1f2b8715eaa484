//! Bound listen endpoints.
//!
//! The reactor back-end uses non-blocking mio sockets; the stdnet back-end
//! uses blocking standard-library sockets. Both are built here so the bind
//! logic (address resolution, SO_REUSEPORT, unix-path hygiene) stays in one
//! place. For unix sockets any existing filesystem entry is removed before
//! bind and again when the listener is dropped.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;

use log::{debug, warn};
use socket2::{Domain, Protocol, SockRef, Socket, TcpKeepalive, Type};

use crate::addr::{NetKind, ParsedAddr};
use crate::conn::Stream;
use crate::error::{Error, Result};
use crate::event::Addr;

pub(crate) fn resolve_ip(kind: NetKind, address: &str) -> Result<SocketAddr> {
    let spec = if address.is_empty() {
        if kind.wants_v6() { "[::]:0".to_string() } else { "0.0.0.0:0".to_string() }
    } else if address.starts_with(':') {
        if kind.wants_v6() {
            format!("[::]{address}")
        } else {
            format!("0.0.0.0{address}")
        }
    } else {
        address.to_string()
    };

    let candidates = spec
        .to_socket_addrs()
        .map_err(|_| Error::InvalidAddress(address.to_string()))?;
    candidates
        .into_iter()
        .find(|a| {
            if kind.wants_v4() {
                a.is_ipv4()
            } else if kind.wants_v6() {
                a.is_ipv6()
            } else {
                true
            }
        })
        .ok_or_else(|| Error::InvalidAddress(address.to_string()))
}

fn bind_ip_socket(
    sa: SocketAddr,
    ty: Type,
    proto: Protocol,
    reuse_port: bool,
    nonblocking: bool,
) -> io::Result<Socket> {
    let sock = Socket::new(Domain::for_address(sa), ty, Some(proto))?;
    sock.set_reuse_address(true)?;
    if reuse_port {
        sock.set_reuse_port(true)?;
    }
    sock.bind(&sa.into())?;
    if ty == Type::STREAM {
        sock.listen(1024)?;
    }
    sock.set_nonblocking(nonblocking)?;
    Ok(sock)
}

fn clear_unix_path(path: &str) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!("could not remove stale unix socket {path}: {e}");
        }
    }
}

enum ListenSocket {
    Tcp(mio::net::TcpListener),
    Udp(mio::net::UdpSocket),
    Unix(mio::net::UnixListener),
}

/// A bound endpoint for the reactor back-end. The socket is non-blocking
/// and stays registered for read-readiness for the lifetime of the loop.
pub(crate) struct Listener {
    pub kind: NetKind,
    pub addr: Addr,
    sock: ListenSocket,
    unix_path: Option<PathBuf>,
}

impl Listener {
    pub fn bind(parsed: &ParsedAddr) -> Result<Listener> {
        let listener = match parsed.kind {
            NetKind::Unix => {
                clear_unix_path(&parsed.address);
                let sock = mio::net::UnixListener::bind(&parsed.address)?;
                Listener {
                    kind: parsed.kind,
                    addr: Addr::Unix(Some(PathBuf::from(&parsed.address))),
                    sock: ListenSocket::Unix(sock),
                    unix_path: Some(PathBuf::from(&parsed.address)),
                }
            }
            kind if kind.is_udp() => {
                let sa = resolve_ip(kind, &parsed.address)?;
                let sock = bind_ip_socket(sa, Type::DGRAM, Protocol::UDP, parsed.opts.reuse_port(), true)?;
                let sock = mio::net::UdpSocket::from_std(std::net::UdpSocket::from(sock));
                let local = sock.local_addr()?;
                Listener {
                    kind,
                    addr: Addr::Ip(local),
                    sock: ListenSocket::Udp(sock),
                    unix_path: None,
                }
            }
            kind => {
                let sa = resolve_ip(kind, &parsed.address)?;
                let sock = bind_ip_socket(sa, Type::STREAM, Protocol::TCP, parsed.opts.reuse_port(), true)?;
                let sock = mio::net::TcpListener::from_std(std::net::TcpListener::from(sock));
                let local = sock.local_addr()?;
                Listener {
                    kind,
                    addr: Addr::Ip(local),
                    sock: ListenSocket::Tcp(sock),
                    unix_path: None,
                }
            }
        };
        debug!("listening on {}", listener.addr);
        Ok(listener)
    }

    pub fn is_udp(&self) -> bool {
        matches!(self.sock, ListenSocket::Udp(_))
    }

    pub fn register(&mut self, registry: &mio::Registry, token: mio::Token) -> io::Result<()> {
        let interest = mio::Interest::READABLE;
        match &mut self.sock {
            ListenSocket::Tcp(s) => registry.register(s, token, interest),
            ListenSocket::Udp(s) => registry.register(s, token, interest),
            ListenSocket::Unix(s) => registry.register(s, token, interest),
        }
    }

    /// Accepts one pending stream connection. `WouldBlock` means the
    /// backlog is drained.
    pub fn accept(&self) -> io::Result<Stream> {
        match &self.sock {
            ListenSocket::Tcp(s) => s.accept().map(|(stream, _)| Stream::Tcp(stream)),
            ListenSocket::Unix(s) => s.accept().map(|(stream, _)| Stream::Unix(stream)),
            ListenSocket::Udp(_) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "accept on a packet socket",
            )),
        }
    }

    pub fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        match &self.sock {
            ListenSocket::Udp(s) => s.recv_from(buf),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "recv_from on a stream socket",
            )),
        }
    }

    pub fn send_to(&self, buf: &[u8], peer: SocketAddr) -> io::Result<usize> {
        match &self.sock {
            ListenSocket::Udp(s) => s.send_to(buf, peer),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "send_to on a stream socket",
            )),
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Some(path) = &self.unix_path {
            if let Err(e) = std::fs::remove_file(path) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!("could not remove unix socket {}: {e}", path.display());
                }
            }
        }
    }
}

/// A blocking stream socket for the stdnet back-end.
pub(crate) enum StdStream {
    Tcp(std::net::TcpStream),
    Unix(std::os::unix::net::UnixStream),
}

impl StdStream {
    pub fn try_clone(&self) -> io::Result<StdStream> {
        match self {
            StdStream::Tcp(s) => s.try_clone().map(StdStream::Tcp),
            StdStream::Unix(s) => s.try_clone().map(StdStream::Unix),
        }
    }

    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        use std::io::Read;
        match self {
            StdStream::Tcp(s) => s.read(buf),
            StdStream::Unix(s) => s.read(buf),
        }
    }

    pub fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        use std::io::Write;
        match self {
            StdStream::Tcp(s) => s.write(buf),
            StdStream::Unix(s) => s.write(buf),
        }
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        match self {
            StdStream::Tcp(s) => s.set_read_timeout(timeout),
            StdStream::Unix(s) => s.set_read_timeout(timeout),
        }
    }

    pub fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        match self {
            StdStream::Tcp(s) => s.set_write_timeout(timeout),
            StdStream::Unix(s) => s.set_write_timeout(timeout),
        }
    }

    pub fn shutdown(&self) -> io::Result<()> {
        match self {
            StdStream::Tcp(s) => s.shutdown(std::net::Shutdown::Both),
            StdStream::Unix(s) => s.shutdown(std::net::Shutdown::Both),
        }
    }

    pub fn local_addr(&self) -> Option<Addr> {
        match self {
            StdStream::Tcp(s) => s.local_addr().ok().map(Addr::Ip),
            StdStream::Unix(s) => s
                .local_addr()
                .ok()
                .map(|a| Addr::Unix(a.as_pathname().map(Into::into))),
        }
    }

    pub fn peer_addr(&self) -> Option<Addr> {
        match self {
            StdStream::Tcp(s) => s.peer_addr().ok().map(Addr::Ip),
            StdStream::Unix(s) => s
                .peer_addr()
                .ok()
                .map(|a| Addr::Unix(a.as_pathname().map(Into::into))),
        }
    }

    pub fn set_keepalive(&self, time: Duration) -> io::Result<()> {
        if let StdStream::Tcp(s) = self {
            let sock = SockRef::from(s);
            sock.set_keepalive(true)?;
            sock.set_tcp_keepalive(&TcpKeepalive::new().with_time(time))?;
        }
        Ok(())
    }

    /// Consumes the stream into a blocking socket2 handle for detach.
    pub fn into_socket(self) -> io::Result<Socket> {
        let sock = match self {
            StdStream::Tcp(s) => Socket::from(s),
            StdStream::Unix(s) => Socket::from(s),
        };
        sock.set_nonblocking(false)?;
        sock.set_read_timeout(None)?;
        sock.set_write_timeout(None)?;
        Ok(sock)
    }
}

enum StdListenSocket {
    Tcp(std::net::TcpListener),
    Unix(std::os::unix::net::UnixListener),
}

/// A bound blocking endpoint for the stdnet back-end. Packet sockets are
/// not supported there.
pub(crate) struct StdListener {
    pub kind: NetKind,
    pub addr: Addr,
    sock: StdListenSocket,
    unix_path: Option<PathBuf>,
}

impl StdListener {
    pub fn bind(parsed: &ParsedAddr) -> Result<StdListener> {
        if parsed.kind.is_udp() {
            return Err(Error::Unsupported(
                "udp is not available on the stdlib back-end",
            ));
        }
        let listener = if parsed.kind.is_unix() {
            clear_unix_path(&parsed.address);
            let sock = std::os::unix::net::UnixListener::bind(&parsed.address)?;
            StdListener {
                kind: parsed.kind,
                addr: Addr::Unix(Some(PathBuf::from(&parsed.address))),
                sock: StdListenSocket::Unix(sock),
                unix_path: Some(PathBuf::from(&parsed.address)),
            }
        } else {
            let sa = resolve_ip(parsed.kind, &parsed.address)?;
            let sock = bind_ip_socket(sa, Type::STREAM, Protocol::TCP, parsed.opts.reuse_port(), false)?;
            let sock = std::net::TcpListener::from(sock);
            let local = sock.local_addr()?;
            StdListener {
                kind: parsed.kind,
                addr: Addr::Ip(local),
                sock: StdListenSocket::Tcp(sock),
                unix_path: None,
            }
        };
        debug!("listening on {} (stdlib back-end)", listener.addr);
        Ok(listener)
    }

    /// Blocks until a connection arrives.
    pub fn accept(&self) -> io::Result<StdStream> {
        match &self.sock {
            StdListenSocket::Tcp(s) => s.accept().map(|(stream, _)| StdStream::Tcp(stream)),
            StdListenSocket::Unix(s) => s.accept().map(|(stream, _)| StdStream::Unix(stream)),
        }
    }

    /// Connects to self to unblock an accept loop parked in `accept`.
    pub fn nudge(&self) {
        match (&self.sock, &self.addr) {
            (StdListenSocket::Tcp(_), Addr::Ip(sa)) => {
                let _ = std::net::TcpStream::connect_timeout(sa, Duration::from_millis(100));
            }
            (StdListenSocket::Unix(_), Addr::Unix(Some(path))) => {
                let _ = std::os::unix::net::UnixStream::connect(path);
            }
            _ => {}
        }
    }
}

impl Drop for StdListener {
    fn drop(&mut self) {
        if let Some(path) = &self.unix_path {
            if let Err(e) = std::fs::remove_file(path) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!("could not remove unix socket {}: {e}", path.display());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::parse_addr;

    #[test]
    fn binds_tcp_ephemeral() {
        let parsed = parse_addr("tcp://127.0.0.1:0").unwrap();
        let ln = Listener::bind(&parsed).unwrap();
        match ln.addr {
            Addr::Ip(sa) => assert_ne!(sa.port(), 0),
            _ => panic!("expected an ip address"),
        }
    }

    #[test]
    fn binds_empty_tcp_address() {
        let parsed = parse_addr("tcp://").unwrap();
        let ln = Listener::bind(&parsed).unwrap();
        assert!(matches!(ln.addr, Addr::Ip(sa) if sa.port() != 0));
    }

    #[test]
    fn binds_bare_port() {
        let parsed = parse_addr("tcp://:0").unwrap();
        Listener::bind(&parsed).unwrap();
    }

    #[test]
    fn binds_udp() {
        let parsed = parse_addr("udp://127.0.0.1:0").unwrap();
        let ln = Listener::bind(&parsed).unwrap();
        assert!(ln.is_udp());
    }

    #[test]
    fn unix_path_removed_on_drop() {
        let path = std::env::temp_dir().join(format!("mill-serve-ln-{}", std::process::id()));
        let spec = format!("unix://{}", path.display());
        let parsed = parse_addr(&spec).unwrap();
        let ln = Listener::bind(&parsed).unwrap();
        assert!(path.exists());
        drop(ln);
        assert!(!path.exists());
    }

    #[test]
    fn stdlib_rejects_udp() {
        let parsed = parse_addr("udp-net://127.0.0.1:0").unwrap();
        assert!(StdListener::bind(&parsed).is_err());
    }

    #[test]
    fn invalid_host_is_rejected() {
        let parsed = parse_addr("tcp://definitely-not-a-host.invalid.:80").unwrap();
        assert!(Listener::bind(&parsed).is_err());
    }
}
