//! End-to-end tests against real sockets on ephemeral ports.
//!
//! Each scenario runs `serve` on a background thread, learns the bound
//! address through the `serving` callback, drives it with plain std
//! clients, and asserts on the callback ledger once `serve` returns.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use mill_serve::{
    serve, translate, Action, Addr, Error, Events, Info, InputStream, Options, Server, WireReader,
    WireWriter,
};
use rand::{Rng, RngCore};

fn ip_of(server: &Server) -> SocketAddr {
    match &server.addrs[0] {
        Addr::Ip(sa) => *sa,
        other => panic!("expected an ip listener, got {other}"),
    }
}

const CLIENT_TIMEOUT: Duration = Duration::from_secs(10);

fn connect(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).expect("client connect");
    stream.set_read_timeout(Some(CLIENT_TIMEOUT)).unwrap();
    stream
}

// ---------------------------------------------------------------- echo ---

struct EchoEvents {
    addr_tx: Sender<SocketAddr>,
    shutdown_after: usize,
    closed: usize,
    prewrites: Arc<AtomicUsize>,
    postwrites: Arc<AtomicUsize>,
}

impl Events for EchoEvents {
    fn serving(&mut self, server: &Server) -> Action {
        self.addr_tx.send(ip_of(server)).unwrap();
        Action::None
    }

    fn data(&mut self, _id: u64, input: &[u8]) -> (Vec<u8>, Action) {
        (input.to_vec(), Action::None)
    }

    fn prewrite(&mut self, _id: u64, pending: usize) -> Action {
        assert!(pending > 0, "prewrite only fires with pending bytes");
        self.prewrites.fetch_add(1, Ordering::SeqCst);
        Action::None
    }

    fn postwrite(&mut self, _id: u64, _written: usize, _remaining: usize) -> Action {
        self.postwrites.fetch_add(1, Ordering::SeqCst);
        Action::None
    }

    fn closed(&mut self, _id: u64, _error: Option<&Error>) -> Action {
        self.closed += 1;
        if self.closed == self.shutdown_after {
            Action::Shutdown
        } else {
            Action::None
        }
    }
}

fn run_echo_clients(addr: SocketAddr, count: usize, payload_len: usize) {
    let clients: Vec<_> = (0..count)
        .map(|_| {
            thread::spawn(move || {
                let mut stream = connect(addr);
                let mut rng = rand::thread_rng();
                let mut payload = vec![0u8; payload_len];
                rng.fill_bytes(&mut payload);

                let mut sent = 0;
                while sent < payload.len() {
                    let chunk = rng
                        .gen_range(1..=32 * 1024)
                        .min(payload.len() - sent);
                    stream.write_all(&payload[sent..sent + chunk]).unwrap();
                    let mut back = vec![0u8; chunk];
                    stream.read_exact(&mut back).unwrap();
                    assert_eq!(back, payload[sent..sent + chunk], "echo must be byte-exact");
                    sent += chunk;
                }
            })
        })
        .collect();
    for client in clients {
        client.join().unwrap();
    }
}

#[test]
fn echo_ten_clients() {
    let (addr_tx, addr_rx) = channel();
    let prewrites = Arc::new(AtomicUsize::new(0));
    let postwrites = Arc::new(AtomicUsize::new(0));
    let (pre, post) = (prewrites.clone(), postwrites.clone());

    let server = thread::spawn(move || {
        let mut events = EchoEvents {
            addr_tx,
            shutdown_after: 10,
            closed: 0,
            prewrites: pre,
            postwrites: post,
        };
        serve(&mut events, &["tcp://127.0.0.1:0"])
    });

    let addr = addr_rx.recv().unwrap();
    run_echo_clients(addr, 10, 500 * 1024);

    server.join().unwrap().unwrap();
    assert_eq!(
        prewrites.load(Ordering::SeqCst),
        postwrites.load(Ordering::SeqCst),
        "every write attempt is bracketed"
    );
    assert!(prewrites.load(Ordering::SeqCst) > 0);
}

#[test]
fn echo_over_stdlib_backend() {
    let (addr_tx, addr_rx) = channel();
    let prewrites = Arc::new(AtomicUsize::new(0));
    let postwrites = Arc::new(AtomicUsize::new(0));
    let (pre, post) = (prewrites.clone(), postwrites.clone());

    let server = thread::spawn(move || {
        let mut events = EchoEvents {
            addr_tx,
            shutdown_after: 2,
            closed: 0,
            prewrites: pre,
            postwrites: post,
        };
        serve(&mut events, &["tcp-net://127.0.0.1:0"])
    });

    let addr = addr_rx.recv().unwrap();
    run_echo_clients(addr, 2, 64 * 1024);

    server.join().unwrap().unwrap();
    assert_eq!(
        prewrites.load(Ordering::SeqCst),
        postwrites.load(Ordering::SeqCst)
    );
}

// ---------------------------------------------------------- wake-driven ---

struct WakeShared {
    server: Mutex<Option<Server>>,
    id: Mutex<Option<u64>>,
    queue: Mutex<Vec<Vec<u8>>>,
}

struct WakeEvents {
    addr_tx: Sender<SocketAddr>,
    shared: Arc<WakeShared>,
}

impl Events for WakeEvents {
    fn serving(&mut self, server: &Server) -> Action {
        *self.shared.server.lock().unwrap() = Some(server.clone());
        self.addr_tx.send(ip_of(server)).unwrap();
        Action::None
    }

    fn opened(&mut self, id: u64, _info: &Info) -> (Vec<u8>, Options, Action) {
        *self.shared.id.lock().unwrap() = Some(id);
        (Vec::new(), Options::default(), Action::None)
    }

    fn data(&mut self, _id: u64, input: &[u8]) -> (Vec<u8>, Action) {
        if !input.is_empty() {
            return (Vec::new(), Action::None);
        }
        let mut out = Vec::new();
        for msg in self.shared.queue.lock().unwrap().drain(..) {
            out.extend_from_slice(&msg);
        }
        (out, Action::None)
    }

    fn closed(&mut self, _id: u64, _error: Option<&Error>) -> Action {
        Action::Shutdown
    }
}

#[test]
fn wake_driven_echo() {
    const MESSAGES: usize = 1000;

    let (addr_tx, addr_rx) = channel();
    let shared = Arc::new(WakeShared {
        server: Mutex::new(None),
        id: Mutex::new(None),
        queue: Mutex::new(Vec::new()),
    });
    let worker_shared = shared.clone();

    let server = thread::spawn(move || {
        let mut events = WakeEvents { addr_tx, shared };
        serve(&mut events, &["tcp://127.0.0.1:0"])
    });

    let addr = addr_rx.recv().unwrap();
    let mut stream = connect(addr);

    let expected: Vec<u8> = (0..MESSAGES)
        .flat_map(|i| format!("msg-{i};").into_bytes())
        .collect();

    let worker = thread::spawn(move || {
        let id = loop {
            if let Some(id) = *worker_shared.id.lock().unwrap() {
                break id;
            }
            thread::sleep(Duration::from_millis(1));
        };
        let server = worker_shared.server.lock().unwrap().clone().unwrap();
        for i in 0..MESSAGES {
            worker_shared
                .queue
                .lock()
                .unwrap()
                .push(format!("msg-{i};").into_bytes());
            assert!(server.wake(id), "wake on a live connection succeeds");
        }
    });

    let mut got = vec![0u8; expected.len()];
    stream.read_exact(&mut got).unwrap();
    assert_eq!(got, expected, "woken replies arrive complete and in order");

    worker.join().unwrap();
    drop(stream);
    server.join().unwrap().unwrap();
}

// ----------------------------------------------------------------- tick ---

struct TickEvents {
    ticks: usize,
}

impl Events for TickEvents {
    fn tick(&mut self) -> (Duration, Action) {
        if self.ticks < 25 {
            self.ticks += 1;
            (Duration::from_millis(10), Action::None)
        } else {
            (Duration::from_millis(10), Action::Shutdown)
        }
    }
}

#[test]
fn tick_drives_shutdown_on_schedule() {
    let start = Instant::now();
    serve(&mut TickEvents { ticks: 0 }, &["tcp://127.0.0.1:0"]).unwrap();
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(240), "elapsed {elapsed:?}");
    assert!(elapsed <= Duration::from_secs(1), "elapsed {elapsed:?}");
}

// -------------------------------------------------- shutdown under load ---

struct LoadEvents {
    addr_tx: Sender<SocketAddr>,
    opened: Arc<AtomicUsize>,
    closed: Arc<AtomicUsize>,
}

impl Events for LoadEvents {
    fn serving(&mut self, server: &Server) -> Action {
        self.addr_tx.send(ip_of(server)).unwrap();
        Action::None
    }

    fn opened(&mut self, _id: u64, _info: &Info) -> (Vec<u8>, Options, Action) {
        self.opened.fetch_add(1, Ordering::SeqCst);
        (Vec::new(), Options::default(), Action::None)
    }

    fn closed(&mut self, _id: u64, _error: Option<&Error>) -> Action {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Action::None
    }

    fn tick(&mut self) -> (Duration, Action) {
        if self.opened.load(Ordering::SeqCst) >= 10 {
            (Duration::from_millis(5), Action::Shutdown)
        } else {
            (Duration::from_millis(5), Action::None)
        }
    }
}

#[test]
fn shutdown_closes_every_connection() {
    let (addr_tx, addr_rx) = channel();
    let opened = Arc::new(AtomicUsize::new(0));
    let closed = Arc::new(AtomicUsize::new(0));
    let (o, c) = (opened.clone(), closed.clone());

    let server = thread::spawn(move || {
        let mut events = LoadEvents {
            addr_tx,
            opened: o,
            closed: c,
        };
        serve(&mut events, &["tcp://127.0.0.1:0"])
    });

    let addr = addr_rx.recv().unwrap();
    let clients: Vec<_> = (0..10)
        .map(|_| {
            thread::spawn(move || {
                let mut stream = connect(addr);
                let mut buf = [0u8; 64];
                // blocks until the server tears the connection down
                match stream.read(&mut buf) {
                    Ok(0) | Err(_) => {}
                    Ok(n) => panic!("unexpected {n} bytes from a silent server"),
                }
            })
        })
        .collect();

    server.join().unwrap().unwrap();
    for client in clients {
        client.join().unwrap();
    }
    assert_eq!(opened.load(Ordering::SeqCst), 10);
    assert_eq!(closed.load(Ordering::SeqCst), 10, "every open got its close");
}

// --------------------------------------------------------------- detach ---

const DETACH_TOTAL: usize = 10 * 1024;
const DETACH_MARKER: &[u8] = b"--detached--";

struct DetachEvents {
    addr_tx: Sender<SocketAddr>,
    bufs: HashMap<u64, InputStream>,
    echoes: HashMap<u64, Vec<u8>>,
}

impl Events for DetachEvents {
    fn serving(&mut self, server: &Server) -> Action {
        self.addr_tx.send(ip_of(server)).unwrap();
        Action::None
    }

    fn data(&mut self, id: u64, input: &[u8]) -> (Vec<u8>, Action) {
        let stream = self.bufs.entry(id).or_default();
        stream.begin(input);
        if stream.buffered().len() < DETACH_TOTAL {
            return (Vec::new(), Action::None);
        }
        let all = stream.buffered().to_vec();
        stream.advance(all.len());
        assert!(all.windows(DETACH_MARKER.len()).any(|w| w == DETACH_MARKER));
        self.echoes.insert(id, all.clone());
        (all, Action::Detach)
    }

    fn detached(&mut self, id: u64, mut stream: mill_serve::DetachedStream) -> Action {
        let seq = self.echoes.remove(&id).unwrap();
        stream.write_all(&seq).unwrap();
        // dropping the handle closes the socket
        Action::Shutdown
    }

    fn closed(&mut self, _id: u64, _error: Option<&Error>) -> Action {
        panic!("a detached connection never fires closed");
    }
}

#[test]
fn detach_hands_the_socket_over() {
    let (addr_tx, addr_rx) = channel();
    let server = thread::spawn(move || {
        let mut events = DetachEvents {
            addr_tx,
            bufs: HashMap::new(),
            echoes: HashMap::new(),
        };
        serve(&mut events, &["tcp://127.0.0.1:0"])
    });

    let addr = addr_rx.recv().unwrap();
    let mut stream = connect(addr);

    let mut payload = vec![0u8; DETACH_TOTAL];
    rand::thread_rng().fill_bytes(&mut payload);
    let mid = DETACH_TOTAL / 2;
    payload[mid..mid + DETACH_MARKER.len()].copy_from_slice(DETACH_MARKER);

    stream.write_all(&payload).unwrap();

    let mut first = vec![0u8; DETACH_TOTAL];
    stream.read_exact(&mut first).unwrap();
    assert_eq!(first, payload, "echo before the hand-off");

    let mut second = vec![0u8; DETACH_TOTAL];
    stream.read_exact(&mut second).unwrap();
    assert_eq!(second, payload, "echo after the hand-off");

    let mut rest = Vec::new();
    stream.read_to_end(&mut rest).unwrap();
    assert!(rest.is_empty(), "eof after the detached side closes");

    server.join().unwrap().unwrap();
}

// ---------------------------------------------------------------- udp ---

struct UdpEvents {
    addr_tx: Sender<SocketAddr>,
    opened: Arc<AtomicUsize>,
}

impl Events for UdpEvents {
    fn serving(&mut self, server: &Server) -> Action {
        self.addr_tx.send(ip_of(server)).unwrap();
        Action::None
    }

    fn opened(&mut self, _id: u64, info: &Info) -> (Vec<u8>, Options, Action) {
        assert_eq!(info.addr_index, Some(0));
        self.opened.fetch_add(1, Ordering::SeqCst);
        (Vec::new(), Options::default(), Action::None)
    }

    fn data(&mut self, _id: u64, input: &[u8]) -> (Vec<u8>, Action) {
        if input == b"quit" {
            (b"bye".to_vec(), Action::Shutdown)
        } else {
            (input.to_vec(), Action::None)
        }
    }
}

#[test]
fn udp_echoes_per_peer() {
    let (addr_tx, addr_rx) = channel();
    let opened = Arc::new(AtomicUsize::new(0));
    let o = opened.clone();

    let server = thread::spawn(move || {
        let mut events = UdpEvents { addr_tx, opened: o };
        serve(&mut events, &["udp://127.0.0.1:0"])
    });

    let addr = addr_rx.recv().unwrap();
    let client = UdpSocket::bind("127.0.0.1:0").unwrap();
    client.set_read_timeout(Some(CLIENT_TIMEOUT)).unwrap();
    client.connect(addr).unwrap();

    let mut buf = [0u8; 128];
    for i in 0..5 {
        let msg = format!("datagram-{i}");
        client.send(msg.as_bytes()).unwrap();
        let n = client.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], msg.as_bytes());
    }
    client.send(b"quit").unwrap();
    let n = client.recv(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"bye");

    server.join().unwrap().unwrap();
    assert_eq!(opened.load(Ordering::SeqCst), 1, "one opened per peer address");
}

struct UdpShutdownEvents {
    addr_tx: Sender<SocketAddr>,
    opened: Arc<AtomicUsize>,
    closed: Arc<AtomicUsize>,
}

impl Events for UdpShutdownEvents {
    fn serving(&mut self, server: &Server) -> Action {
        self.addr_tx.send(ip_of(server)).unwrap();
        Action::None
    }

    fn opened(&mut self, _id: u64, _info: &Info) -> (Vec<u8>, Options, Action) {
        self.opened.fetch_add(1, Ordering::SeqCst);
        (Vec::new(), Options::default(), Action::None)
    }

    fn data(&mut self, _id: u64, input: &[u8]) -> (Vec<u8>, Action) {
        (input.to_vec(), Action::None)
    }

    fn closed(&mut self, _id: u64, _error: Option<&Error>) -> Action {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Action::None
    }

    fn tick(&mut self) -> (Duration, Action) {
        if self.opened.load(Ordering::SeqCst) >= 1 {
            (Duration::from_millis(5), Action::Shutdown)
        } else {
            (Duration::from_millis(5), Action::None)
        }
    }
}

#[test]
fn udp_peer_gets_closed_at_shutdown() {
    let (addr_tx, addr_rx) = channel();
    let opened = Arc::new(AtomicUsize::new(0));
    let closed = Arc::new(AtomicUsize::new(0));
    let (o, c) = (opened.clone(), closed.clone());

    let server = thread::spawn(move || {
        let mut events = UdpShutdownEvents {
            addr_tx,
            opened: o,
            closed: c,
        };
        serve(&mut events, &["udp://127.0.0.1:0"])
    });

    let addr = addr_rx.recv().unwrap();
    let client = UdpSocket::bind("127.0.0.1:0").unwrap();
    client.set_read_timeout(Some(CLIENT_TIMEOUT)).unwrap();
    client.connect(addr).unwrap();

    // the peer never asks to close; the tick brings the server down
    client.send(b"still here").unwrap();
    let mut buf = [0u8; 32];
    let n = client.recv(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"still here");

    server.join().unwrap().unwrap();
    assert_eq!(opened.load(Ordering::SeqCst), 1);
    assert_eq!(closed.load(Ordering::SeqCst), 1, "shutdown pairs the udp opened");
}

// ---------------------------------------------------------------- dial ---

struct DialEvents {
    dialed: Option<u64>,
    saw_hello: Arc<AtomicUsize>,
    saw_world: Arc<AtomicUsize>,
}

impl Events for DialEvents {
    fn serving(&mut self, server: &Server) -> Action {
        let target = format!("tcp://{}", ip_of(server));
        let id = server
            .dial(&target, Some(Duration::from_secs(5)))
            .expect("self-dial");
        self.dialed = Some(id);
        Action::None
    }

    fn opened(&mut self, id: u64, info: &Info) -> (Vec<u8>, Options, Action) {
        if info.addr_index.is_none() {
            assert_eq!(Some(id), self.dialed, "outbound connection keeps its id");
            (b"hello".to_vec(), Options::default(), Action::None)
        } else {
            (Vec::new(), Options::default(), Action::None)
        }
    }

    fn data(&mut self, id: u64, input: &[u8]) -> (Vec<u8>, Action) {
        if Some(id) == self.dialed {
            assert_eq!(input, b"world");
            self.saw_world.fetch_add(1, Ordering::SeqCst);
            (Vec::new(), Action::Close)
        } else {
            assert_eq!(input, b"hello");
            self.saw_hello.fetch_add(1, Ordering::SeqCst);
            (b"world".to_vec(), Action::None)
        }
    }

    fn closed(&mut self, id: u64, _error: Option<&Error>) -> Action {
        if Some(id) == self.dialed {
            Action::Shutdown
        } else {
            Action::None
        }
    }
}

#[test]
fn dial_joins_the_same_loop() {
    let saw_hello = Arc::new(AtomicUsize::new(0));
    let saw_world = Arc::new(AtomicUsize::new(0));
    let (h, w) = (saw_hello.clone(), saw_world.clone());

    let mut events = DialEvents {
        dialed: None,
        saw_hello: h,
        saw_world: w,
    };
    serve(&mut events, &["tcp://127.0.0.1:0"]).unwrap();

    assert_eq!(saw_hello.load(Ordering::SeqCst), 1);
    assert_eq!(saw_world.load(Ordering::SeqCst), 1);
}

// ---------------------------------------------------------- translation ---

const XOR_KEY: u8 = 0x5a;

struct XorReader(WireReader);

impl Read for XorReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.0.read(buf)?;
        for b in &mut buf[..n] {
            *b ^= XOR_KEY;
        }
        Ok(n)
    }
}

struct XorWriter(WireWriter);

impl Write for XorWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let encoded: Vec<u8> = buf.iter().map(|b| b ^ XOR_KEY).collect();
        self.0.write_all(&encoded)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.0.flush()
    }
}

struct TranslatedEcho {
    addr_tx: Sender<SocketAddr>,
}

impl Events for TranslatedEcho {
    fn serving(&mut self, server: &Server) -> Action {
        self.addr_tx.send(ip_of(server)).unwrap();
        Action::None
    }

    fn data(&mut self, _id: u64, input: &[u8]) -> (Vec<u8>, Action) {
        (input.to_vec(), Action::None)
    }

    fn closed(&mut self, _id: u64, _error: Option<&Error>) -> Action {
        Action::Shutdown
    }
}

#[test]
fn translated_echo_is_transparent() {
    let (addr_tx, addr_rx) = channel();
    let server = thread::spawn(move || {
        let mut events = translate(
            TranslatedEcho { addr_tx },
            |_id, _info| true,
            |_id, wire| {
                let (rd, wr) = wire.split();
                (
                    Box::new(XorReader(rd)) as Box<dyn Read + Send>,
                    Box::new(XorWriter(wr)) as Box<dyn Write + Send>,
                )
            },
        );
        serve(&mut events, &["tcp://127.0.0.1:0"])
    });

    let addr = addr_rx.recv().unwrap();
    let mut stream = connect(addr);

    for i in 0..20 {
        let msg = format!("translated-message-{i}");
        stream.write_all(msg.as_bytes()).unwrap();
        let mut back = vec![0u8; msg.len()];
        stream.read_exact(&mut back).unwrap();
        assert_eq!(back, msg.into_bytes(), "xor in, xor out: the wire is transparent");
    }

    drop(stream);
    server.join().unwrap().unwrap();
}

// ---------------------------------------------------------- bad address ---

struct NoopEvents;

impl Events for NoopEvents {}

struct ShutdownImmediately;

impl Events for ShutdownImmediately {
    fn serving(&mut self, _server: &Server) -> Action {
        Action::Shutdown
    }
}

#[test]
fn bad_scheme_fails_before_the_loop() {
    let err = serve(&mut NoopEvents, &["tulip://foo"]).unwrap_err();
    assert!(matches!(err, Error::UnsupportedScheme(s) if s == "tulip"));
}

#[test]
fn empty_tcp_address_binds_ephemeral() {
    serve(&mut ShutdownImmediately, &["tcp://"]).unwrap();
}

#[test]
fn unix_socket_round_trip() {
    let path = std::env::temp_dir().join(format!("mill-serve-e2e-{}.sock", std::process::id()));
    let spec = format!("unix://{}", path.display());

    let (done_tx, done_rx) = channel();
    let server = {
        let spec = spec.clone();
        thread::spawn(move || {
            let mut events = UnixEcho { ready: done_tx };
            serve(&mut events, &[spec.as_str()])
        })
    };

    done_rx.recv().unwrap();
    let mut stream = std::os::unix::net::UnixStream::connect(&path).unwrap();
    stream.set_read_timeout(Some(CLIENT_TIMEOUT)).unwrap();
    stream.write_all(b"over the socket file").unwrap();
    let mut back = [0u8; 20];
    stream.read_exact(&mut back).unwrap();
    assert_eq!(&back, b"over the socket file");

    drop(stream);
    server.join().unwrap().unwrap();
    assert!(!path.exists(), "the socket file is removed on close");
}

struct UnixEcho {
    ready: Sender<()>,
}

impl Events for UnixEcho {
    fn serving(&mut self, server: &Server) -> Action {
        assert!(matches!(server.addrs[0], Addr::Unix(Some(_))));
        self.ready.send(()).unwrap();
        Action::None
    }

    fn data(&mut self, _id: u64, input: &[u8]) -> (Vec<u8>, Action) {
        (input.to_vec(), Action::None)
    }

    fn closed(&mut self, _id: u64, _error: Option<&Error>) -> Action {
        Action::Shutdown
    }
}
