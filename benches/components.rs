use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use mill_serve::{serve, Action, Addr, Error, Events, InputStream, Server};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::mpsc::{channel, Sender};
use std::thread;

struct BenchEcho {
    addr_tx: Sender<SocketAddr>,
}

impl Events for BenchEcho {
    fn serving(&mut self, server: &Server) -> Action {
        if let Addr::Ip(sa) = &server.addrs[0] {
            self.addr_tx.send(*sa).unwrap();
        }
        Action::None
    }

    fn data(&mut self, _id: u64, input: &[u8]) -> (Vec<u8>, Action) {
        (input.to_vec(), Action::None)
    }

    fn closed(&mut self, _id: u64, _error: Option<&Error>) -> Action {
        Action::Shutdown
    }
}

fn bench_echo_roundtrip(c: &mut Criterion) {
    let mut group = c.benchmark_group("echo_roundtrip");

    for msg_size in [128usize, 1024, 4096] {
        group.throughput(Throughput::Bytes(msg_size as u64));

        group.bench_with_input(
            BenchmarkId::new("message_size", msg_size),
            &msg_size,
            |b, &size| {
                let (addr_tx, addr_rx) = channel();
                let server = thread::spawn(move || {
                    let mut events = BenchEcho { addr_tx };
                    let _ = serve(&mut events, &["tcp://127.0.0.1:0"]);
                });
                let addr = addr_rx.recv().unwrap();

                let mut stream = TcpStream::connect(addr).unwrap();
                stream.set_nodelay(true).unwrap();

                let payload = vec![0xabu8; size];
                let mut back = vec![0u8; size];
                b.iter(|| {
                    stream.write_all(&payload).unwrap();
                    stream.read_exact(&mut back).unwrap();
                    black_box(&back);
                });

                drop(stream);
                let _ = server.join();
            },
        );
    }
    group.finish();
}

fn bench_input_stream(c: &mut Criterion) {
    c.bench_function("input_stream_carry", |b| {
        let packet = vec![0x55u8; 1024];
        b.iter(|| {
            let mut stream = InputStream::default();
            for _ in 0..16 {
                stream.begin(black_box(&packet));
            }
            let len = stream.buffered().len();
            stream.advance(len);
            black_box(len)
        });
    });
}

criterion_group!(benches, bench_echo_roundtrip, bench_input_stream);
criterion_main!(benches);
