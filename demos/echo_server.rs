use mill_serve::{serve, Action, Error, Events, Info, Options, Server};

struct EchoServer {
    clients: usize,
}

impl Events for EchoServer {
    fn serving(&mut self, server: &Server) -> Action {
        for addr in &server.addrs {
            println!("echo server listening on {addr}");
        }
        Action::None
    }

    fn opened(&mut self, id: u64, info: &Info) -> (Vec<u8>, Options, Action) {
        self.clients += 1;
        println!(
            "client {id} connected from {} ({} online)",
            info.remote_addr
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_else(|| "?".into()),
            self.clients
        );
        (Vec::new(), Options::default(), Action::None)
    }

    fn data(&mut self, _id: u64, input: &[u8]) -> (Vec<u8>, Action) {
        (input.to_vec(), Action::None)
    }

    fn closed(&mut self, id: u64, error: Option<&Error>) -> Action {
        self.clients -= 1;
        match error {
            Some(e) => println!("client {id} dropped: {e}"),
            None => println!("client {id} disconnected"),
        }
        Action::None
    }
}

fn main() -> mill_serve::Result<()> {
    let addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "tcp://127.0.0.1:9851".into());
    serve(&mut EchoServer { clients: 0 }, &[&addr])
}
