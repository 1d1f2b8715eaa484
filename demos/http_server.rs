use std::collections::HashMap;

use mill_serve::{serve, Action, Events, InputStream, Server};

const BODY: &str = "<h1>Hello from mill-serve</h1>\n";

/// Minimal HTTP/1.1 responder: reads until a blank line, answers every
/// request with the same page, honors Connection: close.
struct HttpServer {
    requests: HashMap<u64, InputStream>,
}

impl HttpServer {
    fn respond(keep_alive: bool) -> Vec<u8> {
        let connection = if keep_alive { "keep-alive" } else { "close" };
        format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: {}\r\nConnection: {}\r\n\r\n{}",
            BODY.len(),
            connection,
            BODY
        )
        .into_bytes()
    }
}

impl Events for HttpServer {
    fn serving(&mut self, server: &Server) -> Action {
        println!("http server listening on {}", server.addrs[0]);
        Action::None
    }

    fn data(&mut self, id: u64, input: &[u8]) -> (Vec<u8>, Action) {
        let stream = self.requests.entry(id).or_default();
        stream.begin(input);

        let mut out = Vec::new();
        let mut action = Action::None;
        loop {
            let buffered = stream.buffered();
            let Some(end) = buffered.windows(4).position(|w| w == b"\r\n\r\n") else {
                break;
            };
            let head = String::from_utf8_lossy(&buffered[..end]).to_ascii_lowercase();
            let keep_alive = !head.contains("connection: close");
            out.extend_from_slice(&Self::respond(keep_alive));
            stream.advance(end + 4);
            if !keep_alive {
                action = Action::Close;
                break;
            }
        }
        (out, action)
    }

    fn closed(&mut self, id: u64, _error: Option<&mill_serve::Error>) -> Action {
        self.requests.remove(&id);
        Action::None
    }
}

fn main() -> mill_serve::Result<()> {
    let addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "tcp://127.0.0.1:8080".into());
    serve(
        &mut HttpServer {
            requests: HashMap::new(),
        },
        &[&addr],
    )
}
