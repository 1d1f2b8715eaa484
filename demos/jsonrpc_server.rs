use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use mill_serve::{serve, Action, Events, Info, InputStream, Options, Server};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug)]
enum RpcRequest {
    Ping,
    Echo { message: String },
    Add { a: i32, b: i32 },
    GetTime,
    SetValue { key: String, value: String },
    GetValue { key: String },
    ListKeys,
}

#[derive(Serialize, Deserialize, Debug)]
enum RpcResponse {
    Pong,
    Echo { message: String },
    Sum { result: i32 },
    Time { timestamp: u64 },
    ValueSet { key: String },
    Value { key: String, value: Option<String> },
    Keys { keys: Vec<String> },
    Error { message: String },
}

/// Newline-delimited JSON-RPC over the event loop. One InputStream per
/// connection carries partial lines across data callbacks.
struct RpcServer {
    streams: HashMap<u64, InputStream>,
    store: HashMap<String, String>,
}

impl RpcServer {
    fn handle(&mut self, request: RpcRequest) -> RpcResponse {
        match request {
            RpcRequest::Ping => RpcResponse::Pong,
            RpcRequest::Echo { message } => RpcResponse::Echo { message },
            RpcRequest::Add { a, b } => RpcResponse::Sum { result: a + b },
            RpcRequest::GetTime => RpcResponse::Time {
                timestamp: SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_secs(),
            },
            RpcRequest::SetValue { key, value } => {
                self.store.insert(key.clone(), value);
                RpcResponse::ValueSet { key }
            }
            RpcRequest::GetValue { key } => {
                let value = self.store.get(&key).cloned();
                RpcResponse::Value { key, value }
            }
            RpcRequest::ListKeys => RpcResponse::Keys {
                keys: self.store.keys().cloned().collect(),
            },
        }
    }
}

impl Events for RpcServer {
    fn serving(&mut self, server: &Server) -> Action {
        println!("[INFO] rpc server listening on {}", server.addrs[0]);
        Action::None
    }

    fn opened(&mut self, id: u64, info: &Info) -> (Vec<u8>, Options, Action) {
        if let Some(remote) = &info.remote_addr {
            println!("[INFO] new rpc connection {id} from {remote}");
        }
        (Vec::new(), Options::default(), Action::None)
    }

    fn data(&mut self, id: u64, input: &[u8]) -> (Vec<u8>, Action) {
        let stream = self.streams.entry(id).or_default();
        stream.begin(input);

        let mut lines = Vec::new();
        loop {
            let buffered = self.streams.get(&id).unwrap().buffered();
            let Some(nl) = buffered.iter().position(|&b| b == b'\n') else {
                break;
            };
            lines.push(buffered[..nl].to_vec());
            self.streams.get_mut(&id).unwrap().advance(nl + 1);
        }

        let mut out = Vec::new();
        for line in lines {
            if line.is_empty() {
                continue;
            }
            let response = match serde_json::from_slice::<RpcRequest>(&line) {
                Ok(request) => self.handle(request),
                Err(e) => RpcResponse::Error {
                    message: format!("bad request: {e}"),
                },
            };
            match serde_json::to_vec(&response) {
                Ok(mut bytes) => {
                    bytes.push(b'\n');
                    out.extend_from_slice(&bytes);
                }
                Err(e) => println!("[ERROR] could not encode response: {e}"),
            }
        }
        (out, Action::None)
    }

    fn closed(&mut self, id: u64, _error: Option<&mill_serve::Error>) -> Action {
        self.streams.remove(&id);
        println!("[INFO] rpc connection {id} closed");
        Action::None
    }
}

fn main() -> mill_serve::Result<()> {
    let addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "tcp://127.0.0.1:7070".into());
    serve(
        &mut RpcServer {
            streams: HashMap::new(),
            store: HashMap::new(),
        },
        &[&addr],
    )
}
