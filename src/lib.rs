//! Event-driven TCP/UDP/Unix-socket server framework.
//!
//! Applications implement a handful of lifecycle callbacks ([`Events`]) and
//! hand [`serve`] a list of listen addresses; the framework accepts
//! connections, multiplexes I/O across them with non-blocking sockets and a
//! readiness poller, and invokes the callbacks with already-buffered byte
//! slices. Application code never touches a socket during normal
//! processing; callbacks return bytes to send plus an [`Action`] that
//! steers per-connection and per-server state.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      User Application                       │
//! │            ┌──────────────────────────────────┐             │
//! │            │ Your Events impl                 │             │
//! │            │ (serving, opened, data, closed…) │             │
//! │            └──────────────────────────────────┘             │
//! └───────────────┬─────────────────────▲───────────────────────┘
//!                 │ serve(&mut ev, …)   │ callbacks + Server handle
//!                 ▼                     │ (wake / dial from any thread)
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Event Loop                           │
//! │  ┌───────────┐   ┌─────────────┐   ┌───────────────────┐    │
//! │  │ Poller    │──▶│ Connection  │──▶│ Write buffers &   │    │
//! │  │ (mio)     │   │ state mach. │   │ wake/dial/timeout │    │
//! │  └───────────┘   └─────────────┘   └───────────────────┘    │
//! └───────────────┬─────────────────────────────────────────────┘
//!                 │ readiness events
//!                 ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │            Operating System (epoll / kqueue)                │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! One OS thread drives the loop; callbacks always run on it, with the
//! loop's lock released. A `-net` suffix on an address scheme
//! (`tcp-net://…`) swaps the poller for a portable back-end built on
//! blocking standard-library sockets and one reader thread per connection,
//! behind the same callback contract.
//!
//! # Example
//!
//! An echo server that shuts down after its first client disconnects:
//!
//! ```rust,no_run
//! use mill_serve::{serve, Action, Error, Events};
//!
//! struct Echo;
//!
//! impl Events for Echo {
//!     fn data(&mut self, _id: u64, input: &[u8]) -> (Vec<u8>, Action) {
//!         (input.to_vec(), Action::None)
//!     }
//!
//!     fn closed(&mut self, _id: u64, _error: Option<&Error>) -> Action {
//!         Action::Shutdown
//!     }
//! }
//!
//! fn main() -> mill_serve::Result<()> {
//!     serve(&mut Echo, &["tcp://127.0.0.1:9851"])
//! }
//! ```

pub mod error;
pub mod object_pool;
pub mod translate;

mod addr;
mod conn;
mod event;
mod listener;
mod pipe;
mod poll;
mod reactor;
mod server;
mod stdnet;
mod timeout;

pub use conn::DetachedStream;
pub use error::{Error, Result};
pub use event::{Action, Addr, Events, Info, InputStream, Options};
pub use object_pool::{ObjectPool, PooledObject};
pub use server::Server;
pub use translate::{translate, Translated, Wire, WireReader, WireWriter};

/// Starts handling events for the given addresses and blocks until a
/// callback returns [`Action::Shutdown`] or a fatal poller error occurs.
///
/// Addresses use a scheme prefix: `tcp://192.168.0.10:9851`,
/// `udp://:7000?reuseport=true`, `unix:///tmp/app.sock`. Plain `tcp` is
/// assumed when no scheme is given. Valid schemes are `tcp`, `tcp4`,
/// `tcp6`, `udp`, `udp4`, `udp6` and `unix`; a `-net` (or `-stdlib`)
/// suffix on any scheme selects the standard-library back-end for the
/// whole server.
///
/// Configuration problems (an unknown scheme, an unparsable address, a
/// bind failure) are reported here before any callback runs.
pub fn serve<E: Events>(events: &mut E, addrs: &[&str]) -> Result<()> {
    let parsed = addrs
        .iter()
        .map(|a| addr::parse_addr(a))
        .collect::<Result<Vec<_>>>()?;

    if parsed.iter().any(|p| p.stdlib) {
        return stdnet::serve(events, &parsed);
    }

    let listeners = parsed
        .iter()
        .map(listener::Listener::bind)
        .collect::<Result<Vec<_>>>()?;
    reactor::serve(events, listeners)
}
