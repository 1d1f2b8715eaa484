use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::event::Addr;

/// Back-end operations reachable from any thread. Implemented by the
/// reactor's shared state and by the stdnet dispatcher's shared state.
pub(crate) trait Control: Send + Sync {
    fn wake(&self, id: u64) -> bool;
    fn dial(&self, addr: &str, timeout: Option<Duration>) -> Result<u64>;
}

/// Handle onto a running server, passed to the `serving` callback.
///
/// The handle is cheap to clone and safe to keep on other threads. It stays
/// valid after `serve` returns: [`wake`](Server::wake) then reports `false`
/// and [`dial`](Server::dial) fails with `Error::ServerClosed`.
#[derive(Clone)]
pub struct Server {
    /// Bound listener addresses, aligned with the address strings passed to
    /// [`serve`](crate::serve).
    pub addrs: Vec<Addr>,
    ctl: Arc<dyn Control>,
}

impl Server {
    pub(crate) fn new(addrs: Vec<Addr>, ctl: Arc<dyn Control>) -> Self {
        Server { addrs, ctl }
    }

    /// Schedule a `data` callback with empty input for the connection.
    ///
    /// Thread-safe. Returns `false` when no live connection matches `id`.
    /// Multiple wakes issued before the loop services the connection
    /// coalesce into a single callback.
    pub fn wake(&self, id: u64) -> bool {
        self.ctl.wake(id)
    }

    /// Open an outbound connection and add it to the event loop.
    ///
    /// Thread-safe. On success the new connection id is returned
    /// immediately and exactly one `opened` and one `closed` event will
    /// follow; socket errors surface through `closed`. A connection that
    /// does not establish within `timeout` is closed with a timeout error.
    pub fn dial(&self, addr: &str, timeout: Option<Duration>) -> Result<u64> {
        self.ctl.dial(addr, timeout)
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server").field("addrs", &self.addrs).finish()
    }
}
