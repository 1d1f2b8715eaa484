//! Readiness polling on top of mio (epoll on Linux, kqueue on the BSDs and
//! macOS), with the token-space conventions used by the reactor.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use mio::event::Source;
use mio::{Events as ReadyEvents, Interest, Poll, Registry, Token, Waker};

/// Token reserved for the cross-thread waker.
pub(crate) const WAKE: Token = Token(0);

const LISTENER_BASE: usize = 1;
/// Connection tokens start here; listener indexes stay below.
const CONN_BASE: usize = 4096;

pub(crate) fn listener_token(index: usize) -> Token {
    debug_assert!(index < CONN_BASE - LISTENER_BASE);
    Token(LISTENER_BASE + index)
}

pub(crate) fn conn_token(id: u64) -> Token {
    Token(CONN_BASE + id as usize)
}

pub(crate) fn as_listener_index(token: Token) -> Option<usize> {
    (token.0 >= LISTENER_BASE && token.0 < CONN_BASE).then(|| token.0 - LISTENER_BASE)
}

pub(crate) fn as_conn_id(token: Token) -> Option<u64> {
    (token.0 >= CONN_BASE).then(|| (token.0 - CONN_BASE) as u64)
}

/// Owns the OS readiness handle and its event buffer.
///
/// `wait` retries on signal interruption; every other poller failure is
/// fatal and propagates to the caller of `serve`.
pub(crate) struct Poller {
    poll: Poll,
    events: ReadyEvents,
    waker: Arc<Waker>,
}

impl Poller {
    pub fn new(capacity: usize) -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE)?);
        Ok(Poller {
            poll,
            events: ReadyEvents::with_capacity(capacity),
            waker,
        })
    }

    pub fn waker(&self) -> Arc<Waker> {
        self.waker.clone()
    }

    /// A clonable registration handle, usable from other threads (dial).
    pub fn registry(&self) -> io::Result<Registry> {
        self.poll.registry().try_clone()
    }

    /// Block up to `timeout` and return the ready tokens, in readiness
    /// order. A signal interruption yields an empty batch.
    pub fn wait(&mut self, timeout: Duration) -> io::Result<Vec<Token>> {
        if let Err(e) = self.poll.poll(&mut self.events, Some(timeout)) {
            if e.kind() == io::ErrorKind::Interrupted {
                return Ok(Vec::new());
            }
            return Err(e);
        }
        Ok(self.events.iter().map(|ev| ev.token()).collect())
    }

    pub fn register<S: Source + ?Sized>(
        &self,
        source: &mut S,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        self.poll.registry().register(source, token, interest)
    }

    pub fn reregister<S: Source + ?Sized>(
        &self,
        source: &mut S,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        self.poll.registry().reregister(source, token, interest)
    }

    pub fn deregister<S: Source + ?Sized>(&self, source: &mut S) -> io::Result<()> {
        self.poll.registry().deregister(source)
    }
}
