use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the framework.
///
/// Configuration errors (bad scheme, unbindable address) are reported by
/// [`serve`](crate::serve) before the loop starts. I/O errors on a single
/// connection are captured into that connection's last-error slot and
/// surfaced through the `closed` callback; they never abort the loop.
#[derive(Debug, Error)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("unsupported scheme: {0:?}")]
    UnsupportedScheme(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("dial timed out")]
    DialTimedOut,

    #[error("server has shut down")]
    ServerClosed,

    #[error("{0}")]
    Unsupported(&'static str),
}

impl Error {
    /// True when the error wraps an `io::Error` of the given kind.
    pub fn is_io_kind(&self, kind: io::ErrorKind) -> bool {
        matches!(self, Error::Io(e) if e.kind() == kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_kind_probe() {
        let err = Error::from(io::Error::new(io::ErrorKind::ConnectionRefused, "nope"));
        assert!(err.is_io_kind(io::ErrorKind::ConnectionRefused));
        assert!(!err.is_io_kind(io::ErrorKind::TimedOut));
        assert!(!Error::DialTimedOut.is_io_kind(io::ErrorKind::TimedOut));
    }
}
