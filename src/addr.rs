//! Listen/dial address grammar.
//!
//! Addresses look like `tcp://192.168.0.10:9851?reuseport=true` or
//! `unix:///tmp/app.sock`. When no `scheme://` prefix is present the `tcp`
//! scheme is assumed. A `-net` (or `-stdlib`) suffix on the scheme selects
//! the blocking standard-library back-end for the whole server.

use std::collections::HashMap;

use crate::error::{Error, Result};

/// Network kind selected by the address scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetKind {
    Tcp,
    Tcp4,
    Tcp6,
    Udp,
    Udp4,
    Udp6,
    Unix,
}

impl NetKind {
    fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme {
            "tcp" => Some(NetKind::Tcp),
            "tcp4" => Some(NetKind::Tcp4),
            "tcp6" => Some(NetKind::Tcp6),
            "udp" => Some(NetKind::Udp),
            "udp4" => Some(NetKind::Udp4),
            "udp6" => Some(NetKind::Udp6),
            "unix" => Some(NetKind::Unix),
            _ => None,
        }
    }

    pub fn is_udp(self) -> bool {
        matches!(self, NetKind::Udp | NetKind::Udp4 | NetKind::Udp6)
    }

    pub fn is_unix(self) -> bool {
        self == NetKind::Unix
    }

    pub fn wants_v4(self) -> bool {
        matches!(self, NetKind::Tcp4 | NetKind::Udp4)
    }

    pub fn wants_v6(self) -> bool {
        matches!(self, NetKind::Tcp6 | NetKind::Udp6)
    }
}

/// Query-string options attached to an address.
#[derive(Debug, Clone, Default)]
pub struct AddrOpts(HashMap<String, String>);

impl AddrOpts {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// `reuseport=yes|true|1` enables SO_REUSEPORT on the listening socket.
    pub fn reuse_port(&self) -> bool {
        matches!(self.get("reuseport"), Some("yes" | "true" | "1"))
    }
}

/// A fully parsed address string, before any socket is created.
#[derive(Debug, Clone)]
pub struct ParsedAddr {
    pub kind: NetKind,
    pub address: String,
    pub opts: AddrOpts,
    /// True when the scheme carried a `-net`/`-stdlib` suffix.
    pub stdlib: bool,
}

pub fn parse_addr(addr: &str) -> Result<ParsedAddr> {
    let (scheme, rest) = match addr.split_once("://") {
        Some((s, r)) => (s, r),
        None => ("tcp", addr),
    };

    let (scheme, stdlib) = if let Some(s) = scheme.strip_suffix("-net") {
        (s, true)
    } else if let Some(s) = scheme.strip_suffix("-stdlib") {
        (s, true)
    } else {
        (scheme, false)
    };

    let kind = NetKind::from_scheme(scheme)
        .ok_or_else(|| Error::UnsupportedScheme(scheme.to_string()))?;

    let mut opts = AddrOpts::default();
    let address = match rest.split_once('?') {
        Some((a, query)) => {
            for part in query.split('&') {
                if let Some((k, v)) = part.split_once('=') {
                    opts.0.insert(k.to_string(), v.to_string());
                }
            }
            a
        }
        None => rest,
    };

    Ok(ParsedAddr {
        kind,
        address: address.to_string(),
        opts,
        stdlib,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_scheme_is_tcp() {
        let p = parse_addr("127.0.0.1:9851").unwrap();
        assert_eq!(p.kind, NetKind::Tcp);
        assert_eq!(p.address, "127.0.0.1:9851");
        assert!(!p.stdlib);
    }

    #[test]
    fn scheme_and_options() {
        let p = parse_addr("udp6://[::1]:7000?reuseport=true&x=1").unwrap();
        assert_eq!(p.kind, NetKind::Udp6);
        assert_eq!(p.address, "[::1]:7000");
        assert!(p.opts.reuse_port());
        assert_eq!(p.opts.get("x"), Some("1"));
    }

    #[test]
    fn reuseport_spellings() {
        for spelling in ["yes", "true", "1"] {
            let p = parse_addr(&format!("tcp://:0?reuseport={spelling}")).unwrap();
            assert!(p.opts.reuse_port(), "{spelling} should enable reuseport");
        }
        let p = parse_addr("tcp://:0?reuseport=no").unwrap();
        assert!(!p.opts.reuse_port());
    }

    #[test]
    fn stdlib_suffix() {
        let p = parse_addr("tcp-net://127.0.0.1:0").unwrap();
        assert_eq!(p.kind, NetKind::Tcp);
        assert!(p.stdlib);

        let p = parse_addr("unix-stdlib:///tmp/x.sock").unwrap();
        assert_eq!(p.kind, NetKind::Unix);
        assert!(p.stdlib);
    }

    #[test]
    fn unknown_scheme_is_rejected() {
        let err = parse_addr("tulip://foo").unwrap_err();
        assert!(matches!(err, Error::UnsupportedScheme(s) if s == "tulip"));
    }

    #[test]
    fn empty_host_is_preserved() {
        let p = parse_addr("tcp://").unwrap();
        assert_eq!(p.address, "");
    }
}
