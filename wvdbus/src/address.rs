//! D-Bus server addresses.
//!
//! An address string is a `;`-separated list of entries of the form
//! `method:key=value,key=value`. Values are percent-escaped. Recognized
//! methods are `unix` (with `path` or `abstract`) and `tcp` (with `host`
//! and `port`); a `guid` key is accepted on any of them and unknown keys
//! are ignored.

use std::env;
use std::fmt;
use std::path::PathBuf;

use crate::error::{ErrorKind, Result};

pub const SESSION_BUS_ENV: &str = "DBUS_SESSION_BUS_ADDRESS";
pub const SYSTEM_BUS_ENV: &str = "DBUS_SYSTEM_BUS_ADDRESS";
pub const SYSTEM_BUS_DEFAULT: &str = "unix:path=/var/run/dbus/system_bus_socket";

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Transport {
    Unix { path: PathBuf },
    /// A Linux abstract-namespace unix socket.
    UnixAbstract { name: String },
    Tcp { host: String, port: u16 },
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Address {
    pub transport: Transport,
    pub guid: Option<String>,
}

fn invalid(s: &str) -> crate::Error {
    ErrorKind::InvalidAddress(s.into()).into()
}

/// Decode `%xx` escapes.
pub fn unescape(s: &str) -> Result<String> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = s.get(i + 1..i + 3).ok_or_else(|| invalid(s))?;
            let b = u8::from_str_radix(hex, 16).map_err(|_| invalid(s))?;
            out.push(b);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).map_err(|_| invalid(s))
}

/// Escape everything but the optionally-escaped characters of the
/// address grammar.
pub fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        if b.is_ascii_alphanumeric() || b"-_/.\\*".contains(&b) {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{:02x}", b));
        }
    }
    out
}

impl Address {
    /// Parse a single address entry.
    pub fn parse(s: &str) -> Result<Self> {
        let (method, props) = s.split_once(':').ok_or_else(|| invalid(s))?;

        let mut path = None;
        let mut abstract_name = None;
        let mut host = None;
        let mut port = None;
        let mut guid = None;

        for prop in props.split(',').filter(|p| !p.is_empty()) {
            let (key, value) = prop.split_once('=').ok_or_else(|| invalid(s))?;
            let value = unescape(value)?;
            match key {
                "path" => path = Some(value),
                "abstract" => abstract_name = Some(value),
                "host" => host = Some(value),
                "port" => port = Some(value.parse::<u16>().map_err(|_| invalid(s))?),
                "guid" => guid = Some(value),
                _ => {}
            }
        }

        let transport = match method {
            "unix" => match (path, abstract_name) {
                (Some(path), None) => Transport::Unix { path: path.into() },
                (None, Some(name)) => Transport::UnixAbstract { name },
                _ => return Err(invalid(s)),
            },
            "tcp" => Transport::Tcp {
                host: host.unwrap_or_else(|| "localhost".into()),
                port: port.ok_or_else(|| invalid(s))?,
            },
            _ => return Err(invalid(s)),
        };

        Ok(Address { transport, guid })
    }

    /// Parse a `;`-separated list of addresses.
    pub fn parse_list(s: &str) -> Result<Vec<Self>> {
        let list = s
            .split(';')
            .filter(|a| !a.is_empty())
            .map(Address::parse)
            .collect::<Result<Vec<_>>>()?;
        if list.is_empty() {
            return Err(invalid(s));
        }
        Ok(list)
    }

    /// The addresses of the session bus, from the environment.
    pub fn session() -> Result<Vec<Self>> {
        match env::var(SESSION_BUS_ENV) {
            Ok(s) if !s.is_empty() => Address::parse_list(&s),
            _ => Err(ErrorKind::InvalidAddress(format!("{} is not set", SESSION_BUS_ENV)).into()),
        }
    }

    /// The addresses of the system bus, from the environment or the
    /// well-known socket path.
    pub fn system() -> Result<Vec<Self>> {
        match env::var(SYSTEM_BUS_ENV) {
            Ok(s) if !s.is_empty() => Address::parse_list(&s),
            _ => Address::parse_list(SYSTEM_BUS_DEFAULT),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.transport {
            Transport::Unix { path } => {
                write!(f, "unix:path={}", escape(&path.to_string_lossy()))?
            }
            Transport::UnixAbstract { name } => write!(f, "unix:abstract={}", escape(name))?,
            Transport::Tcp { host, port } => write!(f, "tcp:host={},port={}", escape(host), port)?,
        }
        if let Some(guid) = &self.guid {
            write!(f, ",guid={}", escape(guid))?;
        }
        Ok(())
    }
}

impl std::str::FromStr for Address {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self> {
        Address::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_unix_path() {
        let a = Address::parse("unix:path=/tmp/dbus%2dtest,guid=abc123").unwrap();
        assert_eq!(
            a.transport,
            Transport::Unix {
                path: "/tmp/dbus-test".into()
            }
        );
        assert_eq!(a.guid.as_deref(), Some("abc123"));
        assert_eq!(a.to_string(), "unix:path=/tmp/dbus-test,guid=abc123");
    }

    #[test]
    fn parse_abstract_and_tcp() {
        let list = Address::parse_list("unix:abstract=/tmp/x;tcp:port=5555,extra=1;").unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(
            list[0].transport,
            Transport::UnixAbstract {
                name: "/tmp/x".into()
            }
        );
        assert_eq!(
            list[1].transport,
            Transport::Tcp {
                host: "localhost".into(),
                port: 5555
            }
        );
    }

    #[test]
    fn rejects_bad_addresses() {
        for bad in [
            "",
            "nocolon",
            "unix:",
            "unix:path=/a,abstract=b",
            "tcp:host=x",
            "tcp:port=notanumber",
            "unix:path=%zz",
            "unix:path",
            "carrier-pigeon:path=/x",
        ] {
            let err = Address::parse_list(bad).unwrap_err();
            assert!(
                matches!(err.kind(), ErrorKind::InvalidAddress(_)),
                "{}",
                bad
            );
        }
    }

    #[test]
    fn escaping() {
        assert_eq!(escape("a b;c"), "a%20b%3bc");
        assert_eq!(unescape("a%20b%3bc").unwrap(), "a b;c");
    }
}
