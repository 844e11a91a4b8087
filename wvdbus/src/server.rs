//! Listening sockets for peer-to-peer D-Bus servers.

use std::env;
use std::fs;
use std::net::TcpListener;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::net::UnixListener;
use std::path::PathBuf;
use std::process;
use std::time::Duration;

use crate::address::{Address, Transport};
use crate::connection::{Connection, ConnectionConfig};
use crate::error::{ErrorKind, Result};
use crate::stream::{wait_readable, Stream};

#[derive(Debug)]
pub enum Listener {
    Tcp(TcpListener),
    Unix {
        listener: UnixListener,
        /// Filesystem socket to remove on drop; `None` for abstract or
        /// inherited sockets.
        path: Option<PathBuf>,
    },
}

/// The socket passed in by systemd socket activation, if any.
///
/// With more than one passed socket, the one named `dbus` in
/// `LISTEN_FDNAMES` is used.
fn activation_listener() -> Option<RawFd> {
    let nfds = match env::var("LISTEN_FDS").ok()?.parse::<usize>() {
        Ok(n) if n >= 1 => n,
        _ => return None,
    };

    match env::var("LISTEN_PID") {
        Ok(ref pid) if pid.parse::<u32>() == Ok(process::id()) => {}
        _ => return None,
    }

    if nfds == 1 {
        return Some(3);
    }

    let fdnames = env::var("LISTEN_FDNAMES").ok()?;
    fdnames
        .split(':')
        .position(|v| v == "dbus")
        .map(|i| 3 + i as RawFd)
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn bind_abstract(name: &str) -> Result<UnixListener> {
    use std::os::linux::net::SocketAddrExt;
    use std::os::unix::net::SocketAddr;

    let addr = SocketAddr::from_abstract_name(name)?;
    Ok(UnixListener::bind_addr(&addr)?)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn bind_abstract(name: &str) -> Result<UnixListener> {
    Err(ErrorKind::InvalidAddress(format!("unix:abstract={}", name)).into())
}

impl Listener {
    /// Listen on the first entry of an address string.
    ///
    /// Under systemd socket activation the inherited socket is used instead,
    /// with `address` only selecting its kind.
    pub fn new<S: ?Sized + AsRef<str>>(address: &S) -> Result<Self> {
        let address = address.as_ref();
        let entries = Address::parse_list(address)?;
        let first = entries
            .first()
            .ok_or_else(|| ErrorKind::InvalidAddress(address.into()))?;

        if let Some(fd) = activation_listener() {
            log::debug!("using activation socket {}", fd);
            // SAFETY: systemd hands this process ownership of the fd.
            return Ok(match first.transport {
                Transport::Tcp { .. } => Listener::Tcp(unsafe { TcpListener::from_raw_fd(fd) }),
                _ => Listener::Unix {
                    listener: unsafe { UnixListener::from_raw_fd(fd) },
                    path: None,
                },
            });
        }

        Listener::bind(first)
    }

    pub fn bind(address: &Address) -> Result<Self> {
        match &address.transport {
            Transport::Tcp { host, port } => {
                Ok(Listener::Tcp(TcpListener::bind((host.as_str(), *port))?))
            }
            Transport::UnixAbstract { name } => Ok(Listener::Unix {
                listener: bind_abstract(name)?,
                path: None,
            }),
            Transport::Unix { path } => {
                // ignore error on non-existent file
                let _ = fs::remove_file(path);
                Ok(Listener::Unix {
                    listener: UnixListener::bind(path)?,
                    path: Some(path.clone()),
                })
            }
        }
    }

    /// An address clients can connect to, with a TCP port of 0 resolved to
    /// the bound port.
    pub fn address(&self) -> Result<Address> {
        let transport = match self {
            Listener::Tcp(l) => {
                let local = l.local_addr()?;
                Transport::Tcp {
                    host: local.ip().to_string(),
                    port: local.port(),
                }
            }
            Listener::Unix { listener, path } => match path {
                Some(path) => Transport::Unix { path: path.clone() },
                None => abstract_transport(listener)?,
            },
        };
        Ok(Address {
            transport,
            guid: None,
        })
    }

    pub fn set_nonblocking(&self, b: bool) -> Result<()> {
        match self {
            Listener::Tcp(l) => l.set_nonblocking(b)?,
            Listener::Unix { listener, .. } => listener.set_nonblocking(b)?,
        }
        Ok(())
    }

    /// Accept one stream, waiting at most `timeout` (`None` waits forever).
    pub fn accept(&self, timeout: Option<Duration>) -> Result<Box<dyn Stream>> {
        if timeout.is_some() && !wait_readable(self.as_raw_fd(), timeout)? {
            return Err(ErrorKind::Timeout.into());
        }
        match self {
            Listener::Tcp(l) => {
                let (s, _addr) = l.accept()?;
                s.set_nodelay(true)?;
                Ok(Box::new(s))
            }
            Listener::Unix { listener, .. } => {
                let (s, _addr) = listener.accept()?;
                Ok(Box::new(s))
            }
        }
    }

    /// Accept one client and run the server side of the handshake.
    pub fn accept_connection(
        &self,
        guid: &str,
        timeout: Option<Duration>,
        config: ConnectionConfig,
    ) -> Result<Connection> {
        let stream = self.accept(timeout)?;
        Connection::new_server(stream, guid, config)
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn abstract_transport(listener: &UnixListener) -> Result<Transport> {
    use std::os::linux::net::SocketAddrExt;

    let local = listener.local_addr()?;
    match local.as_abstract_name() {
        Some(name) => Ok(Transport::UnixAbstract {
            name: String::from_utf8_lossy(name).into_owned(),
        }),
        None => Err(ErrorKind::InvalidAddress(format!("{:?}", local)).into()),
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn abstract_transport(listener: &UnixListener) -> Result<Transport> {
    let local = listener.local_addr()?;
    Err(ErrorKind::InvalidAddress(format!("{:?}", local)).into())
}

impl AsRawFd for Listener {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            Listener::Tcp(l) => l.as_raw_fd(),
            Listener::Unix { listener, .. } => listener.as_raw_fd(),
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Listener::Unix {
            path: Some(path), ..
        } = self
        {
            let _ = fs::remove_file(path);
        }
    }
}
