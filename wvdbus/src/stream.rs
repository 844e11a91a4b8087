//! Byte-stream transports and readiness waits.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::time::{Duration, Instant};

use crate::address::{Address, Transport};
use crate::error::{Error, ErrorKind, Result};

pub trait Stream: Read + Write + Send + Sync + AsRawFd {
    fn shutdown(&mut self) -> Result<()>;
    fn try_clone(&mut self) -> io::Result<Box<dyn Stream>>;
    fn set_nonblocking(&mut self, b: bool) -> Result<()>;
}

impl Stream for TcpStream {
    #[inline]
    fn shutdown(&mut self) -> Result<()> {
        TcpStream::shutdown(self, Shutdown::Both)?;
        Ok(())
    }

    #[inline]
    fn try_clone(&mut self) -> io::Result<Box<dyn Stream>> {
        Ok(Box::new(TcpStream::try_clone(self)?))
    }

    #[inline]
    fn set_nonblocking(&mut self, b: bool) -> Result<()> {
        TcpStream::set_nonblocking(self, b)?;
        Ok(())
    }
}

impl Stream for UnixStream {
    #[inline]
    fn shutdown(&mut self) -> Result<()> {
        UnixStream::shutdown(self, Shutdown::Both)?;
        Ok(())
    }

    #[inline]
    fn try_clone(&mut self) -> io::Result<Box<dyn Stream>> {
        Ok(Box::new(UnixStream::try_clone(self)?))
    }

    #[inline]
    fn set_nonblocking(&mut self, b: bool) -> Result<()> {
        UnixStream::set_nonblocking(self, b)?;
        Ok(())
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn connect_abstract(name: &str) -> Result<UnixStream> {
    use std::os::linux::net::SocketAddrExt;
    use std::os::unix::net::SocketAddr;

    let addr = SocketAddr::from_abstract_name(name)?;
    Ok(UnixStream::connect_addr(&addr)?)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn connect_abstract(name: &str) -> Result<UnixStream> {
    Err(ErrorKind::InvalidAddress(format!("unix:abstract={}", name)).into())
}

/// Open a blocking stream to `address`.
pub fn connect(address: &Address) -> Result<Box<dyn Stream>> {
    match &address.transport {
        Transport::Unix { path } => Ok(Box::new(UnixStream::connect(path)?)),
        Transport::UnixAbstract { name } => Ok(Box::new(connect_abstract(name)?)),
        Transport::Tcp { host, port } => {
            let s = TcpStream::connect((host.as_str(), *port))?;
            s.set_nodelay(true)?;
            Ok(Box::new(s))
        }
    }
}

/// Try each address in order; return the first stream that connects.
pub fn connect_any(addresses: &[Address]) -> Result<Box<dyn Stream>> {
    let mut last = None;
    for address in addresses {
        match connect(address) {
            Ok(s) => return Ok(s),
            Err(e) => {
                log::debug!("connecting to {} failed: {}", address, e);
                last = Some(e);
            }
        }
    }
    Err(last.unwrap_or_else(|| Error::new(ErrorKind::InvalidAddress(String::new()))))
}

fn wait(fd: RawFd, events: libc::c_short, timeout: Option<Duration>) -> Result<bool> {
    let deadline = timeout.map(|t| Instant::now() + t);
    loop {
        let ms: libc::c_int = match deadline {
            None => -1,
            Some(d) => {
                let left = d.saturating_duration_since(Instant::now());
                // Round up so a sub-millisecond wait does not spin.
                ((left.as_nanos() + 999_999) / 1_000_000).min(libc::c_int::MAX as u128)
                    as libc::c_int
            }
        };
        let mut pfd = libc::pollfd {
            fd,
            events,
            revents: 0,
        };
        // SAFETY: pfd is a valid pollfd and nfds is 1.
        let ret = unsafe { libc::poll(&mut pfd, 1, ms) };
        if ret < 0 {
            let e = io::Error::last_os_error();
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(e.into());
        }
        // Hangup and error count as ready; the next read or write reports them.
        return Ok(ret > 0);
    }
}

/// Wait until `fd` is readable; `false` when the timeout passed first.
pub fn wait_readable(fd: RawFd, timeout: Option<Duration>) -> Result<bool> {
    wait(fd, libc::POLLIN, timeout)
}

/// Wait until `fd` is writable; `false` when the timeout passed first.
pub fn wait_writable(fd: RawFd, timeout: Option<Duration>) -> Result<bool> {
    wait(fd, libc::POLLOUT, timeout)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readiness_waits() {
        let (mut a, b) = UnixStream::pair().unwrap();
        assert!(!wait_readable(b.as_raw_fd(), Some(Duration::from_millis(10))).unwrap());
        assert!(wait_writable(a.as_raw_fd(), Some(Duration::from_millis(10))).unwrap());
        a.write_all(b"x").unwrap();
        assert!(wait_readable(b.as_raw_fd(), None).unwrap());
    }

    #[test]
    fn connects_to_unix_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sock");
        let listener = std::os::unix::net::UnixListener::bind(&path).unwrap();
        let address = Address::parse(&format!("unix:path={}", path.display())).unwrap();
        let missing = Address::parse("unix:path=/nonexistent/wvdbus-test").unwrap();

        let mut s = connect_any(&[missing, address]).unwrap();
        let (mut peer, _) = listener.accept().unwrap();
        s.write_all(b"hi").unwrap();
        let mut buf = [0u8; 2];
        peer.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hi");
    }

    #[test]
    fn connect_failure_is_reported() {
        let missing = Address::parse("unix:path=/nonexistent/wvdbus-test").unwrap();
        assert!(connect_any(&[missing]).is_err());
        assert!(connect_any(&[]).is_err());
    }
}
