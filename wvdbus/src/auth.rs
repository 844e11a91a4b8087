//! SASL `EXTERNAL` authentication, both sides.
//!
//! The exchange is line based and CRLF terminated. The client sends one NUL
//! byte, then `AUTH EXTERNAL <hex uid>`; the server answers `OK <guid>` and
//! the client finishes with `BEGIN`. Everything after that is binary.

use std::io::{Read, Write};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::error::{ErrorKind, Result};
use crate::stream::{wait_readable, Stream};

const MAX_LINE: usize = 16 * 1024;

/// Lower-case hex encoding.
pub fn to_hex(data: &[u8]) -> String {
    data.iter().map(|b| format!("{:02x}", b)).collect()
}

pub fn from_hex(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(hex.get(i..i + 2)?, 16).ok())
        .collect()
}

/// Hex digits in a server GUID.
pub const GUID_LENGTH: usize = 32;

/// A fresh 32-digit server GUID.
pub fn generate_guid() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let pid = std::process::id();
    format!(
        "{:016x}{:08x}{:08x}",
        now.as_nanos() as u64,
        pid,
        now.as_secs() as u32
    )
}

fn failed(reason: impl Into<String>) -> crate::Error {
    ErrorKind::Authentication(reason.into()).into()
}

fn read_byte(stream: &mut dyn Stream, deadline: Instant) -> Result<u8> {
    let timeout = deadline.saturating_duration_since(Instant::now());
    if !wait_readable(stream.as_raw_fd(), Some(timeout))? {
        return Err(failed("no response from peer"));
    }
    let mut b = [0u8; 1];
    match stream.read(&mut b) {
        Ok(0) => Err(failed("connection closed during authentication")),
        Ok(_) => Ok(b[0]),
        Err(e) => Err(e.into()),
    }
}

/// Read one line, without its CRLF.
///
/// Bytes are read one at a time so nothing past the line is consumed.
fn read_line(stream: &mut dyn Stream, deadline: Instant) -> Result<String> {
    let mut line = Vec::new();
    loop {
        match read_byte(stream, deadline)? {
            b'\n' => break,
            b => line.push(b),
        }
        if line.len() > MAX_LINE {
            return Err(failed("authentication line too long"));
        }
    }
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    String::from_utf8(line).map_err(|_| failed("authentication line is not UTF-8"))
}

fn write_line(stream: &mut dyn Stream, line: &str) -> Result<()> {
    log::trace!("auth >> {}", line);
    stream.write_all(line.as_bytes())?;
    stream.write_all(b"\r\n")?;
    stream.flush()?;
    Ok(())
}

/// The identity sent with `AUTH EXTERNAL`: the uid as decimal text.
pub fn local_identity() -> String {
    // SAFETY: getuid has no failure mode.
    let uid = unsafe { libc::getuid() };
    uid.to_string()
}

/// Authenticate a freshly connected, blocking stream as a client.
///
/// Returns the server GUID.
pub fn client_handshake(stream: &mut dyn Stream, timeout: Duration) -> Result<String> {
    let deadline = Instant::now() + timeout;

    stream.write_all(&[0])?;
    write_line(
        stream,
        &format!("AUTH EXTERNAL {}", to_hex(local_identity().as_bytes())),
    )?;

    let reply = read_line(stream, deadline)?;
    log::trace!("auth << {}", reply);
    let mut words = reply.split(' ');
    if words.next() != Some("OK") {
        return Err(failed(format!("AUTH EXTERNAL was not OK: \"{}\"", reply)));
    }
    let guid = words.next().unwrap_or_default().to_owned();
    if guid.len() != GUID_LENGTH || !guid.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(failed(format!("server sent a malformed guid: \"{}\"", guid)));
    }

    write_line(stream, "BEGIN")?;
    Ok(guid)
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn peer_uid(stream: &dyn Stream) -> Option<u32> {
    let mut cred = libc::ucred {
        pid: 0,
        uid: 0,
        gid: 0,
    };
    let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;
    // SAFETY: cred and len describe a valid ucred buffer.
    let ret = unsafe {
        libc::getsockopt(
            stream.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_PEERCRED,
            &mut cred as *mut libc::ucred as *mut libc::c_void,
            &mut len,
        )
    };
    if ret == 0 {
        Some(cred.uid)
    } else {
        None
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn peer_uid(_stream: &dyn Stream) -> Option<u32> {
    None
}

/// Authenticate a freshly accepted, blocking stream as the server.
///
/// Returns the uid the client authenticated as.
pub fn server_handshake(stream: &mut dyn Stream, guid: &str, timeout: Duration) -> Result<u32> {
    let deadline = Instant::now() + timeout;

    if read_byte(stream, deadline)? != 0 {
        return Err(failed("missing credentials byte"));
    }

    let mut authorized = None;
    loop {
        let line = read_line(stream, deadline)?;
        log::trace!("auth << {}", line);
        let mut words = line.split(' ');
        match (words.next(), words.next(), words.next()) {
            (Some("AUTH"), Some("EXTERNAL"), Some(hex)) => {
                let claimed = from_hex(hex)
                    .and_then(|b| String::from_utf8(b).ok())
                    .and_then(|s| s.parse::<u32>().ok());
                let uid = match (claimed, peer_uid(stream)) {
                    (Some(c), Some(p)) if c == p => Some(c),
                    (Some(c), None) => Some(c),
                    _ => None,
                };
                match uid {
                    Some(uid) => {
                        authorized = Some(uid);
                        write_line(stream, &format!("OK {}", guid))?;
                    }
                    None => write_line(stream, "REJECTED EXTERNAL")?,
                }
            }
            (Some("AUTH"), _, _) | (Some("CANCEL"), _, _) | (Some("ERROR"), _, _) => {
                authorized = None;
                write_line(stream, "REJECTED EXTERNAL")?;
            }
            (Some("BEGIN"), None, _) => match authorized {
                Some(uid) => return Ok(uid),
                None => write_line(stream, "ERROR \"not authenticated\"")?,
            },
            _ => write_line(stream, "ERROR \"unknown command\"")?,
        }
    }
}
