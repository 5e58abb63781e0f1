use crate::protocol::{
    MAX_HOSTNAME_SCAN, MAX_USERID_SCAN, MIN_REQUEST_LEN, NUL, USERID_OFFSET, Version,
};
use std::fmt;

/// Scan is the result of looking for one complete request in the bytes
/// received so far
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scan {
    /// Not enough bytes yet
    NeedMore,
    /// The stream can never become a valid request, close without replying
    Malformed(Malformed),
    /// The first `n` bytes form one request
    Complete(usize),
}

/// Malformed names the framing rule a buffer broke
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Malformed {
    /// VN was not 0x04
    Version(u8),
    /// USERID ran past the scan limit without a terminator
    UserIdTooLong,
    /// HOSTNAME ran past the scan limit without a terminator
    HostnameTooLong,
}

impl fmt::Display for Malformed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Malformed::Version(v) => write!(f, "unsupported version {v:#04x}"),
            Malformed::UserIdTooLong => {
                write!(f, "no USERID terminator within {MAX_USERID_SCAN} bytes")
            }
            Malformed::HostnameTooLong => {
                write!(f, "no HOSTNAME terminator within {MAX_HOSTNAME_SCAN} bytes")
            }
        }
    }
}

/// is_socks4a reports whether DSTIP carries the 0.0.0.x (x != 0) marker.
/// `buf` must be at least 8 bytes long
pub fn is_socks4a(buf: &[u8]) -> bool {
    buf[4] == 0 && buf[5] == 0 && buf[6] == 0 && buf[7] != 0
}

/// scan decides whether `buf` starts with a complete SOCKS4/4a request.
///
/// It keeps no state between calls: feed it the whole handshake buffer
/// every time more bytes arrive.
pub fn scan(buf: &[u8]) -> Scan {
    if buf.len() < MIN_REQUEST_LEN {
        return Scan::NeedMore;
    }

    if buf[0] != Version::SOCKS4 as u8 {
        return Scan::Malformed(Malformed::Version(buf[0]));
    }

    // USERID terminator
    let Some(user_end) = find_nul(buf, USERID_OFFSET) else {
        return if buf.len() > MAX_USERID_SCAN {
            Scan::Malformed(Malformed::UserIdTooLong)
        } else {
            Scan::NeedMore
        };
    };

    if !is_socks4a(buf) {
        return Scan::Complete(user_end + 1);
    }

    // HOSTNAME terminator
    match find_nul(buf, user_end + 1) {
        Some(host_end) => Scan::Complete(host_end + 1),
        None if buf.len() > MAX_HOSTNAME_SCAN => Scan::Malformed(Malformed::HostnameTooLong),
        None => Scan::NeedMore,
    }
}

/// find_nul returns the position of the first NUL at or after `from`
pub(crate) fn find_nul(buf: &[u8], from: usize) -> Option<usize> {
    buf.get(from..)?
        .iter()
        .position(|&b| b == NUL)
        .map(|pos| from + pos)
}
