use std::fmt;

// SOCKS4 request
// +----+----+----+----+----+----+----+----+----+----+....+----+
// | VN | CD | DSTPORT |      DSTIP        | USERID       |NULL|
// +----+----+----+----+----+----+----+----+----+----+....+----+
// | 1  | 1  |    2    |         4         | variable     | 1  |
// +----+----+----+----+----+----+----+----+----+----+....+----+
//
// SOCKS4a appends HOSTNAME + NULL after the USERID terminator and sets
// DSTIP to 0.0.0.x with x != 0

/// Smallest possible request: VN, CD, DSTPORT, DSTIP and the USERID terminator
pub const MIN_REQUEST_LEN: usize = 9;

/// Offset of the USERID field
pub const USERID_OFFSET: usize = 8;

/// Buffered bytes allowed while the USERID terminator is still missing
pub const MAX_USERID_SCAN: usize = 256;

/// Buffered bytes allowed while the HOSTNAME terminator is still missing
pub const MAX_HOSTNAME_SCAN: usize = 1024;

/// Length of every server reply
pub const REPLY_LEN: usize = 8;

/// VN of a server reply is always zero
pub const REPLY_VERSION: u8 = 0x00;

/// NUL terminates USERID and HOSTNAME
pub const NUL: u8 = 0x00;

/// Version represents the SOCKS protocol version this server speaks
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    SOCKS4 = 0x04,
}

/// Command represents SOCKS4 protocol commands
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect = 0x01,
    Bind = 0x02,
}

/// Command implementation block
impl Command {
    /// from_byte converts a byte to its related SOCKS4 protocol command
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Command::Connect),
            0x02 => Some(Command::Bind),
            _ => None,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Connect => f.write_str("connect"),
            Command::Bind => f.write_str("bind"),
        }
    }
}

/// ResponseCode represents the CD field of a server reply
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseCode {
    Granted = 0x5A,
    Rejected = 0x5B,
    IdentdFailed = 0x5C,
    // 0x5D: identd user-id mismatch, never produced here
}

/// ResponseCode implementation block
impl ResponseCode {
    /// from_byte converts a reply byte to its response code
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x5A => Some(ResponseCode::Granted),
            0x5B => Some(ResponseCode::Rejected),
            0x5C => Some(ResponseCode::IdentdFailed),
            _ => None,
        }
    }
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseCode::Granted => f.write_str("request granted"),
            ResponseCode::Rejected => f.write_str("request rejected"),
            ResponseCode::IdentdFailed => f.write_str("identd authentication failed"),
        }
    }
}

/// ConnectionStatus tracks where a client connection is in its lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionStatus {
    /// Handshake not yet completed
    #[default]
    Initial,
    /// GRANTED was sent, every further byte is payload
    Established,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::Initial => f.write_str("initial"),
            ConnectionStatus::Established => f.write_str("established"),
        }
    }
}
