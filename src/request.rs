use crate::frame::{find_nul, is_socks4a};
use crate::protocol::{
    Command, MIN_REQUEST_LEN, REPLY_LEN, REPLY_VERSION, ResponseCode, USERID_OFFSET,
};
use crate::resolver::{Resolver, resolve_with_timeout};
use anyhow::{Result, anyhow, bail};
use std::borrow::Cow;
use std::net::Ipv4Addr;
use std::time::Duration;
use tracing::debug;

/// Request is one decoded SOCKS4/4a client request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// VN, always 0x04 once the frame scanner accepted it
    pub version: u8,
    /// CD as sent; see [`Request::command`]
    pub command: u8,
    pub port: u16,
    /// Raw DSTIP bytes
    pub addr: [u8; 4],
    /// USERID as sent, empty when the terminator sits right at offset 8
    pub user_id: Vec<u8>,
    /// HOSTNAME, only for SOCKS4a
    pub hostname: Option<String>,
}

/// Request implementation block
impl Request {
    /// decode extracts a request from a complete frame as measured by
    /// [`crate::frame::scan`]. Bytes past the frame are ignored
    pub fn decode(frame: &[u8]) -> Result<Self> {
        if frame.len() < MIN_REQUEST_LEN {
            bail!("request frame too short: {} bytes", frame.len());
        }

        let version = frame[0];
        let command = frame[1];
        let port = u16::from_be_bytes([frame[2], frame[3]]);
        let addr = [frame[4], frame[5], frame[6], frame[7]];

        let user_end = find_nul(frame, USERID_OFFSET)
            .ok_or_else(|| anyhow!("request frame has no USERID terminator"))?;
        let user_id = frame[USERID_OFFSET..user_end].to_vec();

        let hostname = if is_socks4a(frame) {
            let host_end = find_nul(frame, user_end + 1)
                .ok_or_else(|| anyhow!("SOCKS4a frame has no HOSTNAME terminator"))?;
            Some(String::from_utf8_lossy(&frame[user_end + 1..host_end]).into_owned())
        } else {
            None
        };

        Ok(Self {
            version,
            command,
            port,
            addr,
            user_id,
            hostname,
        })
    }

    /// command maps CD to a known command, `None` for anything else
    pub fn command(&self) -> Option<Command> {
        Command::from_byte(self.command)
    }

    /// user_id_lossy renders USERID for logs and session snapshots
    pub fn user_id_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.user_id)
    }

    /// is_socks4a reports whether the client sent a HOSTNAME
    pub fn is_socks4a(&self) -> bool {
        self.hostname.is_some()
    }

    /// resolve produces the IPv4 address to dial.
    ///
    /// Plain SOCKS4 uses DSTIP as is. SOCKS4a looks up HOSTNAME; an empty
    /// name, a failed or timed out lookup, or an answer that merely echoes
    /// the name back all leave the request unresolved.
    pub async fn resolve(&self, resolver: &dyn Resolver, limit: Duration) -> Option<Ipv4Addr> {
        let Some(hostname) = &self.hostname else {
            return Some(Ipv4Addr::from(self.addr));
        };

        if hostname.is_empty() {
            return None;
        }

        let ip = resolve_with_timeout(resolver, hostname, limit).await?;
        if ip.to_string() == *hostname {
            debug!("resolver echoed {hostname} back, treating as unresolved");
            return None;
        }

        Some(ip)
    }
}

/// Reply is the fixed 8 byte server answer
//  +----+----+----+----+----+----+----+----+
//  | VN | CD | DSTPORT |      DSTIP        |
//  +----+----+----+----+----+----+----+----+
//  | 1  | 1  |    2    |         4         |
//  +----+----+----+----+----+----+----+----+
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reply {
    pub code: ResponseCode,
    pub port: u16,
    pub ip: Ipv4Addr,
}

/// Reply implementation block
impl Reply {
    pub fn new(code: ResponseCode, port: u16, ip: Option<Ipv4Addr>) -> Self {
        Self {
            code,
            port,
            ip: ip.unwrap_or(Ipv4Addr::UNSPECIFIED),
        }
    }

    /// to_bytes encodes the reply in network byte order
    pub fn to_bytes(&self) -> [u8; REPLY_LEN] {
        let port = self.port.to_be_bytes();
        let ip = self.ip.octets();
        [
            REPLY_VERSION,
            self.code as u8,
            port[0],
            port[1],
            ip[0],
            ip[1],
            ip[2],
            ip[3],
        ]
    }

    /// from_bytes parses a reply, mostly useful on the client side
    pub fn from_bytes(buf: &[u8; REPLY_LEN]) -> Result<Self> {
        if buf[0] != REPLY_VERSION {
            bail!("unexpected reply version {:#04x}", buf[0]);
        }

        let code = ResponseCode::from_byte(buf[1])
            .ok_or_else(|| anyhow!("unknown reply code {:#04x}", buf[1]))?;

        Ok(Self {
            code,
            port: u16::from_be_bytes([buf[2], buf[3]]),
            ip: Ipv4Addr::new(buf[4], buf[5], buf[6], buf[7]),
        })
    }
}
