use crate::{
    auth::AuthRegistry,
    frame::{Scan, scan},
    protocol::{Command, ResponseCode},
    request::{Reply, Request},
    resolver::Resolver,
    session::{ConnectionId, SessionStore},
};
use anyhow::Result;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Size of a single read while negotiating
const READ_CHUNK: usize = 512;

/// Outcome is how a handshake ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// GRANTED was flushed to the client. `pending` holds client bytes
    /// that arrived behind the request and belong to the target
    Granted {
        target: SocketAddrV4,
        pending: Vec<u8>,
    },
    /// A rejection was flushed to the client, which should now be closed
    Rejected(ResponseCode),
    /// Nothing was sent: framing error, or the client left early
    Dropped,
}

/// decide picks the reply for a decoded request.
///
/// `ip` is the resolved destination (None when a SOCKS4a name did not
/// resolve) and `authorized` the verdict of the auth registry.
pub fn decide(request: &Request, ip: Option<Ipv4Addr>, authorized: bool) -> Reply {
    if !authorized {
        let code = if request.user_id.is_empty() {
            ResponseCode::IdentdFailed
        } else {
            ResponseCode::Rejected
        };
        return Reply::new(code, request.port, ip);
    }

    if request.is_socks4a() && ip.is_none() {
        return Reply::new(ResponseCode::Rejected, request.port, None);
    }

    match request.command() {
        Some(Command::Connect) => Reply::new(ResponseCode::Granted, request.port, ip),
        Some(Command::Bind) | None => Reply::new(ResponseCode::Rejected, request.port, ip),
    }
}

/// Handshake drives one client connection from INITIAL to either
/// ESTABLISHED or a terminal rejection
pub struct Handshake<'a> {
    pub id: ConnectionId,
    pub auth: &'a AuthRegistry,
    pub sessions: &'a SessionStore,
    pub resolver: &'a dyn Resolver,
    /// Deadline for the client to deliver a complete request. Resolving
    /// and answering happen outside of it
    pub read_timeout: Option<Duration>,
    pub resolve_timeout: Duration,
}

/// Handshake implementation block
impl Handshake<'_> {
    /// run reads until one complete request is buffered, answers it, and
    /// on success marks the session ESTABLISHED.
    ///
    /// Only transport failures are returned as errors.
    pub async fn run<S>(&self, stream: &mut S) -> Result<Outcome>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let id = self.id;
        let mut buf = Vec::with_capacity(READ_CHUNK);

        let read = self.read_frame(stream, &mut buf);
        let frame_len = match self.read_timeout {
            Some(limit) => match timeout(limit, read).await {
                Ok(read) => read?,
                Err(_) => {
                    warn!("session {id}: no complete request within {limit:?}, closing");
                    return Ok(Outcome::Dropped);
                }
            },
            None => read.await?,
        };
        let Some(frame_len) = frame_len else {
            return Ok(Outcome::Dropped);
        };

        let request = Request::decode(&buf[..frame_len])?;
        let pending = buf.split_off(frame_len);

        debug!(
            "session {id}: request cmd={:#04x} port={} addr={:?} user={:?} host={:?}",
            request.command,
            request.port,
            request.addr,
            request.user_id_lossy(),
            request.hostname
        );

        let ip = request.resolve(self.resolver, self.resolve_timeout).await;
        if let (Some(host), None) = (&request.hostname, ip) {
            info!("session {id}: could not resolve {host}");
        }
        self.sessions.record_request(id, &request, ip).await;

        let authorized = self.auth.is_valid_raw(&request.user_id).await;
        let reply = decide(&request, ip, authorized);

        // The reply must be on the wire before anything else happens
        stream.write_all(&reply.to_bytes()).await?;
        stream.flush().await?;

        info!(
            "session {id}: {} (user {:?}, target {}:{})",
            reply.code,
            request.user_id_lossy(),
            reply.ip,
            reply.port
        );

        match reply.code {
            ResponseCode::Granted => {
                self.sessions.establish(id).await;
                Ok(Outcome::Granted {
                    target: SocketAddrV4::new(reply.ip, reply.port),
                    pending,
                })
            }
            code @ (ResponseCode::Rejected | ResponseCode::IdentdFailed) => {
                Ok(Outcome::Rejected(code))
            }
        }
    }

    /// read_frame buffers client bytes until `buf` starts with a complete
    /// request and returns its length. None means the client must be
    /// dropped without a reply
    async fn read_frame<S>(&self, stream: &mut S, buf: &mut Vec<u8>) -> Result<Option<usize>>
    where
        S: AsyncRead + Unpin,
    {
        let id = self.id;
        let mut chunk = [0u8; READ_CHUNK];

        loop {
            match scan(buf) {
                Scan::Complete(len) => return Ok(Some(len)),
                Scan::Malformed(reason) => {
                    warn!("session {id}: dropping client, {reason}");
                    return Ok(None);
                }
                Scan::NeedMore => {}
            }

            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                debug!("session {id}: client closed after {} bytes", buf.len());
                return Ok(None);
            }
            buf.extend_from_slice(&chunk[..n]);
        }
    }
}
