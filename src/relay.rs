use crate::session::{ConnectionId, RelayBinding, SessionStore};
use anyhow::Result;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    select,
};
use tracing::{debug, info};

/// Direction of a pipe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// client -> target
    Forward,
    /// target -> client
    Backward,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Forward => f.write_str("client -> target"),
            Direction::Backward => f.write_str("target -> client"),
        }
    }
}

/// Transferred is what a relay moved before it was torn down
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Transferred {
    pub from_client: u64,
    pub from_target: u64,
}

/// Relay holds both ends of an established session
pub struct Relay {
    pub id: ConnectionId,
    pub client: TcpStream,
    pub target: TcpStream,
    /// Client bytes that arrived behind the request
    pub pending: Vec<u8>,
}

/// Relay implementation block
impl Relay {
    /// run forwards bytes both ways until either side closes or fails,
    /// then closes the session, which stops the other pipe and drops
    /// both sockets
    pub async fn run(self, sessions: &SessionStore) -> Result<Transferred> {
        let Relay {
            id,
            client,
            mut target,
            pending,
        } = self;

        let target_addr = target.peer_addr()?;

        // Whatever the client sent after the request goes out first
        if !pending.is_empty() {
            target.write_all(&pending).await?;
            debug!("session {id}: flushed {} early bytes to {target_addr}", pending.len());
        }

        let from_client = Arc::new(AtomicU64::new(pending.len() as u64));
        let from_target = Arc::new(AtomicU64::new(0));

        let (client_read, client_write) = client.into_split();
        let (target_read, target_write) = target.into_split();

        let mut forward = tokio::spawn(pipe(
            id,
            Direction::Forward,
            client_read,
            target_write,
            Arc::clone(&from_client),
        ));
        let mut backward = tokio::spawn(pipe(
            id,
            Direction::Backward,
            target_read,
            client_write,
            Arc::clone(&from_target),
        ));

        let binding =
            RelayBinding::new(target_addr, forward.abort_handle(), backward.abort_handle());
        if sessions.bind_relay(id, binding).await {
            // First pipe to stop ends the whole relay
            select! {
                _ = &mut forward => {}
                _ = &mut backward => {}
            }
        }

        sessions.close(id).await;

        let transferred = Transferred {
            from_client: from_client.load(Ordering::Relaxed),
            from_target: from_target.load(Ordering::Relaxed),
        };

        info!(
            "session {id}: relay to {target_addr} closed: {} bytes from client, {} from target",
            transferred.from_client, transferred.from_target
        );

        Ok(transferred)
    }
}

/// Counted is a writer that adds every byte its sink accepted to a
/// shared counter, so totals survive an aborted pipe
struct Counted<W> {
    inner: W,
    written: Arc<AtomicU64>,
}

impl<W: AsyncWrite + Unpin> AsyncWrite for Counted<W> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let result = Pin::new(&mut self.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &result {
            self.written.fetch_add(*n as u64, Ordering::Relaxed);
        }
        result
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// pipe copies `reader` into `writer` unchanged until EOF or an error.
/// Writes wait for the sink, so a slow peer slows the source down
async fn pipe<R, W>(
    id: ConnectionId,
    direction: Direction,
    mut reader: R,
    writer: W,
    counter: Arc<AtomicU64>,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut writer = Counted {
        inner: writer,
        written: counter,
    };

    match tokio::io::copy(&mut reader, &mut writer).await {
        Ok(n) => debug!("session {id}: {direction} reached EOF after {n} bytes"),
        Err(e) => debug!("session {id}: {direction} failed: {e}"),
    }

    if let Err(e) = writer.shutdown().await {
        debug!("session {id}: {direction} shutdown failed: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    /// Returns both ends of a loopback TCP connection
    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (connected, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (connected.unwrap(), accepted.unwrap().0)
    }

    /// Order sensitive checksum, so lost, repeated or swapped bytes show up
    fn checksum(data: &[u8], seed: u64) -> u64 {
        data.iter()
            .fold(seed, |sum, b| sum.wrapping_mul(31).wrapping_add(u64::from(*b)))
    }

    async fn established(sessions: &SessionStore, client: &TcpStream) -> ConnectionId {
        let id = sessions.open(client.peer_addr().unwrap()).await;
        sessions.establish(id).await;
        id
    }

    #[tokio::test]
    async fn forwards_both_ways_and_tears_down() {
        let sessions = SessionStore::new();
        let (mut user, client) = socket_pair().await;
        let (target, mut origin) = socket_pair().await;
        let id = established(&sessions, &client).await;

        let relay = Relay {
            id,
            client,
            target,
            pending: b"early ".to_vec(),
        };
        let sessions_clone = sessions.clone();
        let handle = tokio::spawn(async move { relay.run(&sessions_clone).await });

        // Looks like a SOCKS4 request but must pass through untouched
        user.write_all(b"\x04\x01\x00\x50payload").await.unwrap();
        let mut got = vec![0u8; 17];
        origin.read_exact(&mut got).await.unwrap();
        assert_eq!(got, b"early \x04\x01\x00\x50payload");

        origin.write_all(b"response").await.unwrap();
        let mut got = vec![0u8; 8];
        user.read_exact(&mut got).await.unwrap();
        assert_eq!(got, b"response");

        drop(user);

        let transferred = timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(transferred.from_client, 17);
        assert_eq!(transferred.from_target, 8);
        assert!(sessions.is_empty().await);

        // The target side gets closed as well
        let mut rest = Vec::new();
        let n = timeout(Duration::from_secs(5), origin.read_to_end(&mut rest))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn target_close_ends_relay() {
        let sessions = SessionStore::new();
        let (mut user, client) = socket_pair().await;
        let (target, origin) = socket_pair().await;
        let id = established(&sessions, &client).await;

        let relay = Relay {
            id,
            client,
            target,
            pending: Vec::new(),
        };
        let sessions_clone = sessions.clone();
        let handle = tokio::spawn(async move { relay.run(&sessions_clone).await });

        drop(origin);

        timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(sessions.get(id).await.is_none());

        let mut rest = Vec::new();
        let n = timeout(Duration::from_secs(5), user.read_to_end(&mut rest))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn closed_session_never_relays() {
        let sessions = SessionStore::new();
        let (_user, client) = socket_pair().await;
        let (target, mut origin) = socket_pair().await;

        // Session closed before the relay could bind
        let id = established(&sessions, &client).await;
        sessions.close(id).await;

        let relay = Relay {
            id,
            client,
            target,
            pending: Vec::new(),
        };
        let transferred = timeout(Duration::from_secs(5), relay.run(&sessions))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(transferred, Transferred::default());

        let mut rest = Vec::new();
        let n = timeout(Duration::from_secs(5), origin.read_to_end(&mut rest))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn slow_target_receives_every_byte() {
        const TOTAL: usize = 4 * 1024 * 1024;

        let sessions = SessionStore::new();
        let (mut user, client) = socket_pair().await;
        let (target, mut origin) = socket_pair().await;
        let id = established(&sessions, &client).await;

        let relay = Relay {
            id,
            client,
            target,
            pending: Vec::new(),
        };
        let sessions_clone = sessions.clone();
        let handle = tokio::spawn(async move { relay.run(&sessions_clone).await });

        // Takes 4 KiB at a time and pauses after every read
        let sink = tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            let (mut total, mut sum) = (0usize, 0u64);
            loop {
                let n = origin.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                total += n;
                sum = checksum(&buf[..n], sum);
                tokio::time::sleep(Duration::from_micros(200)).await;
            }
            (total, sum)
        });

        let payload: Vec<u8> = (0..TOTAL).map(|i| (i % 251) as u8).collect();
        timeout(Duration::from_secs(60), user.write_all(&payload))
            .await
            .unwrap()
            .unwrap();
        user.shutdown().await.unwrap();

        let (total, sum) = timeout(Duration::from_secs(60), sink)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(total, TOTAL);
        assert_eq!(sum, checksum(&payload, 0));

        let transferred = timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(transferred.from_client, TOTAL as u64);
        assert!(sessions.is_empty().await);
    }
}
