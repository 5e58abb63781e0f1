use crate::protocol::ConnectionStatus;
use crate::request::Request;
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::{sync::RwLock, task::AbortHandle};
use tracing::debug;

/// ConnectionId identifies one accepted client connection
pub type ConnectionId = u64;

/// ConnectionSession is what the server knows about one client connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSession {
    pub peer: SocketAddr,
    pub status: ConnectionStatus,
    /// VN of the request, 0 until one was decoded
    pub socks_version: u8,
    /// CD of the request, 0 until one was decoded
    pub command: u8,
    pub target_ip: Option<Ipv4Addr>,
    pub target_port: u16,
    /// SOCKS4a only
    pub target_hostname: Option<String>,
    pub user_id: String,
    /// Address of the outbound connection once the relay is wired
    pub relay_target: Option<SocketAddr>,
}

/// ConnectionSession implementation block
impl ConnectionSession {
    fn new(peer: SocketAddr) -> Self {
        Self {
            peer,
            status: ConnectionStatus::Initial,
            socks_version: 0,
            command: 0,
            target_ip: None,
            target_port: 0,
            target_hostname: None,
            user_id: String::new(),
            relay_target: None,
        }
    }
}

/// RelayBinding keeps the outbound connection and both pipe tasks of an
/// established session together, so they are bound and released as a unit
#[derive(Debug)]
pub struct RelayBinding {
    target: SocketAddr,
    forward: AbortHandle,
    backward: AbortHandle,
}

/// RelayBinding implementation block
impl RelayBinding {
    /// new ties the client->target and target->client pipe tasks to the
    /// outbound connection to `target`. Both tasks own their halves of
    /// the two streams, so aborting them closes the sockets
    pub fn new(target: SocketAddr, forward: AbortHandle, backward: AbortHandle) -> Self {
        Self {
            target,
            forward,
            backward,
        }
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }

    /// release stops both pipes; safe on pipes that already finished
    fn release(&self) {
        self.forward.abort();
        self.backward.abort();
    }
}

#[derive(Debug)]
struct Entry {
    session: ConnectionSession,
    relay: Option<RelayBinding>,
}

/// SessionStore tracks every live client connection by id.
///
/// Entries are added when a connection is accepted and removed by an
/// explicit [`SessionStore::close`] when it goes away. Cloning the store
/// shares the same table.
#[derive(Debug, Clone)]
pub struct SessionStore {
    next_id: Arc<AtomicU64>,
    entries: Arc<RwLock<HashMap<ConnectionId, Entry>>>,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

/// SessionStore implementation block
impl SessionStore {
    pub fn new() -> Self {
        Self {
            next_id: Arc::new(AtomicU64::new(1)),
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// open registers a freshly accepted connection in the INITIAL state
    pub async fn open(&self, peer: SocketAddr) -> ConnectionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let entry = Entry {
            session: ConnectionSession::new(peer),
            relay: None,
        };

        self.entries.write().await.insert(id, entry);
        debug!("session {id} opened for {peer}");
        id
    }

    /// record_request stores what the client asked for
    pub async fn record_request(&self, id: ConnectionId, request: &Request, ip: Option<Ipv4Addr>) {
        if let Some(entry) = self.entries.write().await.get_mut(&id) {
            let session = &mut entry.session;
            session.socks_version = request.version;
            session.command = request.command;
            session.target_ip = ip;
            session.target_port = request.port;
            session.target_hostname = request.hostname.clone();
            session.user_id = request.user_id_lossy().into_owned();
        }
    }

    /// establish moves a session to ESTABLISHED. Call only after the
    /// GRANTED reply went out. Returns false for unknown ids
    pub async fn establish(&self, id: ConnectionId) -> bool {
        match self.entries.write().await.get_mut(&id) {
            Some(entry) => {
                entry.session.status = ConnectionStatus::Established;
                true
            }
            None => false,
        }
    }

    /// bind_relay attaches the relay of an established session.
    ///
    /// If the session is gone or never got established the binding is
    /// released immediately and false is returned.
    pub async fn bind_relay(&self, id: ConnectionId, binding: RelayBinding) -> bool {
        let mut entries = self.entries.write().await;

        match entries.get_mut(&id) {
            Some(entry)
                if entry.session.status == ConnectionStatus::Established
                    && entry.relay.is_none() =>
            {
                entry.session.relay_target = Some(binding.target());
                entry.relay = Some(binding);
                true
            }
            _ => {
                binding.release();
                false
            }
        }
    }

    pub async fn status(&self, id: ConnectionId) -> Option<ConnectionStatus> {
        self.entries.read().await.get(&id).map(|e| e.session.status)
    }

    /// get returns a snapshot of a session
    pub async fn get(&self, id: ConnectionId) -> Option<ConnectionSession> {
        self.entries.read().await.get(&id).map(|e| e.session.clone())
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// close forgets a session and stops its relay, if any. Closing an
    /// unknown or already closed id is a no-op that returns false
    pub async fn close(&self, id: ConnectionId) -> bool {
        let Some(entry) = self.entries.write().await.remove(&id) else {
            return false;
        };

        if let Some(relay) = &entry.relay {
            relay.release();
        }

        debug!(
            "session {id} closed ({}, peer {})",
            entry.session.status, entry.session.peer
        );
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future;
    use std::time::Duration;

    fn peer() -> SocketAddr {
        "127.0.0.1:50000".parse().unwrap()
    }

    type Pipes = (tokio::task::JoinHandle<()>, tokio::task::JoinHandle<()>);

    fn pending_binding() -> (RelayBinding, Pipes) {
        let forward = tokio::spawn(future::pending::<()>());
        let backward = tokio::spawn(future::pending::<()>());
        let binding = RelayBinding::new(
            "10.0.0.1:80".parse().unwrap(),
            forward.abort_handle(),
            backward.abort_handle(),
        );
        (binding, (forward, backward))
    }

    #[tokio::test]
    async fn open_starts_initial() {
        let store = SessionStore::new();
        let a = store.open(peer()).await;
        let b = store.open(peer()).await;

        assert_ne!(a, b);
        assert_eq!(store.len().await, 2);
        assert_eq!(store.status(a).await, Some(ConnectionStatus::Initial));

        let session = store.get(a).await.unwrap();
        assert_eq!(session.peer, peer());
        assert_eq!(session.relay_target, None);
    }

    #[tokio::test]
    async fn record_and_establish() {
        let store = SessionStore::new();
        let id = store.open(peer()).await;

        let request =
            Request::decode(b"\x04\x01\x00\x50\x00\x00\x00\x01bob\x00example.com\x00").unwrap();
        let ip = Some(Ipv4Addr::new(93, 184, 216, 34));
        store.record_request(id, &request, ip).await;

        let session = store.get(id).await.unwrap();
        assert_eq!(session.socks_version, 4);
        assert_eq!(session.command, 1);
        assert_eq!(session.target_ip, ip);
        assert_eq!(session.target_port, 80);
        assert_eq!(session.target_hostname.as_deref(), Some("example.com"));
        assert_eq!(session.user_id, "bob");
        assert_eq!(session.status, ConnectionStatus::Initial);

        assert!(store.establish(id).await);
        assert_eq!(store.status(id).await, Some(ConnectionStatus::Established));
        assert!(!store.establish(id + 100).await);
    }

    #[tokio::test]
    async fn relay_requires_established() {
        let store = SessionStore::new();
        let id = store.open(peer()).await;

        let (binding, (forward, backward)) = pending_binding();
        assert!(!store.bind_relay(id, binding).await);
        assert!(forward.await.unwrap_err().is_cancelled());
        assert!(backward.await.unwrap_err().is_cancelled());
        assert_eq!(store.get(id).await.unwrap().relay_target, None);
    }

    #[tokio::test]
    async fn close_releases_relay_once() {
        let store = SessionStore::new();
        let id = store.open(peer()).await;
        store.establish(id).await;

        let (binding, (forward, backward)) = pending_binding();
        assert!(store.bind_relay(id, binding).await);
        assert_eq!(
            store.get(id).await.unwrap().relay_target,
            Some("10.0.0.1:80".parse().unwrap())
        );

        assert!(store.close(id).await);
        assert!(store.is_empty().await);

        let forward = tokio::time::timeout(Duration::from_secs(1), forward).await.unwrap();
        let backward = tokio::time::timeout(Duration::from_secs(1), backward).await.unwrap();
        assert!(forward.unwrap_err().is_cancelled());
        assert!(backward.unwrap_err().is_cancelled());

        // Second close is harmless
        assert!(!store.close(id).await);
    }

    #[tokio::test]
    async fn second_binding_is_refused() {
        let store = SessionStore::new();
        let id = store.open(peer()).await;
        store.establish(id).await;

        let (first, _first_pipes) = pending_binding();
        let (second, (f2, b2)) = pending_binding();
        assert!(store.bind_relay(id, first).await);
        assert!(!store.bind_relay(id, second).await);
        assert!(f2.await.unwrap_err().is_cancelled());
        assert!(b2.await.unwrap_err().is_cancelled());

        store.close(id).await;
    }
}
