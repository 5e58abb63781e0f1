use crate::{
    auth::AuthRegistry,
    handshake::{Handshake, Outcome},
    relay::Relay,
    resolver::{Resolver, SystemResolver},
    session::{ConnectionId, SessionStore},
};
use anyhow::{Result, anyhow, bail};
use std::{io, net::SocketAddr, sync::Arc, time::Duration};
use tokio::{
    net::{TcpListener, TcpStream},
    time::{sleep, timeout},
};
use tracing::{debug, error, info, warn};

/// Pause after a failed accept before trying again
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// ServerConfig holds the tunables of a Socks4Server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Deadline for a client to deliver a complete request, None waits
    /// forever. Resolving and replying are not counted against it
    pub handshake_timeout: Option<Duration>,
    /// Deadline for resolving a SOCKS4a hostname
    pub resolve_timeout: Duration,
    /// Deadline for connecting to the target
    pub connect_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Some(Duration::from_secs(30)),
            resolve_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Socks4Server represents a SOCKS4/4a server and houses related
/// configuration data
pub struct Socks4Server {
    pub listen_addr: String,
    pub config: ServerConfig,
    auth: Arc<AuthRegistry>,
    sessions: SessionStore,
    resolver: Arc<dyn Resolver>,
    listener: Option<TcpListener>,
}

/// Everything a connection task needs, cloned once per client
#[derive(Clone)]
struct Shared {
    config: ServerConfig,
    auth: Arc<AuthRegistry>,
    sessions: SessionStore,
    resolver: Arc<dyn Resolver>,
}

/// Socks4Server implementation block
impl Socks4Server {
    /// new is a constructor for the Socks4Server type. Authentication
    /// starts out disabled
    pub fn new(listen_addr: impl Into<String>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            config: ServerConfig::default(),
            auth: Arc::new(AuthRegistry::new()),
            sessions: SessionStore::new(),
            resolver: Arc::new(SystemResolver),
            listener: None,
        }
    }

    pub fn with_config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// with_auth installs a prepared auth registry
    pub fn with_auth(mut self, auth: AuthRegistry) -> Self {
        self.auth = Arc::new(auth);
        self
    }

    /// with_resolver replaces the system resolver used for SOCKS4a
    pub fn with_resolver(mut self, resolver: impl Resolver + 'static) -> Self {
        self.resolver = Arc::new(resolver);
        self
    }

    /// auth gives access to the shared auth registry, e.g. to change it
    /// while the server runs
    pub fn auth(&self) -> Arc<AuthRegistry> {
        Arc::clone(&self.auth)
    }

    pub fn sessions(&self) -> SessionStore {
        self.sessions.clone()
    }

    pub async fn set_auth_enabled(&self, enabled: bool) {
        self.auth.set_enabled(enabled).await;
    }

    pub async fn add_valid_user(&self, user_id: impl Into<String>) {
        self.auth.add_user(user_id).await;
    }

    pub async fn is_auth_enabled(&self) -> bool {
        self.auth.is_enabled().await
    }

    /// bind to the listen address, can only be called once
    pub async fn bind(&mut self) -> Result<SocketAddr> {
        if self.listener.is_some() {
            bail!("[ERR] server is already bound");
        }

        // Instantiate tokio listener
        let listener = TcpListener::bind(&self.listen_addr).await?;
        let addr = listener.local_addr()?;

        info!("SOCKS4 proxy listening on {addr}");

        self.listener = Some(listener);
        Ok(addr)
    }

    /// run handles server spinup and listens for incoming connections
    pub async fn run(&mut self) -> Result<()> {
        if self.listener.is_none() {
            self.bind().await?;
        }
        let listener = self
            .listener
            .take()
            .ok_or_else(|| anyhow!("[ERR] listener missing after bind"))?;

        let shared = Shared {
            config: self.config.clone(),
            auth: Arc::clone(&self.auth),
            sessions: self.sessions.clone(),
            resolver: Arc::clone(&self.resolver),
        };

        // Listen for connections to proxy
        loop {
            let (inbound, peer_addr) = accept_with_backoff(|| listener.accept()).await;

            let shared = shared.clone();

            tokio::spawn(async move {
                let id = shared.sessions.open(peer_addr).await;
                info!("session {id}: new client {peer_addr}");

                if let Err(e) = handle_connection(id, inbound, &shared).await {
                    error!("session {id}: connection error: {e}");
                }

                // Every exit path ends up here
                shared.sessions.close(id).await;
            });
        }
    }
}

/// accept_with_backoff retries `accept` until it hands over a client,
/// waiting ACCEPT_BACKOFF after each failure
async fn accept_with_backoff<F, Fut, T>(mut accept: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = io::Result<T>>,
{
    loop {
        match accept().await {
            Ok(accepted) => return accepted,
            Err(e) => {
                error!("accept failed: {e}, retrying in {ACCEPT_BACKOFF:?}");
                sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

/// handle_connection runs the handshake and, when granted, the relay
async fn handle_connection(id: ConnectionId, mut stream: TcpStream, shared: &Shared) -> Result<()> {
    let handshake = Handshake {
        id,
        auth: &shared.auth,
        sessions: &shared.sessions,
        resolver: shared.resolver.as_ref(),
        read_timeout: shared.config.handshake_timeout,
        resolve_timeout: shared.config.resolve_timeout,
    };

    let (target_addr, pending) = match handshake.run(&mut stream).await? {
        Outcome::Granted { target, pending } => (target, pending),
        Outcome::Rejected(code) => {
            debug!("session {id}: closing after {code}");
            return Ok(());
        }
        Outcome::Dropped => return Ok(()),
    };

    // GRANTED is already out, a failed dial just closes the client
    let target = match timeout(shared.config.connect_timeout, TcpStream::connect(target_addr)).await
    {
        Ok(Ok(target)) => target,
        Ok(Err(e)) => {
            warn!("session {id}: connect to {target_addr} failed: {e}");
            return Ok(());
        }
        Err(_) => {
            warn!("session {id}: connect to {target_addr} timed out");
            return Ok(());
        }
    };

    debug!("session {id}: connected to {target_addr}");

    let relay = Relay {
        id,
        client: stream,
        target,
        pending,
    };
    relay.run(&shared.sessions).await?;

    Ok(())
}
