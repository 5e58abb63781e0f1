//! A lightweight SOCKS4/SOCKS4a proxy library
//!
//! ## SOCKS4 Implementation
//!
//! - Features:
//!     - CONNECT (BIND is answered with a rejection)
//!     - SOCKS4a hostname requests, resolved off the reactor
//!     - Optional USERID allow-list
//!     - Async using tokio, one task per client and one per relay direction
//!     - Explicit per-connection session tracking
//!     - Handshake, lookup and connect deadlines
//! - [SOCKS4](https://www.openssh.com/txt/socks4.protocol)
//! - [SOCKS4a](https://www.openssh.com/txt/socks4a.protocol)
//!
//! # Example
//! ```no_run
//! use socks4_proxy::{AuthRegistry, Socks4Server};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut server = Socks4Server::new("127.0.0.1:1080")
//!         .with_auth(AuthRegistry::with_users(["alice"]));
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod frame;
pub mod handshake;
pub mod protocol;
pub mod relay;
pub mod request;
pub mod resolver;
pub mod server;
pub mod session;

// Re-export main types at crate root for convenience
pub use auth::AuthRegistry;
pub use frame::{Scan, scan};
pub use protocol::{Command, ConnectionStatus, ResponseCode, Version};
pub use request::{Reply, Request};
pub use resolver::{Resolver, SystemResolver};
pub use server::{ServerConfig, Socks4Server};
pub use session::{ConnectionId, ConnectionSession, SessionStore};
