use anyhow::Result;
use clap::Parser;
use socks4_proxy::{AuthRegistry, ServerConfig, Socks4Server};
use std::time::Duration;
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about = "A lightweight SOCKS4/SOCKS4a proxy", long_about = None)]
struct Args {
    /// Listener address
    #[arg(short, long, default_value = "127.0.0.1:1080")]
    listen: String,

    /// Accepted USERID, may be repeated. Any user enables authentication
    #[arg(short, long = "user")]
    users: Vec<String>,

    /// Enable authentication even without users (rejects everyone)
    #[arg(long)]
    auth: bool,

    /// Seconds a client gets to send its request, 0 waits forever
    #[arg(long, default_value_t = 30)]
    handshake_timeout: u64,

    /// Seconds allowed for resolving a SOCKS4a hostname
    #[arg(long, default_value_t = 10)]
    resolve_timeout: u64,

    /// Seconds allowed for connecting to the target
    #[arg(long, default_value_t = 10)]
    connect_timeout: u64,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse args
    let args = Args::parse();

    // Initialize tracing subscriber
    let level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt().with_max_level(level).init();

    let auth = AuthRegistry::new();
    for user in &args.users {
        auth.add_user(user.as_str()).await;
    }
    if args.auth {
        auth.set_enabled(true).await;
    }
    if auth.is_enabled().await {
        info!("Authentication enabled for {} user(s)", args.users.len());
    }

    let config = ServerConfig {
        handshake_timeout: match args.handshake_timeout {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        },
        resolve_timeout: Duration::from_secs(args.resolve_timeout),
        connect_timeout: Duration::from_secs(args.connect_timeout),
    };

    // Instantiate server
    let mut server = Socks4Server::new(args.listen)
        .with_config(config)
        .with_auth(auth);

    // Run it
    info!("Starting SOCKS4 proxy: {}", server.listen_addr);
    server.run().await
}
