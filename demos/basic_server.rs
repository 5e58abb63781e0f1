//! Basic SOCKS4 server example
//!
//! Try it with: curl -x socks4a://127.0.0.1:1080 http://example.com

use socks4_proxy::Socks4Server;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let mut server = Socks4Server::new("127.0.0.1:1080");
    println!("Starting SOCKS4 server on 127.0.0.1:1080");

    server.run().await?;
    Ok(())
}
