//! SOCKS4 server that only serves listed USERIDs

use socks4_proxy::Socks4Server;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let mut server = Socks4Server::new("127.0.0.1:1080");

    // Adding a user switches authentication on
    server.add_valid_user("<user>").await;
    println!("authentication enabled: {}", server.is_auth_enabled().await);

    server.run().await?;
    Ok(())
}
