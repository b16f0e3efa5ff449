//! Interactive line chat over a UDP+ connection: run one instance as the server and one as
//!  the client, then type lines into either side.

use anyhow::bail;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;
use udp_plus::config::UdpPlusConfig;
use udp_plus::connection::Connection;
use udp_plus::endpoint::Endpoint;

const PORT: u16 = 30000;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    println!("UDP+ demo");
    println!("=========");
    println!("role: [1] server  [2] client");

    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();

    let role = match lines.next_line().await? {
        Some(line) => line.trim().to_string(),
        None => return Ok(()),
    };

    let endpoint = Endpoint::new(UdpPlusConfig::default_ipv4())?;
    let conn = match role.as_str() {
        "1" => {
            let local: SocketAddr = SocketAddr::from(([0, 0, 0, 0], PORT));
            endpoint.bind(local).await?;
            info!("waiting for a client on port {}...", PORT);
            endpoint.accept().await?
        }
        "2" => {
            let remote: SocketAddr = SocketAddr::from(([127, 0, 0, 1], PORT));
            endpoint.connect(remote).await?
        }
        other => bail!("unknown role {:?}", other),
    };
    info!("connected to {:?}", conn.peer_addr());

    let printer = {
        let conn = conn.clone();
        tokio::spawn(async move { print_loop(conn).await })
    };

    while let Some(line) = lines.next_line().await? {
        if conn.send(line.as_bytes()).await.is_err() {
            info!("connection is closed");
            break;
        }
    }

    conn.close().await;
    printer.await?;
    endpoint.close_all().await;
    Ok(())
}

async fn print_loop(conn: Arc<Connection>) {
    while let Some(message) = conn.recv().await {
        println!("peer: {}", String::from_utf8_lossy(&message));
    }
    println!("peer closed the connection");
}
