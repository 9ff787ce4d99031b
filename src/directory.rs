//! Directory protocol: maps mail domains to server addresses.
//!
//! Each call is one TCP connection carrying a single request and (for REQ)
//! a single reply, read to EOF:
//!
//! ```text
//! REQ <domain>                 -> "<host> <port>" | "ERROR <reason>"
//! UPDATE <domain> <host> <port>   (no reply)
//! ```

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{anyhow, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn};

/// Client side: the two calls the relay engine makes.
#[derive(Debug, Clone)]
pub struct Directory {
    addr: String,
}

impl Directory {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }

    /// Resolve a mail domain to the `(host, port)` of its server.
    pub async fn resolve(&self, domain: &str) -> Result<(String, u16)> {
        let reply = self.exchange(&format!("REQ {}", domain), true).await?;
        if reply.starts_with("ERROR") {
            return Err(anyhow!("directory lookup failed for {}: {}", domain, reply));
        }
        let mut parts = reply.split_whitespace();
        let host = parts
            .next()
            .ok_or_else(|| anyhow!("malformed directory reply: {:?}", reply))?
            .to_string();
        let port: u16 = parts
            .next()
            .ok_or_else(|| anyhow!("malformed directory reply: {:?}", reply))?
            .parse()?;
        Ok((host, port))
    }

    /// Advertise this server's own address for its domain. Fire-and-forget;
    /// the directory sends no reply.
    pub async fn publish(&self, domain: &str, host: &str, port: u16) -> Result<()> {
        self.exchange(&format!("UPDATE {} {} {}", domain, host, port), false)
            .await?;
        Ok(())
    }

    async fn exchange(&self, request: &str, want_reply: bool) -> Result<String> {
        let mut stream = TcpStream::connect(&self.addr).await?;
        stream.write_all(request.as_bytes()).await?;
        stream.shutdown().await?;
        if !want_reply {
            return Ok(String::new());
        }
        let mut reply = String::new();
        stream.read_to_string(&mut reply).await?;
        Ok(reply.trim().to_string())
    }
}

type Table = HashMap<String, (String, u16)>;

/// The directory service loop: a JSON-persisted lookup table served over the
/// protocol above. One request per connection, synchronous.
pub async fn serve_directory(listener: TcpListener, table_path: PathBuf) -> Result<()> {
    let mut table: Table = match tokio::fs::read_to_string(&table_path).await {
        Ok(contents) => serde_json::from_str(&contents)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Table::new(),
        Err(e) => return Err(e.into()),
    };

    info!("Directory listening on {}", listener.local_addr()?);

    loop {
        let (mut stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("Directory accept failed: {}", e);
                continue;
            }
        };

        let mut request = String::new();
        if let Err(e) = stream.read_to_string(&mut request).await {
            warn!("Directory read from {} failed: {}", peer, e);
            continue;
        }

        let parts: Vec<&str> = request.split_whitespace().collect();
        match parts.as_slice() {
            ["REQ", domain] => {
                let reply = match table.get(*domain) {
                    Some((host, port)) => format!("{} {}", host, port),
                    None => format!("ERROR unknown domain {}", domain),
                };
                if let Err(e) = stream.write_all(reply.as_bytes()).await {
                    warn!("Directory reply to {} failed: {}", peer, e);
                }
            }
            ["UPDATE", domain, host, port] => match port.parse::<u16>() {
                Ok(port) => {
                    info!(domain, host, port, "directory entry updated");
                    table.insert(domain.to_string(), (host.to_string(), port));
                    if let Err(e) = persist_table(&table_path, &table).await {
                        warn!("Directory persist failed: {}", e);
                    }
                }
                Err(_) => warn!("Directory UPDATE with bad port from {}: {:?}", peer, request),
            },
            _ => warn!("Malformed directory request from {}: {:?}", peer, request),
        }
    }
}

async fn persist_table(path: &PathBuf, table: &Table) -> Result<()> {
    let contents = serde_json::to_string_pretty(table)?;
    tokio::fs::write(path, contents).await?;
    Ok(())
}
