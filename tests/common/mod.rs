//! Shared scaffolding for the socket-level integration tests: a server
//! started on ephemeral ports against a temp-dir store, and a scripted
//! line-mode client.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};

use relaymail::protocol;
use relaymail::runtime::Runtime;
use relaymail::utils::config::Config;
use relaymail::utils::hash_password;

pub const DOMAIN: &str = "local.test";

pub struct TestServer {
    _dir: TempDir,
    pub runtime: Arc<Runtime>,
    pub smtp_addr: String,
    pub pop3_addr: String,
    pub mailboxes_path: std::path::PathBuf,
}

/// Start SMTP + POP3 on ephemeral ports with accounts alice, bob, and the
/// postmaster relay identity. `directory_addr` wires up the relay worker.
pub async fn start_server(directory_addr: Option<&str>) -> TestServer {
    start_server_inner(directory_addr, None).await
}

/// Same server, with a short idle timeout for connection-reaping tests.
pub async fn start_server_with_idle(idle_timeout_secs: &str) -> TestServer {
    start_server_inner(None, Some(idle_timeout_secs)).await
}

async fn start_server_inner(
    directory_addr: Option<&str>,
    idle_timeout_secs: Option<&str>,
) -> TestServer {
    let dir = TempDir::new().unwrap();

    let accounts: HashMap<&str, String> = [
        ("alice", hash_password("alice-secret")),
        ("bob", hash_password("bob-secret")),
        ("postmaster", hash_password("relay-secret")),
    ]
    .into_iter()
    .collect();
    let accounts_path = dir.path().join("accounts.json");
    std::fs::write(&accounts_path, serde_json::to_string(&accounts).unwrap()).unwrap();

    let mut config = Config::new();
    config.set_value("system", "domain", DOMAIN).unwrap();
    config
        .set_value("storage", "accounts", accounts_path.to_str().unwrap())
        .unwrap();
    let mailboxes_path = dir.path().join("mailboxes.json");
    config
        .set_value("storage", "mailboxes", mailboxes_path.to_str().unwrap())
        .unwrap();
    config.set_value("relay", "username", "postmaster").unwrap();
    config
        .set_value("relay", "password_hash", &hash_password("relay-secret"))
        .unwrap();
    config.set_value("relay", "timeout_secs", "5").unwrap();
    if let Some(addr) = directory_addr {
        let (host, port) = addr.rsplit_once(':').unwrap();
        config.set_value("directory", "host", host).unwrap();
        config.set_value("directory", "port", port).unwrap();
    }
    if let Some(secs) = idle_timeout_secs {
        config.set_value("limits", "idle_timeout_secs", secs).unwrap();
    }

    let runtime = Arc::new(Runtime::new(Arc::new(config)));
    runtime.init_storage().await.unwrap();
    let mut tasks = Vec::new();
    runtime.start_relay(&mut tasks).unwrap();

    let smtp_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let smtp_addr = smtp_listener.local_addr().unwrap().to_string();
    tokio::spawn(protocol::smtp::serve(smtp_listener, Arc::clone(&runtime)));

    let pop3_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let pop3_addr = pop3_listener.local_addr().unwrap().to_string();
    tokio::spawn(protocol::pop3::serve(pop3_listener, Arc::clone(&runtime)));

    TestServer {
        _dir: dir,
        runtime,
        smtp_addr,
        pop3_addr,
        mailboxes_path,
    }
}

pub struct Client {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Client {
    pub async fn connect(addr: &str) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (r, w) = stream.into_split();
        Self {
            reader: BufReader::new(r),
            writer: w,
        }
    }

    pub async fn send(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\r\n").await.unwrap();
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).await.unwrap();
        self.writer.flush().await.unwrap();
    }

    /// Next reply line, delimiter stripped. Panics on EOF.
    pub async fn line(&mut self) -> String {
        let mut buf = String::new();
        let n = self.reader.read_line(&mut buf).await.unwrap();
        assert!(n > 0, "connection closed while expecting a reply");
        buf.trim_end_matches(['\r', '\n']).to_string()
    }

    /// Expect the peer to have closed the connection.
    pub async fn expect_eof(&mut self) {
        let mut buf = String::new();
        let n = self.reader.read_line(&mut buf).await.unwrap();
        assert_eq!(n, 0, "expected EOF, got {:?}", buf);
    }
}

/// Drive a full SMTP connect + EHLO + AUTH LOGIN as `username`.
pub async fn smtp_login(addr: &str, username: &str, password: &str) -> Client {
    let mut c = Client::connect(addr).await;
    assert!(c.line().await.starts_with("220"));
    c.send("EHLO client.test").await;
    assert!(c.line().await.starts_with("250-"));
    assert_eq!(c.line().await, "250-AUTH LOGIN PLAIN");
    assert_eq!(c.line().await, "250 Ok");
    c.send("AUTH LOGIN").await;
    assert!(c.line().await.starts_with("334"));
    c.send(&B64.encode(username)).await;
    assert!(c.line().await.starts_with("334"));
    c.send(&B64.encode(hash_password(password))).await;
    let reply = c.line().await;
    assert!(reply.starts_with("235"), "auth rejected: {}", reply);
    c
}

/// Drive a full POP3 connect + USER/PASS as `username`. Returns the client
/// and the maildrop greeting line from PASS.
pub async fn pop3_login(addr: &str, username: &str, password: &str) -> (Client, String) {
    let mut c = Client::connect(addr).await;
    assert!(c.line().await.starts_with("+OK"));
    c.send(&format!("USER {}", username)).await;
    let user_reply = c.line().await;
    assert!(user_reply.starts_with(&format!("+OK {}", username)), "{}", user_reply);
    c.send(&format!("PASS {}", hash_password(password))).await;
    let pass_reply = c.line().await;
    assert!(pass_reply.starts_with(&format!("+OK {}", username)), "{}", pass_reply);
    (c, pass_reply)
}

/// Submit one message over an authenticated SMTP client.
pub async fn smtp_submit(c: &mut Client, from: &str, to: &str, body_lines: &[&str]) {
    c.send(&format!("MAIL FROM:<{}>", from)).await;
    assert!(c.line().await.starts_with("250"));
    c.send(&format!("RCPT TO:<{}>", to)).await;
    assert!(c.line().await.starts_with("250"));
    c.send("DATA").await;
    assert!(c.line().await.starts_with("354"));
    for line in body_lines {
        c.send(line).await;
    }
    c.send(".").await;
    let reply = c.line().await;
    assert!(reply.starts_with("250"), "submit rejected: {}", reply);
}
