//! Forwarding: local delivery vs. relay to another domain's server.
//!
//! A completed DATA transaction either lands in the local mailbox store or
//! becomes a `RelayJob` on a bounded queue. A dedicated worker task drains
//! the queue, resolves the destination through the directory, and performs
//! the outbound SMTP submission, so a slow or unreachable remote peer never
//! stalls the sessions being served. Resolution or submission failure drops
//! the message (no bounce, no retry); every drop is logged.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::directory::Directory;
use crate::runtime::Runtime;
use crate::storage::mailbox::MailMessage;
use crate::utils::config::Config;

/// One accepted message: the recorded envelope plus the body.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub sender: String,
    pub recipient: String,
    pub body: String,
}

/// Sender side of the relay queue, held by the runtime.
#[derive(Debug, Clone)]
pub struct RelayHandle {
    tx: mpsc::Sender<Envelope>,
}

impl RelayHandle {
    fn enqueue(&self, envelope: Envelope) {
        // Bounded queue; when it is full the message is dropped rather than
        // blocking the session that delivered it.
        if let Err(e) = self.tx.try_send(envelope) {
            let envelope = match &e {
                mpsc::error::TrySendError::Full(env)
                | mpsc::error::TrySendError::Closed(env) => env,
            };
            warn!(
                sender = %envelope.sender,
                recipient = %envelope.recipient,
                "relay queue unavailable, message dropped: {}", e
            );
        }
    }
}

/// Decide, once per completed DATA transaction, where the message goes.
pub async fn deliver(runtime: &Arc<Runtime>, envelope: Envelope) -> Result<()> {
    let domain = recipient_domain(&envelope.recipient)?;
    if domain.eq_ignore_ascii_case(runtime.domain()) {
        let user = local_part(&envelope.recipient)?;
        runtime
            .store()
            .append(
                user,
                MailMessage {
                    from: envelope.sender,
                    msg: envelope.body,
                },
            )
            .await
    } else {
        runtime.relay().enqueue(envelope);
        Ok(())
    }
}

/// The outbound relay worker: directory lookups plus SMTP submission,
/// bounded by a per-attempt timeout.
pub struct RelayWorker {
    directory: Directory,
    hostname: String,
    relay_user: String,
    relay_password_hash: String,
    attempt_timeout: Duration,
}

impl RelayWorker {
    pub fn start(config: &Config) -> (RelayHandle, JoinHandle<()>) {
        let directory_addr = format!(
            "{}:{}",
            config.get_value("directory", "host").unwrap_or("127.0.0.1"),
            config.get_int("directory", "port", 8080)
        );
        let worker = Self {
            directory: Directory::new(directory_addr),
            hostname: config
                .get_value("system", "hostname")
                .or_else(|| config.get_value("system", "domain"))
                .unwrap_or("localhost")
                .to_string(),
            relay_user: config
                .get_value("relay", "username")
                .unwrap_or("postmaster")
                .to_string(),
            relay_password_hash: config
                .get_value("relay", "password_hash")
                .unwrap_or("")
                .to_string(),
            attempt_timeout: Duration::from_secs(
                config.get_int("relay", "timeout_secs", 30).max(1) as u64,
            ),
        };

        let capacity = config.get_int("relay", "queue_capacity", 64).max(1) as usize;
        let (tx, rx) = mpsc::channel(capacity);
        let task = tokio::spawn(worker.run(rx));
        (RelayHandle { tx }, task)
    }

    async fn run(self, mut rx: mpsc::Receiver<Envelope>) {
        while let Some(job) = rx.recv().await {
            let sender = job.sender.clone();
            let recipient = job.recipient.clone();
            match timeout(self.attempt_timeout, self.forward(job)).await {
                Ok(Ok(())) => {
                    info!(%sender, %recipient, "message relayed");
                }
                Ok(Err(e)) => {
                    warn!(%sender, %recipient, "relay failed, message dropped: {}", e);
                }
                Err(_) => {
                    warn!(%sender, %recipient, "relay timed out, message dropped");
                }
            }
        }
    }

    async fn forward(&self, job: Envelope) -> Result<()> {
        let domain = recipient_domain(&job.recipient)?;
        let (host, port) = self.directory.resolve(domain).await?;
        crate::protocol::smtp::send_message(
            &format!("{}:{}", host, port),
            &self.hostname,
            &self.relay_user,
            &self.relay_password_hash,
            &job.sender,
            &job.recipient,
            &job.body,
        )
        .await
    }
}

fn recipient_domain(address: &str) -> Result<&str> {
    address
        .rsplit_once('@')
        .map(|(_, domain)| domain)
        .filter(|d| !d.is_empty())
        .ok_or_else(|| anyhow!("recipient address has no domain: {:?}", address))
}

fn local_part(address: &str) -> Result<&str> {
    address
        .rsplit_once('@')
        .map(|(user, _)| user)
        .filter(|u| !u.is_empty())
        .ok_or_else(|| anyhow!("recipient address has no local part: {:?}", address))
}
