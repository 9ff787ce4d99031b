use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

/// One stored message: the envelope sender and the raw body text received
/// between DATA and the terminating dot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailMessage {
    pub from: String,
    pub msg: String,
}

impl MailMessage {
    pub fn size(&self) -> usize {
        self.msg.len()
    }
}

type Mailboxes = HashMap<String, Vec<MailMessage>>;

/// The domain's mailbox store: `username -> ordered message list`, persisted
/// as one JSON document and rewritten wholesale on every change.
///
/// All mutation goes through the internal mutex, so delivery and POP3
/// compaction are serialized and a racing writer can never lose an update.
#[derive(Debug)]
pub struct MailStore {
    path: PathBuf,
    inner: Mutex<Mailboxes>,
}

impl MailStore {
    /// Open the store, loading existing mailboxes if the file is present.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mailboxes: Mailboxes = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => serde_json::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Mailboxes::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            inner: Mutex::new(mailboxes),
        })
    }

    /// Append a message to a user's mailbox and persist. The mailbox is
    /// created on first delivery.
    pub async fn append(&self, username: &str, message: MailMessage) -> Result<()> {
        let mut boxes = self.inner.lock().await;
        boxes.entry(username.to_string()).or_default().push(message);
        debug!(username, "message delivered to local mailbox");
        self.persist(&boxes).await
    }

    /// Clone of the user's mailbox as it stands right now. POP3 sessions take
    /// this at PASS time and index into it for the rest of the session.
    pub async fn snapshot(&self, username: &str) -> Vec<MailMessage> {
        let boxes = self.inner.lock().await;
        boxes.get(username).cloned().unwrap_or_default()
    }

    /// Apply staged POP3 deletions: drop the staged 0-based snapshot indices,
    /// keep every survivor in order, and keep anything delivered after the
    /// snapshot was taken (positions >= `snapshot_len`). Persists the result.
    pub async fn compact(
        &self,
        username: &str,
        staged: &BTreeSet<usize>,
        snapshot_len: usize,
    ) -> Result<()> {
        let mut boxes = self.inner.lock().await;
        if let Some(mailbox) = boxes.get_mut(username) {
            let survivors: Vec<MailMessage> = mailbox
                .iter()
                .enumerate()
                .filter(|(i, _)| *i >= snapshot_len || !staged.contains(i))
                .map(|(_, m)| m.clone())
                .collect();
            debug!(
                username,
                dropped = mailbox.len() - survivors.len(),
                "compacting mailbox"
            );
            *mailbox = survivors;
        }
        self.persist(&boxes).await
    }

    async fn persist(&self, boxes: &Mailboxes) -> Result<()> {
        let contents = serde_json::to_string_pretty(boxes)?;
        tokio::fs::write(&self.path, contents).await?;
        Ok(())
    }
}
