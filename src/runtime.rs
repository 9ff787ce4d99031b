use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::sync::OnceCell;
use tracing::{error, info, warn};

use crate::directory::Directory;
use crate::protocol;
use crate::relay::{RelayHandle, RelayWorker};
use crate::storage::accounts::AccountTable;
use crate::storage::mailbox::MailStore;
use crate::utils::config::Config;

pub struct Runtime {
    pub config: Arc<Config>,
    accounts: OnceCell<AccountTable>,
    store: OnceCell<MailStore>,
    relay: OnceCell<RelayHandle>,
}

impl Runtime {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            accounts: OnceCell::const_new(),
            store: OnceCell::const_new(),
            relay: OnceCell::const_new(),
        }
    }

    /// The mail domain this server is authoritative for.
    pub fn domain(&self) -> &str {
        self.config.get_value("system", "domain").unwrap_or("localhost")
    }

    pub fn hostname(&self) -> &str {
        match self.config.get_value("system", "hostname") {
            Some(hostname) => hostname,
            None => self.domain(),
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.config.get_int("limits", "idle_timeout_secs", 300).max(1) as u64)
    }

    pub fn accounts(&self) -> &AccountTable {
        self.accounts.get().expect("accounts not initialized")
    }

    pub fn store(&self) -> &MailStore {
        self.store.get().expect("mail store not initialized")
    }

    pub fn relay(&self) -> &RelayHandle {
        self.relay.get().expect("relay worker not started")
    }

    /// Load the account table and open the mailbox store.
    pub async fn init_storage(&self) -> Result<()> {
        let accounts_path = self
            .config
            .get_value("storage", "accounts")
            .unwrap_or("accounts.json");
        let accounts = AccountTable::load(accounts_path).await?;
        info!("Loaded {} accounts from {}", accounts.len(), accounts_path);
        self.accounts
            .set(accounts)
            .map_err(|_| anyhow::anyhow!("accounts already initialized"))?;

        let mailbox_path = self
            .config
            .get_value("storage", "mailboxes")
            .unwrap_or("mailboxes.json");
        let store = MailStore::open(mailbox_path).await?;
        self.store
            .set(store)
            .map_err(|_| anyhow::anyhow!("mail store already initialized"))?;

        Ok(())
    }

    /// Start the outbound relay worker and keep its queue handle.
    pub fn start_relay(&self, tasks: &mut Vec<tokio::task::JoinHandle<()>>) -> Result<()> {
        let (handle, task) = RelayWorker::start(&self.config);
        self.relay
            .set(handle)
            .map_err(|_| anyhow::anyhow!("relay worker already started"))?;
        tasks.push(task);
        Ok(())
    }

    /// Advertise this server's own domain in the directory. Best effort.
    pub async fn publish_to_directory(&self, smtp_port: u16) {
        if !self.config.is_section_exists("directory") {
            return;
        }
        let addr = format!(
            "{}:{}",
            self.config.get_value("directory", "host").unwrap_or("127.0.0.1"),
            self.config.get_int("directory", "port", 8080)
        );
        let host = self
            .config
            .get_value("directory", "advertise_host")
            .unwrap_or("127.0.0.1");
        let directory = Directory::new(addr);
        match directory.publish(self.domain(), host, smtp_port).await {
            Ok(()) => info!(
                "Published {} -> {}:{} to directory",
                self.domain(),
                host,
                smtp_port
            ),
            Err(e) => warn!("Directory publish failed: {}", e),
        }
    }

    pub async fn run(self: Arc<Self>, tasks: &mut Vec<tokio::task::JoinHandle<()>>) -> Result<()> {
        self.init_storage().await?;
        self.start_relay(tasks)?;

        let mut smtp_port = 0;

        // Failing to bind a listening socket is fatal; everything after
        // accept is contained per connection.
        if self.config.is_section_exists("smtp") {
            let bind = self.config.get_value("smtp", "bind").unwrap_or("0.0.0.0");
            let port = self.config.get_int("smtp", "port", 2525);
            let listener = TcpListener::bind(format!("{}:{}", bind, port)).await?;
            smtp_port = listener.local_addr()?.port();
            info!("SMTP server listening on {}:{}", bind, smtp_port);

            let rt = Arc::clone(&self);
            tasks.push(tokio::spawn(async move {
                if let Err(e) = protocol::smtp::serve(listener, rt).await {
                    error!("SMTP server stopped: {}", e);
                }
            }));
        }

        if self.config.is_section_exists("pop3") {
            let bind = self.config.get_value("pop3", "bind").unwrap_or("0.0.0.0");
            let port = self.config.get_int("pop3", "port", 110);
            let listener = TcpListener::bind(format!("{}:{}", bind, port)).await?;
            info!("POP3 server listening on {}", listener.local_addr()?);

            let rt = Arc::clone(&self);
            tasks.push(tokio::spawn(async move {
                if let Err(e) = protocol::pop3::serve(listener, rt).await {
                    error!("POP3 server stopped: {}", e);
                }
            }));
        }

        if smtp_port != 0 {
            self.publish_to_directory(smtp_port).await;
        }

        Ok(())
    }
}
