use std::collections::HashMap;
use std::path::Path;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("account not found or password is incorrect")]
    InvalidCredentials,
}

/// Static account list: `username -> SHA-256 hex password hash`.
///
/// Loaded once at startup from a JSON object and never mutated afterwards;
/// account provisioning happens outside the server.
#[derive(Debug, Clone, Default)]
pub struct AccountTable {
    accounts: HashMap<String, String>,
}

impl AccountTable {
    pub async fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let contents = tokio::fs::read_to_string(path.as_ref()).await?;
        let accounts: HashMap<String, String> = serde_json::from_str(&contents)?;
        Ok(Self { accounts })
    }

    #[cfg(test)]
    pub fn from_entries(entries: &[(&str, &str)]) -> Self {
        Self {
            accounts: entries
                .iter()
                .map(|(u, h)| (u.to_string(), h.to_string()))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    /// Verify a presented password hash against the stored one.
    pub fn authenticate(&self, username: &str, password_hash: &str) -> Result<(), AuthError> {
        match self.accounts.get(username) {
            Some(stored) if stored == password_hash => Ok(()),
            _ => Err(AuthError::InvalidCredentials),
        }
    }
}
