//! File-backed account registry.
//!
//! Accounts live in a local JSON file. The daemon re-reads the file on every
//! lookup, so `reelqueue accounts ...` edits apply without a restart.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use reelqueue_scheduler::{Account, AccountProvider, CollaboratorError};

/// Errors from account file operations.
#[derive(Debug, Error)]
pub enum AccountError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("account not found: {0}")]
    NotFound(String),

    #[error("invalid account reference: {0}")]
    InvalidRef(String),
}

/// One stored account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountEntry {
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_valid")]
    pub valid: bool,
    #[serde(default)]
    pub credentials: serde_json::Value,
}

fn default_valid() -> bool {
    true
}

/// Account file format.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct AccountFileData {
    #[serde(default = "current_version")]
    version: u32,
    #[serde(default)]
    accounts: BTreeMap<String, AccountEntry>,
}

fn current_version() -> u32 {
    1
}

impl Default for AccountFileData {
    fn default() -> Self {
        Self {
            version: current_version(),
            accounts: BTreeMap::new(),
        }
    }
}

/// Editable view of the account file.
#[derive(Debug)]
pub struct AccountFile {
    path: PathBuf,
    data: AccountFileData,
}

impl AccountFile {
    /// Load the account file. A missing file is an empty registry.
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self, AccountError> {
        let path = path.into();
        let data = match fs::read_to_string(&path).await {
            Ok(content) => serde_json::from_str(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => AccountFileData::default(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self { path, data })
    }

    /// Get the default account file path.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("reelqueue")
            .join("accounts.json")
    }

    pub fn get(&self, account_ref: &str) -> Option<Account> {
        self.data
            .accounts
            .get(account_ref)
            .map(|entry| to_account(account_ref, entry))
    }

    /// All accounts, ordered by reference.
    pub fn list(&self) -> Vec<Account> {
        self.data
            .accounts
            .iter()
            .map(|(account_ref, entry)| to_account(account_ref, entry))
            .collect()
    }

    /// Add or replace an account and persist. New accounts start valid.
    pub async fn upsert(
        &mut self,
        account_ref: &str,
        name: &str,
        credentials: serde_json::Value,
    ) -> Result<(), AccountError> {
        validate_ref(account_ref)?;
        self.data.accounts.insert(
            account_ref.to_string(),
            AccountEntry {
                name: name.to_string(),
                valid: true,
                credentials,
            },
        );
        self.save().await
    }

    pub async fn remove(&mut self, account_ref: &str) -> Result<(), AccountError> {
        if self.data.accounts.remove(account_ref).is_none() {
            return Err(AccountError::NotFound(account_ref.to_string()));
        }
        self.save().await
    }

    /// Mark an account valid or invalid. Jobs for invalid accounts fail.
    pub async fn set_valid(&mut self, account_ref: &str, valid: bool) -> Result<(), AccountError> {
        let entry = self
            .data
            .accounts
            .get_mut(account_ref)
            .ok_or_else(|| AccountError::NotFound(account_ref.to_string()))?;
        entry.valid = valid;
        self.save().await
    }

    /// Save to disk with restricted permissions.
    async fn save(&self) -> Result<(), AccountError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let content = serde_json::to_string_pretty(&self.data)?;

        // Write to temp file first, then rename
        let temp_path = self.path.with_extension("tmp");
        let mut file = fs::File::create(&temp_path).await?;

        // Credentials are secrets: owner read/write only
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = file.metadata().await?.permissions();
            perms.set_mode(0o600);
            file.set_permissions(perms).await?;
        }

        file.write_all(content.as_bytes()).await?;
        file.sync_all().await?;
        fs::rename(&temp_path, &self.path).await?;

        Ok(())
    }
}

fn to_account(account_ref: &str, entry: &AccountEntry) -> Account {
    Account {
        account_ref: account_ref.to_string(),
        name: entry.name.clone(),
        valid: entry.valid,
        credentials: entry.credentials.clone(),
    }
}

fn validate_ref(account_ref: &str) -> Result<(), AccountError> {
    if account_ref.trim().is_empty() {
        return Err(AccountError::InvalidRef("reference cannot be empty".to_string()));
    }
    if account_ref.chars().any(char::is_whitespace) {
        return Err(AccountError::InvalidRef(format!(
            "'{}' must not contain whitespace",
            account_ref
        )));
    }
    Ok(())
}

/// Account provider that reads the account file on every lookup.
#[derive(Debug, Clone)]
pub struct FileAccountProvider {
    path: PathBuf,
}

impl FileAccountProvider {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl AccountProvider for FileAccountProvider {
    async fn get_account(&self, account_ref: &str) -> Result<Option<Account>, CollaboratorError> {
        let file = AccountFile::load(&self.path).await?;
        Ok(file.get(account_ref))
    }
}
