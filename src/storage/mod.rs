//! Persistent wallet state behind a narrow storage interface
//!
//! This module handles:
//! - The `WalletStore` trait consumed by the key registry and address book
//! - An in-memory store for tests
//! - A single-document JSON file store with async I/O
//!
//! Persisted state: seed (hex), per-branch derivation index, external-key
//! representations (possibly password-encrypted), collection public keys,
//! the password check token, and the encrypted flag.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::keyring::{CollectionKey, WalletBranch};

/// Narrow interface to the external key-value storage collaborator.
#[async_trait]
pub trait WalletStore: Send + Sync {
    async fn seed(&self) -> Result<Option<String>>;
    async fn set_seed(&self, seed_hex: &str) -> Result<()>;

    async fn branch_index(&self, branch: WalletBranch) -> Result<u32>;
    async fn set_branch_index(&self, branch: WalletBranch, index: u32) -> Result<()>;

    async fn external_keys(&self) -> Result<Vec<String>>;
    async fn set_external_keys(&self, keys: Vec<String>) -> Result<()>;

    async fn collection_keys(&self) -> Result<Vec<CollectionKey>>;
    async fn set_collection_keys(&self, keys: Vec<CollectionKey>) -> Result<()>;

    async fn secret_token(&self) -> Result<Option<String>>;
    async fn set_secret_token(&self, token: &str) -> Result<()>;

    async fn encrypted_flag(&self) -> Result<bool>;
    async fn set_encrypted_flag(&self, encrypted: bool) -> Result<()>;

    /// Remove every persisted value. Used on wallet reset.
    async fn clear(&self) -> Result<()>;
}

/// The single persisted document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreData {
    seed: Option<String>,
    #[serde(default)]
    branch_indices: BTreeMap<String, u32>,
    #[serde(default)]
    ext_keys: Vec<String>,
    #[serde(default)]
    collection_keys: Vec<CollectionKey>,
    secret_token: Option<String>,
    #[serde(default)]
    encrypted: bool,
}

/// Volatile store for tests and ephemeral wallets.
#[derive(Default)]
pub struct MemoryStore {
    data: Mutex<StoreData>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WalletStore for MemoryStore {
    async fn seed(&self) -> Result<Option<String>> {
        Ok(self.data.lock().unwrap().seed.clone())
    }

    async fn set_seed(&self, seed_hex: &str) -> Result<()> {
        self.data.lock().unwrap().seed = Some(seed_hex.to_string());
        Ok(())
    }

    async fn branch_index(&self, branch: WalletBranch) -> Result<u32> {
        Ok(*self
            .data
            .lock()
            .unwrap()
            .branch_indices
            .get(branch.code())
            .unwrap_or(&0))
    }

    async fn set_branch_index(&self, branch: WalletBranch, index: u32) -> Result<()> {
        self.data
            .lock()
            .unwrap()
            .branch_indices
            .insert(branch.code().to_string(), index);
        Ok(())
    }

    async fn external_keys(&self) -> Result<Vec<String>> {
        Ok(self.data.lock().unwrap().ext_keys.clone())
    }

    async fn set_external_keys(&self, keys: Vec<String>) -> Result<()> {
        self.data.lock().unwrap().ext_keys = keys;
        Ok(())
    }

    async fn collection_keys(&self) -> Result<Vec<CollectionKey>> {
        Ok(self.data.lock().unwrap().collection_keys.clone())
    }

    async fn set_collection_keys(&self, keys: Vec<CollectionKey>) -> Result<()> {
        self.data.lock().unwrap().collection_keys = keys;
        Ok(())
    }

    async fn secret_token(&self) -> Result<Option<String>> {
        Ok(self.data.lock().unwrap().secret_token.clone())
    }

    async fn set_secret_token(&self, token: &str) -> Result<()> {
        self.data.lock().unwrap().secret_token = Some(token.to_string());
        Ok(())
    }

    async fn encrypted_flag(&self) -> Result<bool> {
        Ok(self.data.lock().unwrap().encrypted)
    }

    async fn set_encrypted_flag(&self, encrypted: bool) -> Result<()> {
        self.data.lock().unwrap().encrypted = encrypted;
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        *self.data.lock().unwrap() = StoreData::default();
        Ok(())
    }
}

/// Wallet state persisted as one JSON document on disk.
pub struct FileStore {
    path: PathBuf,
    data: Mutex<StoreData>,
}

impl FileStore {
    /// Open the store, loading the existing document if present.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let data = if path.exists() {
            info!("loading wallet store from {}", path.display());
            let json = fs::read_to_string(&path)
                .await
                .with_context(|| format!("failed to read wallet store {}", path.display()))?;
            serde_json::from_str(&json)
                .with_context(|| format!("failed to parse wallet store {}", path.display()))?
        } else {
            debug!("starting empty wallet store at {}", path.display());
            StoreData::default()
        };
        Ok(Self {
            path,
            data: Mutex::new(data),
        })
    }

    async fn save(&self) -> Result<()> {
        let snapshot = self.data.lock().unwrap().clone();
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .context("failed to create wallet store directory")?;
            }
        }
        let json = serde_json::to_string_pretty(&snapshot)
            .context("failed to serialize wallet store")?;
        fs::write(&self.path, json)
            .await
            .with_context(|| format!("failed to write wallet store {}", self.path.display()))?;
        Ok(())
    }

    fn mutate<F: FnOnce(&mut StoreData)>(&self, f: F) {
        f(&mut self.data.lock().unwrap());
    }
}

#[async_trait]
impl WalletStore for FileStore {
    async fn seed(&self) -> Result<Option<String>> {
        Ok(self.data.lock().unwrap().seed.clone())
    }

    async fn set_seed(&self, seed_hex: &str) -> Result<()> {
        self.mutate(|d| d.seed = Some(seed_hex.to_string()));
        self.save().await
    }

    async fn branch_index(&self, branch: WalletBranch) -> Result<u32> {
        Ok(*self
            .data
            .lock()
            .unwrap()
            .branch_indices
            .get(branch.code())
            .unwrap_or(&0))
    }

    async fn set_branch_index(&self, branch: WalletBranch, index: u32) -> Result<()> {
        self.mutate(|d| {
            d.branch_indices.insert(branch.code().to_string(), index);
        });
        self.save().await
    }

    async fn external_keys(&self) -> Result<Vec<String>> {
        Ok(self.data.lock().unwrap().ext_keys.clone())
    }

    async fn set_external_keys(&self, keys: Vec<String>) -> Result<()> {
        self.mutate(|d| d.ext_keys = keys);
        self.save().await
    }

    async fn collection_keys(&self) -> Result<Vec<CollectionKey>> {
        Ok(self.data.lock().unwrap().collection_keys.clone())
    }

    async fn set_collection_keys(&self, keys: Vec<CollectionKey>) -> Result<()> {
        self.mutate(|d| d.collection_keys = keys);
        self.save().await
    }

    async fn secret_token(&self) -> Result<Option<String>> {
        Ok(self.data.lock().unwrap().secret_token.clone())
    }

    async fn set_secret_token(&self, token: &str) -> Result<()> {
        self.mutate(|d| d.secret_token = Some(token.to_string()));
        self.save().await
    }

    async fn encrypted_flag(&self) -> Result<bool> {
        Ok(self.data.lock().unwrap().encrypted)
    }

    async fn set_encrypted_flag(&self, encrypted: bool) -> Result<()> {
        self.mutate(|d| d.encrypted = encrypted);
        self.save().await
    }

    async fn clear(&self) -> Result<()> {
        self.mutate(|d| *d = StoreData::default());
        self.save().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_memory_store_round_trip() {
        let store = MemoryStore::new();
        assert_eq!(store.seed().await.unwrap(), None);

        store.set_seed("00ff").await.unwrap();
        store
            .set_branch_index(WalletBranch::Fund, 3)
            .await
            .unwrap();
        store.set_encrypted_flag(true).await.unwrap();

        assert_eq!(store.seed().await.unwrap().as_deref(), Some("00ff"));
        assert_eq!(store.branch_index(WalletBranch::Fund).await.unwrap(), 3);
        assert_eq!(store.branch_index(WalletBranch::Ord).await.unwrap(), 0);
        assert!(store.encrypted_flag().await.unwrap());

        store.clear().await.unwrap();
        assert_eq!(store.seed().await.unwrap(), None);
        assert_eq!(store.branch_index(WalletBranch::Fund).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_file_store_persists_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wallet.json");

        {
            let store = FileStore::open(&path).await.unwrap();
            store.set_seed("aabb").await.unwrap();
            store.set_branch_index(WalletBranch::Ord, 7).await.unwrap();
            store
                .set_external_keys(vec!["0/00112233".to_string()])
                .await
                .unwrap();
            store.set_secret_token("token").await.unwrap();
        }

        let reopened = FileStore::open(&path).await.unwrap();
        assert_eq!(reopened.seed().await.unwrap().as_deref(), Some("aabb"));
        assert_eq!(reopened.branch_index(WalletBranch::Ord).await.unwrap(), 7);
        assert_eq!(
            reopened.external_keys().await.unwrap(),
            vec!["0/00112233".to_string()]
        );
        assert_eq!(
            reopened.secret_token().await.unwrap().as_deref(),
            Some("token")
        );
    }

    #[tokio::test]
    async fn test_file_store_clear_wipes_document() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wallet.json");

        let store = FileStore::open(&path).await.unwrap();
        store.set_seed("aabb").await.unwrap();
        store.clear().await.unwrap();

        let reopened = FileStore::open(&path).await.unwrap();
        assert_eq!(reopened.seed().await.unwrap(), None);
    }
}
