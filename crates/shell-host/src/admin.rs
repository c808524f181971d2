//! Durable admin allow-list.
//!
//! Stored as `{"admins": [ids...]}`. The primary operator is always a
//! member, whatever the file says, and cannot be removed.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::warn;

use crate::error::AdminError;
use crate::registry::OwnerId;

#[derive(Serialize, Deserialize, Default)]
struct AdminDocument {
    #[serde(default)]
    admins: Vec<OwnerId>,
}

pub struct AdminStore {
    path: PathBuf,
    primary: OwnerId,
    admins: RwLock<BTreeSet<OwnerId>>,
}

impl AdminStore {
    /// Load the list from `path`. A missing or unreadable file yields just
    /// the primary operator.
    pub fn load(path: impl Into<PathBuf>, primary: OwnerId) -> Self {
        let path = path.into();
        let mut admins = match read_document(&path) {
            Ok(doc) => doc.admins.into_iter().collect(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => BTreeSet::new(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to load admins");
                BTreeSet::new()
            }
        };
        admins.insert(primary);
        Self {
            path,
            primary,
            admins: RwLock::new(admins),
        }
    }

    pub fn primary(&self) -> OwnerId {
        self.primary
    }

    pub fn is_primary(&self, id: OwnerId) -> bool {
        id == self.primary
    }

    pub async fn is_admin(&self, id: OwnerId) -> bool {
        id == self.primary || self.admins.read().await.contains(&id)
    }

    /// Sorted member list, primary included.
    pub async fn list(&self) -> Vec<OwnerId> {
        self.admins.read().await.iter().copied().collect()
    }

    /// Add an admin given as operator text. Re-adding is not an error.
    pub async fn add(&self, raw: &str) -> Result<OwnerId, AdminError> {
        let id = parse_id(raw)?;
        let mut admins = self.admins.write().await;
        if admins.insert(id) {
            if let Err(e) = self.save(&admins) {
                admins.remove(&id);
                return Err(e);
            }
        }
        Ok(id)
    }

    pub async fn remove(&self, raw: &str) -> Result<OwnerId, AdminError> {
        let id = parse_id(raw)?;
        if id == self.primary {
            return Err(AdminError::CannotRemovePrimary);
        }
        let mut admins = self.admins.write().await;
        if !admins.remove(&id) {
            return Err(AdminError::NotFound(id));
        }
        if let Err(e) = self.save(&admins) {
            admins.insert(id);
            return Err(e);
        }
        Ok(id)
    }

    fn save(&self, admins: &BTreeSet<OwnerId>) -> Result<(), AdminError> {
        let doc = AdminDocument {
            admins: admins.iter().copied().collect(),
        };
        atomic_write_json(&self.path, &doc).map_err(|source| AdminError::Persist {
            path: self.path.clone(),
            source,
        })
    }
}

fn parse_id(raw: &str) -> Result<OwnerId, AdminError> {
    let trimmed = raw.trim();
    trimmed
        .parse()
        .map_err(|_| AdminError::InvalidId(trimmed.to_string()))
}

fn read_document(path: &Path) -> io::Result<AdminDocument> {
    let content = fs::read_to_string(path)?;
    serde_json::from_str(&content).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Write to a sibling temp file, then rename over the target.
fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    let json = serde_json::to_string(value).map_err(io::Error::other)?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, json)?;
    fs::rename(&tmp_path, path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_in(dir: &Path) -> AdminStore {
        AdminStore::load(dir.join("bot_data.json"), 100)
    }

    #[tokio::test]
    async fn missing_file_yields_primary_only() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        assert_eq!(store.list().await, vec![100]);
        assert!(store.is_admin(100).await);
        assert!(!store.is_admin(5).await);
    }

    #[tokio::test]
    async fn corrupt_file_falls_back_to_primary() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("bot_data.json"), "{not json").unwrap();
        let store = store_in(dir.path());
        assert_eq!(store.list().await, vec![100]);
    }

    #[tokio::test]
    async fn primary_is_added_even_if_file_omits_it() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("bot_data.json"), r#"{"admins":[7,8]}"#).unwrap();
        let store = store_in(dir.path());
        assert_eq!(store.list().await, vec![7, 8, 100]);
    }

    #[tokio::test]
    async fn add_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        assert_eq!(store.add(" 55 ").await.unwrap(), 55);
        assert!(store.is_admin(55).await);

        let reloaded = store_in(dir.path());
        assert_eq!(reloaded.list().await, vec![55, 100]);
        assert!(!dir.path().join("bot_data.json.tmp").exists());
    }

    #[tokio::test]
    async fn add_rejects_non_numeric_without_mutation() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        assert!(matches!(
            store.add("bob").await,
            Err(AdminError::InvalidId(s)) if s == "bob"
        ));
        assert_eq!(store.list().await, vec![100]);
        assert!(!dir.path().join("bot_data.json").exists());
    }

    #[tokio::test]
    async fn failed_add_is_rolled_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = AdminStore::load(dir.path().join("missing/bot_data.json"), 100);
        assert!(matches!(store.add("5").await, Err(AdminError::Persist { .. })));
        assert!(!store.is_admin(5).await);
        assert_eq!(store.list().await, vec![100]);
    }

    #[tokio::test]
    async fn primary_cannot_be_removed() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        assert!(matches!(
            store.remove("100").await,
            Err(AdminError::CannotRemovePrimary)
        ));
        assert!(store.is_admin(100).await);
    }

    #[tokio::test]
    async fn remove_unknown_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        assert!(matches!(store.remove("9").await, Err(AdminError::NotFound(9))));
    }

    #[tokio::test]
    async fn remove_persists() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        store.add("9").await.unwrap();
        assert_eq!(store.remove("9").await.unwrap(), 9);
        assert_eq!(store_in(dir.path()).list().await, vec![100]);
    }
}
