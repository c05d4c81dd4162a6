//! FileSecretStore - sealed seed and snapshot as files under the app data dir.
//!
//! ```text
//! <data_dir>/
//! ├── seed.sealed     # sealed seed document (opaque to this store)
//! └── session.json    # SessionSnapshot
//! ```
//!
//! Writes go to a temp file and are renamed into place so a crash never leaves
//! a half-written seed behind.

use super::{SecretStore, SessionSnapshot};
use crate::error::StoreError;
use async_trait::async_trait;
use std::path::{Path, PathBuf};

const SEED_FILE: &str = "seed.sealed";
const SNAPSHOT_FILE: &str = "session.json";

#[derive(Debug, Clone)]
pub struct FileSecretStore {
    dir: PathBuf,
}

impl FileSecretStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self { Self { dir: dir.into() } }

    pub fn dir(&self) -> &Path { &self.dir }

    async fn read_optional(&self, name: &str) -> Result<Option<Vec<u8>>, StoreError> {
        match tokio::fs::read(self.dir.join(name)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::Io(format!("read {name}: {e}"))),
        }
    }

    async fn write_atomic(&self, name: &str, bytes: &[u8]) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| StoreError::Io(format!("mkdir: {e}")))?;
        let tmp = self.dir.join(format!("{name}.tmp"));
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| StoreError::Io(format!("write {name}: {e}")))?;
        tokio::fs::rename(&tmp, self.dir.join(name))
            .await
            .map_err(|e| StoreError::Io(format!("rename {name}: {e}")))
    }

    async fn remove(&self, name: &str) -> Result<(), StoreError> {
        match tokio::fs::remove_file(self.dir.join(name)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Io(format!("remove {name}: {e}"))),
        }
    }
}

#[async_trait]
impl SecretStore for FileSecretStore {
    async fn encrypted_seed(&self) -> Result<Option<Vec<u8>>, StoreError> {
        self.read_optional(SEED_FILE).await
    }

    async fn save_encrypted_seed(&self, sealed: &[u8]) -> Result<(), StoreError> {
        self.write_atomic(SEED_FILE, sealed).await
    }

    async fn snapshot(&self) -> Result<SessionSnapshot, StoreError> {
        match self.read_optional(SNAPSHOT_FILE).await? {
            Some(raw) => serde_json::from_slice(&raw)
                .map_err(|e| StoreError::Data(format!("session json: {e}"))),
            None => Ok(SessionSnapshot::default()),
        }
    }

    async fn save_snapshot(&self, snapshot: &SessionSnapshot) -> Result<(), StoreError> {
        let raw = serde_json::to_vec_pretty(snapshot)
            .map_err(|e| StoreError::Data(format!("session json: {e}")))?;
        self.write_atomic(SNAPSHOT_FILE, &raw).await
    }

    async fn clear_all(&self) -> Result<(), StoreError> {
        self.remove(SEED_FILE).await?;
        self.remove(SNAPSHOT_FILE).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_missing_files_read_as_empty() {
        let dir = TempDir::new().expect("tempdir");
        let store = FileSecretStore::new(dir.path().join("nested"));
        assert_eq!(store.encrypted_seed().await.unwrap(), None);
        assert_eq!(store.snapshot().await.unwrap(), SessionSnapshot::default());
        store.clear_all().await.unwrap();
    }

    #[tokio::test]
    async fn test_persists_across_instances() {
        let dir = TempDir::new().expect("tempdir");
        let store = FileSecretStore::new(dir.path());
        store.save_encrypted_seed(b"{\"sealed\":true}").await.unwrap();
        store
            .save_snapshot(&SessionSnapshot { has_backup: true, backup_confirmed: true, ..Default::default() })
            .await
            .unwrap();

        let reopened = FileSecretStore::new(dir.path());
        assert_eq!(reopened.encrypted_seed().await.unwrap().as_deref(), Some(&b"{\"sealed\":true}"[..]));
        let snapshot = reopened.snapshot().await.unwrap();
        assert!(snapshot.has_backup && snapshot.backup_confirmed);
        assert!(!dir.path().join("seed.sealed.tmp").exists());
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_is_data_error() {
        let dir = TempDir::new().expect("tempdir");
        std::fs::write(dir.path().join(SNAPSHOT_FILE), b"{oops").unwrap();
        let store = FileSecretStore::new(dir.path());
        assert!(matches!(store.snapshot().await, Err(StoreError::Data(_))));
    }
}
