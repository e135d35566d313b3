//! Storage collaborator for engine state.
//!
//! The engine keeps three kinds of records: the mount configuration at
//! `config`, roles under `roles/`, and issued-lease records under `creds/`.
//! Implementations must be durable and atomic per path; nothing here assumes
//! cross-path transactions.

use crate::{AzSecretsError, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

/// Key-value storage addressed by slash-separated paths.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Returns the value at `path`, or `None` if absent.
    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>>;

    /// Stores `value` at `path`, replacing any previous value.
    async fn put(&self, path: &str, value: &[u8]) -> Result<()>;

    /// Deletes `path`. Deleting a missing path is not an error.
    async fn delete(&self, path: &str) -> Result<()>;

    /// Lists the keys directly under `prefix`, relative to it, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Reads and decodes a JSON record.
pub async fn get_json<T: DeserializeOwned>(storage: &dyn Storage, path: &str) -> Result<Option<T>> {
    match storage.get(path).await? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

/// Encodes and writes a JSON record.
pub async fn put_json<T: Serialize>(storage: &dyn Storage, path: &str, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec(value)?;
    storage.put(path, &bytes).await
}

/// In-memory storage, used by tests and single-process deployments.
#[derive(Default)]
pub struct InMemoryStorage {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl InMemoryStorage {
    /// Creates empty storage.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.read().await.get(path).cloned())
    }

    async fn put(&self, path: &str, value: &[u8]) -> Result<()> {
        self.entries
            .write()
            .await
            .insert(path.to_string(), value.to_vec());
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.entries.write().await.remove(path);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let entries = self.entries.read().await;
        let mut keys: Vec<String> = entries
            .keys()
            .filter_map(|k| k.strip_prefix(prefix))
            .filter(|rest| !rest.is_empty() && !rest.contains('/'))
            .map(str::to_string)
            .collect();
        keys.sort();
        Ok(keys)
    }
}

/// File-backed storage: one file per path under a root directory.
///
/// # Security
///
/// - Directories are created with mode 0700 (owner access only) on Unix
/// - Files are written with mode 0600 (owner read/write only) on Unix
/// - Writes go to a temporary file that is renamed into place, so readers
///   never observe a half-written record
///
/// # Example
///
/// ```no_run
/// use azsecrets::storage::{FileStorage, Storage};
///
/// #[tokio::main]
/// async fn main() -> azsecrets::Result<()> {
///     let storage = FileStorage::new("/var/lib/azsecrets").await?;
///     storage.put("config", br#"{"tenant_id":"t"}"#).await?;
///     assert!(storage.get("config").await?.is_some());
///     Ok(())
/// }
/// ```
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    /// Creates file storage rooted at `root`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if directory creation fails.
    pub async fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        create_private_dir(&root).await?;
        Ok(Self { root })
    }

    fn file_path(&self, path: &str) -> Result<PathBuf> {
        if path.is_empty()
            || path
                .split('/')
                .any(|seg| seg.is_empty() || seg == "." || seg == "..")
        {
            return Err(AzSecretsError::Storage(format!("invalid storage path: {:?}", path)));
        }
        Ok(self.root.join(path))
    }
}

async fn create_private_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).await?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(dir).await?.permissions();
        perms.set_mode(0o700);
        fs::set_permissions(dir, perms).await?;
    }

    Ok(())
}

#[async_trait]
impl Storage for FileStorage {
    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>> {
        let file = self.file_path(path)?;
        match fs::read(&file).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, path: &str, value: &[u8]) -> Result<()> {
        let file = self.file_path(path)?;
        if let Some(parent) = file.parent() {
            create_private_dir(parent).await?;
        }

        let tmp = file.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
        let mut handle = fs::File::create(&tmp).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = handle.metadata().await?.permissions();
            perms.set_mode(0o600);
            fs::set_permissions(&tmp, perms).await?;
        }

        handle.write_all(value).await?;
        handle.flush().await?;
        handle.sync_all().await?;
        drop(handle);

        fs::rename(&tmp, &file).await?;
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let file = self.file_path(path)?;
        match fs::remove_file(&file).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let dir = match prefix.trim_end_matches('/') {
            "" => self.root.clone(),
            trimmed => self.file_path(trimmed)?,
        };

        let mut reader = match fs::read_dir(&dir).await {
            Ok(r) => r,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut keys = Vec::new();
        while let Some(entry) = reader.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if !name.contains(".tmp-") {
                    keys.push(name.to_string());
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}
