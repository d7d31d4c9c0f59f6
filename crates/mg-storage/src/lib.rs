//! Versioned JSON storage for rule documents
//!
//! Implements the gateway's `.storage/` directory pattern: each store key
//! is one JSON file wrapped with version metadata, written atomically via
//! a temp file and rename. [`FileRuleStore`] backs the engine's
//! `RuleStore` seam with this layout so rule documents survive restarts.

use async_trait::async_trait;
use mg_rules::{RuleConfig, RuleStore, StoreError, StoreResult};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, warn};

/// Storage key of the rule set file
const RULES_KEY: &str = "meshgate.rules";

/// Current major version of the rule set file
const RULES_VERSION: u32 = 1;

/// Current minor version of the rule set file
const RULES_MINOR_VERSION: u32 = 1;

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Version mismatch for {key}: expected {expected}, found {found}")]
    VersionMismatch {
        key: String,
        expected: u32,
        found: u32,
    },
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Storage file wrapper with version tracking
///
/// JSON format:
/// ```json
/// {
///   "version": 1,
///   "minor_version": 1,
///   "key": "meshgate.rules",
///   "data": { ... }
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageFile<T> {
    /// Major version - breaking changes
    pub version: u32,
    /// Minor version - migrations within major version
    pub minor_version: u32,
    /// Storage key (file identifier)
    pub key: String,
    /// The actual data
    pub data: T,
}

impl<T> StorageFile<T> {
    /// Create a new storage file
    pub fn new(key: impl Into<String>, data: T, version: u32, minor_version: u32) -> Self {
        Self {
            version,
            minor_version,
            key: key.into(),
            data,
        }
    }
}

/// Storage manager for the `.storage/` directory
#[derive(Debug, Clone)]
pub struct Storage {
    /// Path to the `.storage/` directory
    storage_dir: PathBuf,
}

impl Storage {
    /// Create a storage manager under the given gateway data directory
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            storage_dir: data_dir.as_ref().join(".storage"),
        }
    }

    /// Get the storage directory path
    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    /// Ensure the storage directory exists
    pub async fn ensure_dir(&self) -> StorageResult<()> {
        if !self.storage_dir.exists() {
            fs::create_dir_all(&self.storage_dir).await?;
            debug!("Created storage directory: {:?}", self.storage_dir);
        }
        Ok(())
    }

    /// Get the file path for a storage key
    pub fn file_path(&self, key: &str) -> PathBuf {
        self.storage_dir.join(key)
    }

    /// Check if a storage key exists
    pub async fn exists(&self, key: &str) -> bool {
        self.file_path(key).exists()
    }

    /// Load data from storage
    ///
    /// Returns None if the file doesn't exist.
    pub async fn load<T>(&self, key: &str) -> StorageResult<Option<StorageFile<T>>>
    where
        T: DeserializeOwned,
    {
        let path = self.file_path(key);

        if !path.exists() {
            debug!("Storage file not found: {}", key);
            return Ok(None);
        }

        let content = fs::read_to_string(&path).await?;
        let storage_file: StorageFile<T> = serde_json::from_str(&content)?;

        debug!(
            "Loaded storage file: {} (v{}.{})",
            key, storage_file.version, storage_file.minor_version
        );

        Ok(Some(storage_file))
    }

    /// Save data to storage
    ///
    /// Writes atomically by first writing to a temp file, then renaming.
    pub async fn save<T>(&self, storage_file: &StorageFile<T>) -> StorageResult<()>
    where
        T: Serialize,
    {
        self.ensure_dir().await?;

        let path = self.file_path(&storage_file.key);
        let temp_path = self.file_path(&format!("{}.tmp", storage_file.key));

        // Serialize with pretty printing for readability
        let content = serde_json::to_string_pretty(storage_file)?;

        // Write to temp file first
        fs::write(&temp_path, &content).await?;

        // Atomic rename
        fs::rename(&temp_path, &path).await?;

        debug!(
            "Saved storage file: {} (v{}.{})",
            storage_file.key, storage_file.version, storage_file.minor_version
        );

        Ok(())
    }

    /// Delete a storage file
    pub async fn delete(&self, key: &str) -> StorageResult<()> {
        let path = self.file_path(key);

        if path.exists() {
            fs::remove_file(&path).await?;
            debug!("Deleted storage file: {}", key);
        }

        Ok(())
    }
}

/// Durable rule document store backed by a storage file
pub struct FileRuleStore {
    storage: Storage,
}

impl FileRuleStore {
    /// Create a store writing under the given gateway data directory
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            storage: Storage::new(data_dir),
        }
    }
}

#[async_trait]
impl RuleStore for FileRuleStore {
    async fn load_all(&self) -> StoreResult<Vec<RuleConfig>> {
        let loaded: Option<StorageFile<Vec<RuleConfig>>> = self
            .storage
            .load(RULES_KEY)
            .await
            .map_err(|e| match e {
                StorageError::Json(e) => StoreError::Corrupt(e.to_string()),
                other => StoreError::Backend(other.to_string()),
            })?;

        let Some(file) = loaded else {
            return Ok(Vec::new());
        };

        if file.version != RULES_VERSION {
            warn!(
                found = file.version,
                expected = RULES_VERSION,
                "Rule storage file has an unexpected version"
            );
            return Err(StoreError::Backend(
                StorageError::VersionMismatch {
                    key: RULES_KEY.to_string(),
                    expected: RULES_VERSION,
                    found: file.version,
                }
                .to_string(),
            ));
        }

        Ok(file.data)
    }

    async fn save_all(&self, rules: &[RuleConfig]) -> StoreResult<()> {
        let file = StorageFile::new(
            RULES_KEY,
            rules.to_vec(),
            RULES_VERSION,
            RULES_MINOR_VERSION,
        );

        self.storage
            .save(&file)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))
    }
}
