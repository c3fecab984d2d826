// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Haven Health Labs

//! Durable JSON/byte storage with integrity checksums.
//!
//! Every write lands atomically (temp file + rename) together with an
//! HMAC-SHA256 sidecar (`<file>.sum`) keyed by a storage-integrity subkey.
//! Reads verify the sidecar before deserializing; a mismatch surfaces as
//! [`StorageError::IntegrityViolation`] and never as silently-accepted
//! data. Subsystems treat a write as committed only once this layer
//! returns.

use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::Path;

use base64ct::{Base64, Encoding};
use serde::{de::DeserializeOwned, Serialize};

use crate::crypto::keyed_hash;

use super::StoragePaths;

/// Sidecar extension appended to the data file name.
const CHECKSUM_EXT: &str = "sum";

/// Error type for storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("storage not initialized")]
    NotInitialized,

    #[error("integrity violation: {0}")]
    IntegrityViolation(String),

    #[error("serialization error: {0}")]
    SerializationError(String),
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Checksummed storage manager for the core's durable state.
#[derive(Clone)]
pub struct CoreStorage {
    paths: StoragePaths,
    integrity_key: [u8; 32],
    initialized: bool,
}

impl std::fmt::Debug for CoreStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreStorage")
            .field("paths", &self.paths)
            .field("integrity_key", &"[REDACTED]")
            .field("initialized", &self.initialized)
            .finish()
    }
}

impl CoreStorage {
    /// Create a new CoreStorage instance.
    ///
    /// Does NOT create the directory structure. Call `initialize()` first.
    pub fn new(paths: StoragePaths, integrity_key: [u8; 32]) -> Self {
        Self {
            paths,
            integrity_key,
            initialized: false,
        }
    }

    /// Get the storage paths.
    pub fn paths(&self) -> &StoragePaths {
        &self.paths
    }

    /// Initialize the storage directory structure.
    ///
    /// Safe to call multiple times (idempotent).
    pub fn initialize(&mut self) -> StorageResult<()> {
        let dirs = [
            self.paths.sessions_dir(),
            self.paths.vault_dir(),
            self.paths.index_dir(),
            self.paths.audit_dir(),
            self.paths.meta_dir(),
        ];

        for dir in dirs {
            fs::create_dir_all(&dir)?;
        }

        self.initialized = true;
        Ok(())
    }

    /// Check that the filesystem is writable and integrity verification
    /// round-trips. Performs a write-read-delete test.
    pub fn health_check(&self) -> StorageResult<()> {
        if !self.initialized {
            return Err(StorageError::NotInitialized);
        }

        let test_file = self.paths.root().join(".health_check");
        self.write_raw(&test_file, b"health_check_data")?;
        let read_back = self.read_raw(&test_file)?;
        self.delete(&test_file)?;

        if read_back != b"health_check_data" {
            return Err(StorageError::IntegrityViolation(
                "health check data mismatch".to_string(),
            ));
        }
        Ok(())
    }

    // ========== Generic JSON Operations ==========

    /// Read a JSON file, verify its checksum, and deserialize it.
    pub fn read_json<T: DeserializeOwned>(&self, path: impl AsRef<Path>) -> StorageResult<T> {
        let bytes = self.read_raw(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Serialize a value and write it with its checksum sidecar.
    pub fn write_json<T: Serialize>(&self, path: impl AsRef<Path>, value: &T) -> StorageResult<()> {
        let bytes = serde_json::to_vec_pretty(value)?;
        self.write_raw(path, &bytes)
    }

    // ========== Raw Operations ==========

    /// Write raw bytes atomically, then write the checksum sidecar.
    pub fn write_raw(&self, path: impl AsRef<Path>, data: &[u8]) -> StorageResult<()> {
        if !self.initialized {
            return Err(StorageError::NotInitialized);
        }

        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        write_atomic(path, data)?;

        let digest = keyed_hash::sign(&self.integrity_key, data);
        write_atomic(
            &checksum_path(path),
            Base64::encode_string(&digest).as_bytes(),
        )?;
        Ok(())
    }

    /// Read raw bytes and verify the checksum sidecar.
    ///
    /// A missing or mismatched sidecar fails closed: persisted core state
    /// without a valid checksum is treated as tampered.
    pub fn read_raw(&self, path: impl AsRef<Path>) -> StorageResult<Vec<u8>> {
        if !self.initialized {
            return Err(StorageError::NotInitialized);
        }

        let path = path.as_ref();
        let mut data = Vec::new();
        File::open(path)
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => {
                    StorageError::NotFound(path.display().to_string())
                }
                _ => StorageError::Io(e),
            })?
            .read_to_end(&mut data)?;

        let stored = fs::read_to_string(checksum_path(path)).map_err(|_| {
            StorageError::IntegrityViolation(format!("missing checksum for {}", path.display()))
        })?;
        let expected = Base64::decode_vec(stored.trim()).map_err(|_| {
            StorageError::IntegrityViolation(format!("malformed checksum for {}", path.display()))
        })?;

        if !keyed_hash::verify(&self.integrity_key, &data, &expected) {
            return Err(StorageError::IntegrityViolation(format!(
                "checksum mismatch for {}",
                path.display()
            )));
        }
        Ok(data)
    }

    /// Check if a file exists.
    pub fn exists(&self, path: impl AsRef<Path>) -> bool {
        File::open(path.as_ref()).is_ok()
    }

    /// Delete a file and its checksum sidecar.
    pub fn delete(&self, path: impl AsRef<Path>) -> StorageResult<()> {
        if !self.initialized {
            return Err(StorageError::NotInitialized);
        }
        let path = path.as_ref();
        fs::remove_file(path)?;
        // Sidecar may be absent if the data file predates integrity checking.
        let _ = fs::remove_file(checksum_path(path));
        Ok(())
    }

    /// List the ids (file stems) of all files with `extension` in a directory.
    pub fn list_files(&self, dir: impl AsRef<Path>, extension: &str) -> StorageResult<Vec<String>> {
        if !self.initialized {
            return Err(StorageError::NotInitialized);
        }

        let dir = dir.as_ref();
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut ids = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }
            if path.extension().and_then(|e| e.to_str()) != Some(extension) {
                continue;
            }
            if let Some(id) = path.file_stem().and_then(|s| s.to_str()) {
                ids.push(id.to_string());
            }
        }
        Ok(ids)
    }
}

/// Write to a temp file, then rename for atomicity.
fn write_atomic(path: &Path, data: &[u8]) -> StorageResult<()> {
    let temp_path = path.with_extension("tmp");
    {
        let file = File::create(&temp_path)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(data)?;
        writer.flush()?;
    }
    fs::rename(&temp_path, path)?;
    Ok(())
}

/// Sidecar path: `foo.json` → `foo.json.sum`.
fn checksum_path(path: &Path) -> std::path::PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".");
    name.push(CHECKSUM_EXT);
    std::path::PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use tempfile::TempDir;

    fn test_storage() -> (TempDir, CoreStorage) {
        let temp = TempDir::new().unwrap();
        let paths = StoragePaths::new(temp.path());
        let mut storage = CoreStorage::new(paths, [1u8; 32]);
        storage.initialize().unwrap();
        (temp, storage)
    }

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct TestData {
        id: String,
        value: i32,
    }

    #[test]
    fn initialize_creates_directories() {
        let (_temp, storage) = test_storage();
        assert!(storage.paths().sessions_dir().exists());
        assert!(storage.paths().vault_dir().exists());
        assert!(storage.paths().index_dir().exists());
        assert!(storage.paths().audit_dir().exists());
        assert!(storage.paths().meta_dir().exists());
    }

    #[test]
    fn write_and_read_json() {
        let (_temp, storage) = test_storage();
        let data = TestData {
            id: "test-1".to_string(),
            value: 42,
        };

        let path = storage.paths().sessions_dir().join("test.json");
        storage.write_json(&path, &data).unwrap();

        let read: TestData = storage.read_json(&path).unwrap();
        assert_eq!(read, data);
    }

    #[test]
    fn tampered_file_fails_integrity_check() {
        let (_temp, storage) = test_storage();
        let path = storage.paths().sessions_dir().join("victim.json");
        storage
            .write_json(&path, &TestData {
                id: "v".to_string(),
                value: 1,
            })
            .unwrap();

        // Flip a byte behind the storage layer's back.
        let mut bytes = fs::read(&path).unwrap();
        bytes[0] ^= 0xFF;
        fs::write(&path, bytes).unwrap();

        let result = storage.read_json::<TestData>(&path);
        assert!(matches!(result, Err(StorageError::IntegrityViolation(_))));
    }

    #[test]
    fn missing_checksum_fails_closed() {
        let (_temp, storage) = test_storage();
        let path = storage.paths().sessions_dir().join("bare.json");
        fs::write(&path, b"{\"id\":\"x\",\"value\":0}").unwrap();

        let result = storage.read_json::<TestData>(&path);
        assert!(matches!(result, Err(StorageError::IntegrityViolation(_))));
    }

    #[test]
    fn wrong_integrity_key_fails_closed() {
        let temp = TempDir::new().unwrap();
        let path_under_test = {
            let mut writer = CoreStorage::new(StoragePaths::new(temp.path()), [1u8; 32]);
            writer.initialize().unwrap();
            let path = writer.paths().meta_dir().join("data.json");
            writer
                .write_json(&path, &TestData {
                    id: "k".to_string(),
                    value: 7,
                })
                .unwrap();
            path
        };

        let mut reader = CoreStorage::new(StoragePaths::new(temp.path()), [2u8; 32]);
        reader.initialize().unwrap();
        let result = reader.read_json::<TestData>(&path_under_test);
        assert!(matches!(result, Err(StorageError::IntegrityViolation(_))));
    }

    #[test]
    fn delete_removes_file_and_sidecar() {
        let (_temp, storage) = test_storage();
        let path = storage.paths().sessions_dir().join("gone.json");
        storage
            .write_json(&path, &TestData {
                id: "g".to_string(),
                value: 0,
            })
            .unwrap();

        assert!(storage.exists(&path));
        storage.delete(&path).unwrap();
        assert!(!storage.exists(&path));
        assert!(!checksum_path(&path).exists());
    }

    #[test]
    fn list_files_returns_ids() {
        let (_temp, storage) = test_storage();
        for i in 1..=3 {
            let path = storage.paths().sessions_dir().join(format!("s-{i}.json"));
            storage
                .write_json(&path, &TestData {
                    id: format!("s-{i}"),
                    value: i,
                })
                .unwrap();
        }

        let ids = storage
            .list_files(storage.paths().sessions_dir(), "json")
            .unwrap();
        assert_eq!(ids.len(), 3);
        assert!(ids.contains(&"s-1".to_string()));
        // Checksum sidecars must not show up as entries.
        assert!(!ids.iter().any(|id| id.ends_with(".json")));
    }

    #[test]
    fn uninitialized_storage_returns_error() {
        let storage = CoreStorage::new(StoragePaths::new("/tmp/never-init"), [0u8; 32]);
        let result = storage.read_json::<TestData>("/tmp/any.json");
        assert!(matches!(result, Err(StorageError::NotInitialized)));
    }

    #[test]
    fn health_check_works() {
        let (_temp, storage) = test_storage();
        storage.health_check().expect("health check should pass");
    }
}
