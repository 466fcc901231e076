//! Persisted device credentials.
//!
//! The identity is loaded once at startup, saved when the server issues a new
//! token (`registered`) and cleared when the server rejects it
//! (`auth_failed`). Store failures are logged by callers and never end a
//! session.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use fleet_core::{DeviceId, DeviceIdentity, DeviceToken};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Storage for the device identity.
pub trait CredentialStore: Send + Sync {
    /// Loads the stored identity; an empty identity if nothing is stored.
    fn load(&self) -> Result<DeviceIdentity, StoreError>;

    fn save(&self, identity: &DeviceIdentity) -> Result<(), StoreError>;

    /// Forgets the stored id and token.
    fn clear(&self) -> Result<(), StoreError>;
}

// ============================================================================
// File Store
// ============================================================================

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoredCredentials {
    #[serde(default)]
    device_id: DeviceId,
    #[serde(default)]
    device_token: DeviceToken,
    #[serde(default)]
    device_name: String,
}

/// JSON file store: `{device_id, device_token, device_name}`.
#[derive(Debug, Clone)]
pub struct FileCredentialStore {
    path: PathBuf,
    device_name: String,
}

impl FileCredentialStore {
    pub fn new(path: impl Into<PathBuf>, device_name: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            device_name: device_name.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<Option<StoredCredentials>, StoreError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StoreError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| StoreError::Format {
                path: self.path.clone(),
                source,
            })
    }

    fn write(&self, stored: &StoredCredentials) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }

        let json = serde_json::to_vec_pretty(stored).map_err(|source| StoreError::Format {
            path: self.path.clone(),
            source,
        })?;

        fs::write(&self.path, json).map_err(|source| StoreError::Io {
            path: self.path.clone(),
            source,
        })
    }
}

impl CredentialStore for FileCredentialStore {
    fn load(&self) -> Result<DeviceIdentity, StoreError> {
        Ok(self
            .read()?
            .map(|stored| DeviceIdentity {
                device_id: stored.device_id,
                device_token: stored.device_token,
            })
            .unwrap_or_default())
    }

    fn save(&self, identity: &DeviceIdentity) -> Result<(), StoreError> {
        self.write(&StoredCredentials {
            device_id: identity.device_id.clone(),
            device_token: identity.device_token.clone(),
            device_name: self.device_name.clone(),
        })
    }

    fn clear(&self) -> Result<(), StoreError> {
        // Keep whatever name was recorded; a corrupt file is simply replaced.
        let device_name = match self.read() {
            Ok(Some(stored)) if !stored.device_name.is_empty() => stored.device_name,
            _ => self.device_name.clone(),
        };

        self.write(&StoredCredentials {
            device_name,
            ..Default::default()
        })
    }
}

// ============================================================================
// Memory Store
// ============================================================================

/// In-process store for tests and embedders that persist elsewhere.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    identity: Mutex<DeviceIdentity>,
}

impl MemoryCredentialStore {
    pub fn new(identity: DeviceIdentity) -> Self {
        Self {
            identity: Mutex::new(identity),
        }
    }

    /// Current stored identity.
    pub fn snapshot(&self) -> DeviceIdentity {
        self.lock().clone()
    }

    fn replace(&self, identity: DeviceIdentity) {
        *self.lock() = identity;
    }

    fn lock(&self) -> MutexGuard<'_, DeviceIdentity> {
        self.identity.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn load(&self) -> Result<DeviceIdentity, StoreError> {
        Ok(self.snapshot())
    }

    fn save(&self, identity: &DeviceIdentity) -> Result<(), StoreError> {
        self.replace(identity.clone());
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        self.replace(DeviceIdentity::default());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_loads_empty_identity() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::new(dir.path().join("device.json"), "desk");
        let identity = store.load().unwrap();
        assert!(!identity.has_token());
    }

    #[test]
    fn test_save_creates_parent_and_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("device.json");
        let store = FileCredentialStore::new(&path, "desk");

        store.save(&DeviceIdentity::new("d1", "t1")).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded, DeviceIdentity::new("d1", "t1"));

        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["device_name"], "desk");
        assert_eq!(raw["device_token"], "t1");
    }

    #[test]
    fn test_clear_keeps_name_and_drops_token() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("device.json");
        fs::write(
            &path,
            r#"{"device_id":"d1","device_token":"t1","device_name":"old-name"}"#,
        )
        .unwrap();
        let store = FileCredentialStore::new(&path, "new-name");

        store.clear().unwrap();

        assert!(!store.load().unwrap().has_token());
        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["device_name"], "old-name");
        assert_eq!(raw["device_id"], "");
    }

    #[test]
    fn test_malformed_file_is_format_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("device.json");
        fs::write(&path, "{not json").unwrap();
        let store = FileCredentialStore::new(&path, "desk");
        assert!(matches!(store.load(), Err(StoreError::Format { .. })));
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryCredentialStore::new(DeviceIdentity::new("d1", "t1"));
        assert!(store.load().unwrap().has_token());
        store.clear().unwrap();
        assert!(!store.snapshot().has_token());
        store.save(&DeviceIdentity::new("d2", "t2")).unwrap();
        assert_eq!(store.snapshot().device_id.as_str(), "d2");
    }
}
