use crate::{accountant::Session, error::Result, types::DeviceInfo};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

/// Key of the last connected device
pub const LAST_DEVICE_KEY: &str = "last_device_id";

/// Key of the active session snapshot
pub const ACTIVE_SESSION_KEY: &str = "active_session";

/// Key-value persistence provided by the host application
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read a value
    async fn get(&self, key: &str) -> Result<Option<String>>;
    /// Write a value
    async fn set(&self, key: &str, value: String) -> Result<()>;
    /// Remove a value
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Volatile store, for tests and hosts without persistence
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    /// Empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.values.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        self.values.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.values.write().await.remove(key);
        Ok(())
    }
}

/// Store backed by a single JSON object on disk
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    values: Mutex<HashMap<String, String>>,
}

impl JsonFileStore {
    /// Open `path`, starting empty if it does not exist
    ///
    /// # Errors
    ///
    /// Returns [`crate::CoasterError::Io`] if the file cannot be read, or
    /// [`crate::CoasterError::Json`] if it is not a JSON object of strings.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let values = match tokio::fs::read_to_string(&path).await {
            Ok(text) => serde_json::from_str(&text)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };
        debug!("Opened store {} ({} keys)", path.display(), values.len());
        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    async fn persist(&self, values: &HashMap<String, String>) -> Result<()> {
        let text = serde_json::to_string_pretty(values)?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, text).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for JsonFileStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.values.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        let mut values = self.values.lock().await;
        values.insert(key.to_string(), value);
        self.persist(&values).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut values = self.values.lock().await;
        if values.remove(key).is_some() {
            self.persist(&values).await?;
        }
        Ok(())
    }
}

/// Persisted session with the time it was written
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    /// The session
    pub session: Session,
    /// When the snapshot was written
    pub updated_at: DateTime<Utc>,
}

/// Typed access to the keys this crate persists
#[derive(Clone)]
pub struct CoasterStore {
    inner: Arc<dyn KeyValueStore>,
}

impl std::fmt::Debug for CoasterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoasterStore").finish_non_exhaustive()
    }
}

impl CoasterStore {
    /// Wrap a key-value store
    #[must_use]
    pub fn new(inner: Arc<dyn KeyValueStore>) -> Self {
        Self { inner }
    }

    /// Store backed by [`MemoryStore`]
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    /// Remember the last connected device
    ///
    /// # Errors
    ///
    /// Propagates store and serialization failures.
    pub async fn save_last_device(&self, device: &DeviceInfo) -> Result<()> {
        self.inner
            .set(LAST_DEVICE_KEY, serde_json::to_string(device)?)
            .await
    }

    /// The last connected device, if one was stored and is readable
    ///
    /// # Errors
    ///
    /// Propagates store failures; an unreadable record is dropped and reported as `None`.
    pub async fn load_last_device(&self) -> Result<Option<DeviceInfo>> {
        let Some(text) = self.inner.get(LAST_DEVICE_KEY).await? else {
            return Ok(None);
        };
        match serde_json::from_str(&text) {
            Ok(device) => Ok(Some(device)),
            Err(e) => {
                warn!("Discarding unreadable last device record: {}", e);
                self.inner.delete(LAST_DEVICE_KEY).await?;
                Ok(None)
            }
        }
    }

    /// Forget the last connected device
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn forget_last_device(&self) -> Result<()> {
        self.inner.delete(LAST_DEVICE_KEY).await
    }

    /// Persist the active session
    ///
    /// # Errors
    ///
    /// Propagates store and serialization failures.
    pub async fn save_session(&self, session: &Session, now: DateTime<Utc>) -> Result<()> {
        let snapshot = SessionSnapshot {
            session: session.clone(),
            updated_at: now,
        };
        self.inner
            .set(ACTIVE_SESSION_KEY, serde_json::to_string(&snapshot)?)
            .await
    }

    /// Load the persisted session snapshot
    ///
    /// # Errors
    ///
    /// Propagates store failures; an unreadable snapshot is dropped and reported as `None`.
    pub async fn load_session(&self) -> Result<Option<SessionSnapshot>> {
        let Some(text) = self.inner.get(ACTIVE_SESSION_KEY).await? else {
            return Ok(None);
        };
        match serde_json::from_str(&text) {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(e) => {
                warn!("Discarding unreadable session snapshot: {}", e);
                self.clear_session().await?;
                Ok(None)
            }
        }
    }

    /// Drop the persisted session
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn clear_session(&self) -> Result<()> {
        self.inner.delete(ACTIVE_SESSION_KEY).await
    }
}
