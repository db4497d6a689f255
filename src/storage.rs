//! Client-local key/value storage for the persisted identity.

use crate::error::Error;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

/// Durable string storage local to one client
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, Error>;
    fn set(&self, key: &str, value: &str) -> Result<(), Error>;
}

/// Process-lifetime storage
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, Error> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), Error> {
        self.entries.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Storage backed by a JSON object in a single file.
///
/// The file is read on every `get` and rewritten on every `set`; a missing
/// file reads as empty.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<HashMap<String, String>, Error> {
        match fs::read(&self.path) {
            Ok(data) if data.is_empty() => Ok(HashMap::new()),
            Ok(data) => serde_json::from_slice(&data)
                .map_err(|e| Error::Storage(format!("{}: {}", self.path.display(), e))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(Error::Io(e)),
        }
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, Error> {
        let _guard = self.lock.lock();
        Ok(self.load()?.remove(key))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), Error> {
        let _guard = self.lock.lock();
        let mut entries = self.load()?;
        entries.insert(key.to_string(), value.to_string());
        let data = serde_json::to_vec_pretty(&entries).map_err(|e| Error::Storage(e.to_string()))?;
        fs::write(&self.path, data)?;
        Ok(())
    }
}

/// Load the identity stored under `key`, or mint and persist a new one.
///
/// Storage failures never prevent a connection: the identity then lives
/// only for this process.
pub fn establish_identity(store: &dyn KeyValueStore, key: &str) -> String {
    match store.get(key) {
        Ok(Some(identity)) if !identity.is_empty() => {
            debug!("[CLIENT] Reusing identity {}", identity);
            return identity;
        }
        Ok(_) => {}
        Err(e) => warn!("[CLIENT] Reading identity from storage failed: {}", e),
    }

    let identity = Uuid::new_v4().to_string();
    if let Err(e) = store.set(key, &identity) {
        warn!("[CLIENT] Persisting identity failed, it will not survive a restart: {}", e);
    }
    debug!("[CLIENT] Created identity {}", identity);
    identity
}
