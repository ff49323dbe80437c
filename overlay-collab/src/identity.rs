//! Durable local identity.
//!
//! A client keeps the same user id for its whole life and tries to keep the
//! same peer id across reloads, so remote peers can recognise it when it
//! reconnects. Both live in a host-provided key-value store.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use uuid::Uuid;

const USER_ID_KEY: &str = "overlay.userId";
const PEER_ID_KEY: &str = "overlay.peerId";

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("Key-value store I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Key-value store is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// Host persistent string store.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, IdentityError>;
    fn set(&self, key: &str, value: &str) -> Result<(), IdentityError>;
    fn remove(&self, key: &str) -> Result<(), IdentityError>;
}

#[derive(Debug, Default)]
pub struct MemoryKeyValue {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryKeyValue {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, BTreeMap<String, String>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl KeyValueStore for MemoryKeyValue {
    fn get(&self, key: &str) -> Result<Option<String>, IdentityError> {
        Ok(self.entries().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), IdentityError> {
        self.entries().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), IdentityError> {
        self.entries().remove(key);
        Ok(())
    }
}

/// Key-value store persisted as one JSON object on disk.
///
/// Every write rewrites the file through a temporary sibling and a rename.
#[derive(Debug)]
pub struct JsonFileKeyValue {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

impl JsonFileKeyValue {
    /// Open `path`, starting empty when the file does not exist yet.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, IdentityError> {
        let path = path.into();
        let entries = match fs::read(&path) {
            Ok(bytes) if bytes.is_empty() => BTreeMap::new(),
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, entries: &BTreeMap<String, String>) -> Result<(), IdentityError> {
        let json = serde_json::to_vec_pretty(entries)?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn update(&self, f: impl FnOnce(&mut BTreeMap<String, String>)) -> Result<(), IdentityError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let mut next = entries.clone();
        f(&mut next);
        self.persist(&next)?;
        *entries = next;
        Ok(())
    }
}

impl KeyValueStore for JsonFileKeyValue {
    fn get(&self, key: &str) -> Result<Option<String>, IdentityError> {
        Ok(self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), IdentityError> {
        self.update(|entries| {
            entries.insert(key.to_string(), value.to_string());
        })
    }

    fn remove(&self, key: &str) -> Result<(), IdentityError> {
        self.update(|entries| {
            entries.remove(key);
        })
    }
}

/// Local user id plus the last peer id signaling handed out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DurableIdentity {
    pub user_id: String,
    pub peer_id: Option<String>,
}

impl DurableIdentity {
    /// Load the identity, minting and persisting a user id on first use.
    pub fn get_or_create(kv: &dyn KeyValueStore) -> Result<Self, IdentityError> {
        let user_id = match kv.get(USER_ID_KEY)? {
            Some(id) if !id.is_empty() => id,
            _ => {
                let id = format!("user-{}", Uuid::new_v4());
                kv.set(USER_ID_KEY, &id)?;
                log::info!("Created local identity {id}");
                id
            }
        };
        let peer_id = kv.get(PEER_ID_KEY)?.filter(|id| !id.is_empty());
        Ok(Self { user_id, peer_id })
    }

    /// Store the peer id signaling assigned, to prefer it next time.
    pub fn remember_peer_id(&mut self, kv: &dyn KeyValueStore, peer_id: &str) -> Result<(), IdentityError> {
        if self.peer_id.as_deref() != Some(peer_id) {
            kv.set(PEER_ID_KEY, peer_id)?;
            self.peer_id = Some(peer_id.to_string());
        }
        Ok(())
    }

    /// Drop the stored peer id. The user id is kept.
    pub fn forget_peer_id(&mut self, kv: &dyn KeyValueStore) -> Result<(), IdentityError> {
        kv.remove(PEER_ID_KEY)?;
        self.peer_id = None;
        Ok(())
    }
}
