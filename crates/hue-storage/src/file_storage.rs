use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use hue_core::models::ClientCredential;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;

const STORAGE_FILE: &str = "storage.json";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WhitelistEntry {
    pub name: String,
    #[serde(default, rename = "clientkey", skip_serializing_if = "Option::is_none")]
    pub client_key: Option<String>,
    #[serde(rename = "create date", with = "time::serde::rfc3339")]
    pub create_date: OffsetDateTime,
    #[serde(rename = "last use date", with = "time::serde::rfc3339")]
    pub last_use_date: OffsetDateTime,
}

impl From<&ClientCredential> for WhitelistEntry {
    fn from(credential: &ClientCredential) -> Self {
        Self {
            name: credential.name.clone(),
            client_key: credential.client_key.clone(),
            create_date: credential.issued_at,
            last_use_date: credential.issued_at,
        }
    }
}

/// Whitelist persistence in `<root>/storage.json`.
///
/// Clones share one write lock so read-modify-write cycles from concurrent
/// request handlers do not drop each other's entries.
#[derive(Debug, Clone)]
pub struct FileStorage {
    root: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StorageState {
    #[serde(default)]
    whitelist: BTreeMap<String, WhitelistEntry>,
}

impl FileStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    fn load(&self) -> Result<StorageState, StorageError> {
        let path = self.root.join(STORAGE_FILE);
        if !path.exists() {
            return Ok(StorageState::default());
        }
        let data = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }

    fn save(&self, state: &StorageState) -> Result<(), StorageError> {
        fs::create_dir_all(&self.root)?;
        let tmp_path = self.root.join(format!("{STORAGE_FILE}.tmp"));
        let final_path = self.root.join(STORAGE_FILE);
        let mut file = fs::File::create(&tmp_path)?;
        let payload = serde_json::to_vec_pretty(state)?;
        file.write_all(&payload)?;
        file.sync_all()?;
        fs::rename(tmp_path, final_path)?;
        Ok(())
    }

    fn modify<T>(
        &self,
        f: impl FnOnce(&mut StorageState) -> T,
    ) -> Result<T, StorageError> {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut state = self.load()?;
        let out = f(&mut state);
        self.save(&state)?;
        Ok(out)
    }

    pub fn list_whitelist(&self) -> Result<BTreeMap<String, WhitelistEntry>, StorageError> {
        Ok(self.load()?.whitelist)
    }

    pub fn get_client(&self, client_id: &str) -> Result<Option<WhitelistEntry>, StorageError> {
        Ok(self.load()?.whitelist.remove(client_id))
    }

    pub fn add_credential(&self, credential: &ClientCredential) -> Result<(), StorageError> {
        self.modify(|state| {
            state
                .whitelist
                .insert(credential.client_id.clone(), WhitelistEntry::from(credential));
        })
    }

    /// Updates the last use date; returns false for unknown clients.
    pub fn touch_client(
        &self,
        client_id: &str,
        at: OffsetDateTime,
    ) -> Result<bool, StorageError> {
        self.modify(|state| match state.whitelist.get_mut(client_id) {
            Some(entry) => {
                entry.last_use_date = at;
                true
            }
            None => false,
        })
    }

    pub fn remove_client(&self, client_id: &str) -> Result<bool, StorageError> {
        self.modify(|state| state.whitelist.remove(client_id).is_some())
    }
}
