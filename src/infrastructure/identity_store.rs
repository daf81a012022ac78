//! JSON file backed identity store.
//!
//! The whole map is rewritten on every change; it only ever holds the
//! three identity keys. Writes go to a temporary file in the same directory
//! which is then renamed over the old one, so a crash leaves either the old
//! or the new contents.

use crate::domain::identity::IdentityStore;
use crate::error::Result;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub struct JsonIdentityStore {
    path: PathBuf,
    values: BTreeMap<String, String>,
}

impl JsonIdentityStore {
    /// Open `path`, starting empty if it is missing or unreadable.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let values = match Self::load(&path) {
            Ok(values) => values,
            Err(e) => {
                if path.exists() {
                    warn!("Identity store {} unreadable, starting empty: {}", path.display(), e);
                }
                BTreeMap::new()
            }
        };
        debug!("Identity store {} opened with {} keys", path.display(), values.len());
        Self { path, values }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(path: &Path) -> Result<BTreeMap<String, String>> {
        let contents = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    fn flush(&self) -> Result<()> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir)?;

        let json = serde_json::to_string_pretty(&self.values)?;
        let mut staged = tempfile::NamedTempFile::new_in(dir)?;
        staged.write_all(json.as_bytes())?;
        staged.as_file().sync_all()?;
        staged.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }
}

impl IdentityStore for JsonIdentityStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        if self.values.get(key).map(String::as_str) == Some(value) {
            return Ok(());
        }
        self.values.insert(key.to_string(), value.to_string());
        self.flush()
    }

    fn delete(&mut self, key: &str) -> Result<()> {
        if self.values.remove(key).is_none() {
            return Ok(());
        }
        self.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::identity::{IdentityRecord, LAST_PERIPHERAL_KEY};
    use crate::domain::models::{LastKnownAccessory, TargetSelector};

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.json");

        let mut record = IdentityRecord::new(JsonIdentityStore::open(&path));
        let accessory = LastKnownAccessory {
            accessory: "6E400001-B5A3-F393-E0A9-E50E24DCCA9E".into(),
            target: TargetSelector::parse("FFE0", "FFE1").unwrap(),
        };
        record.persist(&accessory).unwrap();

        let reopened = IdentityRecord::new(JsonIdentityStore::open(&path));
        assert_eq!(reopened.restore().last_known, Some(accessory));
    }

    #[test]
    fn delete_is_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("identity.json");

        let mut store = JsonIdentityStore::open(&path);
        store.set(LAST_PERIPHERAL_KEY, "X").unwrap();
        store.delete(LAST_PERIPHERAL_KEY).unwrap();

        assert!(JsonIdentityStore::open(&path).get(LAST_PERIPHERAL_KEY).is_none());
    }

    #[test]
    fn rewrite_replaces_file_without_leftovers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.json");

        let mut store = JsonIdentityStore::open(&path);
        store.set(LAST_PERIPHERAL_KEY, "X").unwrap();
        store.set(LAST_PERIPHERAL_KEY, "Y").unwrap();

        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("identity.json")]);
        assert_eq!(
            JsonIdentityStore::open(&path).get(LAST_PERIPHERAL_KEY).as_deref(),
            Some("Y")
        );
    }

    #[test]
    fn corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.json");
        fs::write(&path, "{ broken").unwrap();

        let store = JsonIdentityStore::open(&path);
        assert!(store.get(LAST_PERIPHERAL_KEY).is_none());
    }
}
