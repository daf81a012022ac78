//! Device affinity persistence.
//!
//! The store itself is a dumb string map; [`IdentityRecord`] owns the
//! policy of which keys exist and when they are written or cleared.

use crate::domain::models::{GattUuid, LastKnownAccessory, PeripheralId, TargetSelector};
use crate::error::Result;
use std::collections::HashMap;
use tracing::{debug, warn};

pub const LAST_PERIPHERAL_KEY: &str = "lastConnectedPeripheralUUID";
pub const LAST_SERVICE_KEY: &str = "lastServiceUUID";
pub const LAST_CHARACTERISTIC_KEY: &str = "lastCharacteristicUUID";

/// Key-value persistence for the identity triple.
pub trait IdentityStore: Send {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&mut self, key: &str, value: &str) -> Result<()>;
    fn delete(&mut self, key: &str) -> Result<()>;
}

/// Volatile store, for tests and for running without a config directory.
#[derive(Debug, Default, Clone)]
pub struct MemoryIdentityStore {
    values: HashMap<String, String>,
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IdentityStore for MemoryIdentityStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        self.values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&mut self, key: &str) -> Result<()> {
        self.values.remove(key);
        Ok(())
    }
}

/// What was restored from the store at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoredIdentity {
    pub target: Option<TargetSelector>,
    pub last_known: Option<LastKnownAccessory>,
}

/// Read/write/clear discipline over an [`IdentityStore`].
pub struct IdentityRecord<S: IdentityStore> {
    store: S,
}

impl<S: IdentityStore> IdentityRecord<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Read the triple once. Unparseable UUIDs are treated as absent.
    pub fn restore(&self) -> RestoredIdentity {
        let uuid = |key: &str| {
            let text = self.store.get(key)?;
            match GattUuid::parse(&text) {
                Ok(uuid) => Some(uuid),
                Err(e) => {
                    warn!("Ignoring stored {}: {}", key, e);
                    None
                }
            }
        };

        let target = match (uuid(LAST_SERVICE_KEY), uuid(LAST_CHARACTERISTIC_KEY)) {
            (Some(service), Some(characteristic)) => {
                Some(TargetSelector::new(service, characteristic))
            }
            _ => None,
        };

        let last_known = match (target, self.store.get(LAST_PERIPHERAL_KEY)) {
            (Some(target), Some(id)) if !id.is_empty() => Some(LastKnownAccessory {
                accessory: PeripheralId::new(id),
                target,
            }),
            _ => None,
        };

        debug!(
            "Restored identity: target={:?}, last_known={:?}",
            target, last_known
        );
        RestoredIdentity { target, last_known }
    }

    pub fn persist(&mut self, accessory: &LastKnownAccessory) -> Result<()> {
        self.store
            .set(LAST_PERIPHERAL_KEY, accessory.accessory.as_str())?;
        self.store
            .set(LAST_SERVICE_KEY, &accessory.target.service.to_string())?;
        self.store.set(
            LAST_CHARACTERISTIC_KEY,
            &accessory.target.characteristic.to_string(),
        )?;
        Ok(())
    }

    pub fn clear(&mut self) -> Result<()> {
        self.store.delete(LAST_PERIPHERAL_KEY)?;
        self.store.delete(LAST_SERVICE_KEY)?;
        self.store.delete(LAST_CHARACTERISTIC_KEY)?;
        Ok(())
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}
