use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use warden_schema::ServiceDef;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry unavailable: {0}")]
    Unavailable(String),
    #[error("registry rejected '{service}' for '{container}': {reason}")]
    Rejected {
        container: String,
        service: String,
        reason: String,
    },
    #[error("registry serialization error: {0}")]
    Serialization(String),
}

/// Service registry as seen by the change engine.
///
/// Entries are keyed by (container id, service name). Deregistering a
/// container without entries must succeed.
pub trait Registrar: Send + Sync {
    fn register(
        &self,
        id: &str,
        name: &str,
        address: &str,
        service: &ServiceDef,
    ) -> Result<(), RegistryError>;

    /// Remove every service entry of the container.
    fn deregister(&self, id: &str) -> Result<(), RegistryError>;

    /// Suppress the container's entries from routing.
    fn enable_maintenance(&self, id: &str, reason: &str) -> Result<(), RegistryError>;

    fn disable_maintenance(&self, id: &str) -> Result<(), RegistryError>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegistryEntry {
    pub address: String,
    pub service: ServiceDef,
    pub registered_at: String,
}

/// Point-in-time copy of a [`MemoryRegistry`].
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegistrySnapshot {
    /// container id -> service name -> entry
    pub services: BTreeMap<String, BTreeMap<String, RegistryEntry>>,
    /// container id -> maintenance reason
    pub maintenance: BTreeMap<String, String>,
}

impl RegistrySnapshot {
    pub fn from_bytes(data: &[u8]) -> Result<Self, RegistryError> {
        serde_json::from_slice(data)
            .map_err(|e| RegistryError::Serialization(format!("invalid registry snapshot: {e}")))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, RegistryError> {
        serde_json::to_vec_pretty(self).map_err(|e| RegistryError::Serialization(e.to_string()))
    }
}

/// In-process registrar. Safe to share across containers.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    state: Mutex<RegistrySnapshot>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: RegistrySnapshot) -> Self {
        Self {
            state: Mutex::new(snapshot),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, RegistrySnapshot>, RegistryError> {
        self.state
            .lock()
            .map_err(|e| RegistryError::Unavailable(format!("mutex poisoned: {e}")))
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        self.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn entry(&self, id: &str, name: &str) -> Option<RegistryEntry> {
        self.lock()
            .ok()?
            .services
            .get(id)
            .and_then(|services| services.get(name))
            .cloned()
    }

    pub fn service_names(&self, id: &str) -> Vec<String> {
        self.lock()
            .ok()
            .and_then(|s| s.services.get(id).map(|m| m.keys().cloned().collect()))
            .unwrap_or_default()
    }

    pub fn maintenance_reason(&self, id: &str) -> Option<String> {
        self.lock().ok()?.maintenance.get(id).cloned()
    }

    pub fn in_maintenance(&self, id: &str) -> bool {
        self.maintenance_reason(id).is_some()
    }
}

impl Registrar for MemoryRegistry {
    fn register(
        &self,
        id: &str,
        name: &str,
        address: &str,
        service: &ServiceDef,
    ) -> Result<(), RegistryError> {
        if address.is_empty() {
            return Err(RegistryError::Rejected {
                container: id.to_owned(),
                service: name.to_owned(),
                reason: "empty address".to_owned(),
            });
        }
        let entry = RegistryEntry {
            address: address.to_owned(),
            service: service.clone(),
            registered_at: chrono::Utc::now().to_rfc3339(),
        };
        self.lock()?
            .services
            .entry(id.to_owned())
            .or_default()
            .insert(name.to_owned(), entry);
        Ok(())
    }

    fn deregister(&self, id: &str) -> Result<(), RegistryError> {
        let mut state = self.lock()?;
        state.services.remove(id);
        state.maintenance.remove(id);
        Ok(())
    }

    fn enable_maintenance(&self, id: &str, reason: &str) -> Result<(), RegistryError> {
        self.lock()?
            .maintenance
            .insert(id.to_owned(), reason.to_owned());
        Ok(())
    }

    fn disable_maintenance(&self, id: &str) -> Result<(), RegistryError> {
        self.lock()?.maintenance.remove(id);
        Ok(())
    }
}
