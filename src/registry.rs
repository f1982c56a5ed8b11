//! Process-wide device registry.
//!
//! Discovery bookkeeping only: attached cameras are announced here so UIs
//! and tools can enumerate them. The registry is append/remove-only and
//! never sits on the protocol hot path, so a plain `RwLock` is enough.

use std::sync::RwLock;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

/// One attached camera, as seen by discovery.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceEntry {
    pub id: Uuid,
    /// Human-readable model name.
    pub name: String,
    /// Transport identity, e.g. a serial path or "sim".
    pub transport: String,
    pub registered_at: DateTime<Utc>,
}

static REGISTRY: Lazy<RwLock<Vec<DeviceEntry>>> = Lazy::new(|| RwLock::new(Vec::new()));

fn registry_write() -> std::sync::RwLockWriteGuard<'static, Vec<DeviceEntry>> {
    match REGISTRY.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Announce an attached camera. Returns its registry id.
pub fn register(name: impl Into<String>, transport: impl Into<String>) -> Uuid {
    let entry = DeviceEntry {
        id: Uuid::new_v4(),
        name: name.into(),
        transport: transport.into(),
        registered_at: Utc::now(),
    };
    info!(id = %entry.id, name = %entry.name, transport = %entry.transport, "device registered");
    let id = entry.id;
    registry_write().push(entry);
    id
}

/// Remove a camera. Returns whether it was present.
pub fn unregister(id: Uuid) -> bool {
    let mut devices = registry_write();
    let before = devices.len();
    devices.retain(|entry| entry.id != id);
    let removed = devices.len() < before;
    if removed {
        info!(%id, "device unregistered");
    }
    removed
}

/// Snapshot of the attached cameras.
pub fn devices() -> Vec<DeviceEntry> {
    match REGISTRY.read() {
        Ok(guard) => guard.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_unregister() {
        let id = register("SXVF-H9", "sim");
        assert!(devices().iter().any(|entry| entry.id == id));
        assert!(unregister(id));
        assert!(!unregister(id));
        assert!(devices().iter().all(|entry| entry.id != id));
    }
}
