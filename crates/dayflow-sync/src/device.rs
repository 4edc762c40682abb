//! # Device Identity
//!
//! Stable per-installation identifier stamped on every envelope.
//!
//! ```text
//! first launch:  systemState/deviceId absent ──► "device-{uuid v4}" ──► persisted
//! later:         systemState/deviceId present ──► reused
//! ```
//!
//! Once loaded, the id is held in memory and read synchronously.

use std::sync::Arc;

use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use dayflow_core::{DEVICE_ID_KEY, SYSTEM_COLLECTION};
use dayflow_db::LocalStore;

use crate::error::{SyncError, SyncResult};

/// Loaded device identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    id: Arc<str>,
}

impl DeviceIdentity {
    /// Uses a fixed id (config pin or tests).
    pub fn fixed(id: impl Into<String>) -> SyncResult<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(SyncError::MissingDeviceId);
        }
        Ok(DeviceIdentity { id: id.into() })
    }

    /// Reads the persisted id, creating and persisting a new one if absent.
    pub async fn load_or_create(store: &dyn LocalStore) -> SyncResult<Self> {
        match store.get(SYSTEM_COLLECTION, DEVICE_ID_KEY).await? {
            Some(Value::String(id)) if !id.is_empty() => {
                info!(device_id = %id, "Loaded device identity");
                return Ok(DeviceIdentity { id: id.into() });
            }
            Some(other) => {
                warn!(value = %other, "Stored device id is unusable, generating a new one");
            }
            None => {}
        }

        let id = generate_device_id();
        store
            .put(SYSTEM_COLLECTION, DEVICE_ID_KEY, Value::String(id.clone()))
            .await?;
        info!(device_id = %id, "Created device identity");
        Ok(DeviceIdentity { id: id.into() })
    }

    /// The device id.
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl std::fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.id)
    }
}

fn generate_device_id() -> String {
    format!("device-{}", Uuid::new_v4())
}
