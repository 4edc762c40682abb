//! # dayflow-core: Pure Sync Primitives for Dayflow
//!
//! This crate holds the parts of the sync core that must behave identically
//! on every device: envelope construction, fingerprinting, remote path
//! layout and conflict resolution. It has zero I/O dependencies.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Dayflow Sync Architecture                        │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                    Application (UI, stores)                     │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │ local writes                           │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │           dayflow-sync (engine, retry, registry)                │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ dayflow-core (THIS CRATE) ★                     │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌───────────┐  │   │
//! │  │   │ envelope  │  │   paths   │  │ conflict  │  │   types   │  │   │
//! │  │   │ hash,     │  │ users/{u} │  │ LWW, row  │  │ Task,     │  │   │
//! │  │   │ clock     │  │ /{coll}   │  │ merge     │  │ Progress  │  │   │
//! │  │   └───────────┘  └───────────┘  └───────────┘  └───────────┘  │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK • PURE FUNCTIONS           │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`envelope`] - `SyncEnvelope`, fingerprints, timestamp source
//! - [`paths`] - Remote path construction and segment validation
//! - [`conflict`] - LWW and entity-specific mergers
//! - [`types`] - Row shapes the mergers understand
//! - [`error`] - Domain error types
//!
//! ## Example Usage
//!
//! ```rust
//! use dayflow_core::conflict::resolve_conflict_lww;
//! use dayflow_core::envelope::RawEnvelope;
//! use serde_json::json;
//!
//! let ours = RawEnvelope::at(Some(json!({"text": "old"})), "device-b", 90);
//! let theirs = RawEnvelope::at(Some(json!({"text": "buy milk"})), "device-a", 100);
//!
//! let winner = resolve_conflict_lww(Some(&ours), Some(&theirs)).unwrap();
//! assert_eq!(winner.data, Some(json!({"text": "buy milk"})));
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod conflict;
pub mod envelope;
pub mod error;
pub mod paths;
pub mod types;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use conflict::{ConflictPolicy, Resolution, Side};
pub use envelope::{data_hash, now_millis, RawEnvelope, SyncEnvelope};
pub use error::{CoreError, CoreResult, ValidationError};
pub use paths::{remote_path, DEFAULT_USER_ID};
pub use types::*;

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Local-store collection reserved for engine bookkeeping.
///
/// Never observed and never synchronized.
pub const SYSTEM_COLLECTION: &str = "systemState";

/// Key under which the installation's device id is persisted.
pub const DEVICE_ID_KEY: &str = "deviceId";

/// Key under which the sync log ring is persisted.
pub const SYNC_LOG_KEY: &str = "syncLogs";
