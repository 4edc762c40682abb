//! # dayflow-sync: Sync Engine for Dayflow
//!
//! This crate keeps the local store of every device and one shared remote
//! tree consistent, offline first: local writes never wait for the network.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Sync Engine Architecture                         │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                 AutoSyncEngine (Main Orchestrator)               │  │
//! │  │                                                                  │  │
//! │  │  Store observers ──► outbound worker ──► push                   │  │
//! │  │  Listeners       ──► inbound worker  ──► resolve ──► apply      │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               │                                         │
//! │         ┌─────────────────────┼─────────────────────┐                  │
//! │         ▼                     ▼                     ▼                   │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────────────┐    │
//! │  │   SyncCore     │  │  RetryQueue    │  │  ListenerRegistry      │    │
//! │  │                │  │                │  │                        │    │
//! │  │ push/pull/     │  │ 2s, 4s, 8s     │  │ one remote listener    │    │
//! │  │ subscribe,     │  │ then parked,   │  │ per (path, range),     │    │
//! │  │ hash elision,  │  │ retry_now,     │  │ refcounted consumers   │    │
//! │  │ backfill       │  │ dismiss, drain │  │                        │    │
//! │  └────────────────┘  └────────────────┘  └────────────────────────┘    │
//! │                                                                         │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────────────┐    │
//! │  │   ItemSync     │  │ RemoteStore    │  │  Relay server          │    │
//! │  │ row-level push │  │ MemoryRemote,  │  │  axum /ws over a       │    │
//! │  │ and tombstones │  │ WsRemote       │  │  MemoryRemote tree     │    │
//! │  └────────────────┘  └────────────────┘  └────────────────────────┘    │
//! │                                                                         │
//! │  DIAGNOSTICS: SyncLog (bounded, persisted), RemoteMetrics, events      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! ### Engine
//! - [`engine`] - `AutoSyncEngine` orchestrator
//! - [`config`] - Sync configuration (collections, retry, remote)
//! - [`error`] - Sync error types
//! - [`events`] - Status and failure events
//!
//! ### Sync Primitives
//! - [`context`] - State shared by every sync component
//! - [`sync_core`] - Strategy-driven push, pull, subscribe and backfill
//! - [`item_sync`] - Row-level sync
//! - [`strategy`] - Per-collection strategies
//! - [`retry`] - Retry queue with bounded backoff
//! - [`registry`] - Refcounted listener registry
//!
//! ### Remote
//! - [`remote`] - Remote store contract, in-memory and WebSocket remotes
//! - [`protocol`] - Relay wire frames
//! - [`relay`] - WebSocket relay server
//!
//! ### Diagnostics
//! - [`device`] - Device identity
//! - [`sync_log`] - Bounded sync history
//! - [`metrics`] - Per-path remote metrics
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use dayflow_db::MemoryStore;
//! use dayflow_sync::{AutoSyncEngine, MemoryRemote, SyncConfig};
//!
//! let engine = AutoSyncEngine::builder(SyncConfig::load_or_default(None))
//!     .with_local_store(Arc::new(MemoryStore::new()))
//!     .with_remote(Arc::new(MemoryRemote::new()))
//!     .build()
//!     .await?;
//!
//! engine.initialize().await?;
//! engine.start_listening().await?;
//!
//! let status = engine.status();
//! println!("Listening: {}", status.listening);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

// Engine
pub mod config;
pub mod engine;
pub mod error;
pub mod events;

// Sync primitives
pub mod context;
pub mod item_sync;
pub mod registry;
pub mod retry;
pub mod strategy;
pub mod sync_core;

// Remote
pub mod protocol;
pub mod relay;
pub mod remote;

// Diagnostics
pub mod device;
pub mod metrics;
pub mod sync_log;

// =============================================================================
// Re-exports
// =============================================================================

// Engine types
pub use config::{CollectionSpec, Granularity, SyncConfig};
pub use engine::{AutoSyncEngine, AutoSyncEngineBuilder};
pub use error::{SyncError, SyncResult};
pub use events::{NoOpEmitter, SyncEventEmitter, SyncFailure, SyncStatus};

// Sync primitives
pub use context::SyncContext;
pub use item_sync::{BatchSyncResult, ItemSync, ItemSyncResult};
pub use registry::{ListenerHandle, ListenerKey, ListenerRegistry};
pub use retry::{DrainSummary, RetryOutcome, RetryQueue, RetryQueueEntry};
pub use strategy::{ItemSyncStrategy, JsonStrategy, SerdeItemStrategy, SerdeStrategy, SyncStrategy};
pub use sync_core::{PushOutcome, SyncCore};

// Remote types
pub use protocol::RelayMessage;
pub use relay::{RelayConfig, RelayHandle, RelayServer};
pub use remote::ws::ConnectionState;
pub use remote::{MemoryRemote, RemoteStore, WsRemote, WsRemoteConfig};

// Diagnostics
pub use device::DeviceIdentity;
pub use metrics::{PathMetrics, RemoteMetrics};
pub use sync_log::{LogAction, LogSource, SyncLog, SyncLogEntry};
