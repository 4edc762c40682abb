//! # dayflow-db: Local Store for Dayflow
//!
//! This crate provides the local persistent store the sync engine observes.
//! It exposes a keyed put/get/delete contract with before-commit observers,
//! and ships two implementations: SQLite (via sqlx) and in-memory.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Dayflow Data Flow                                │
//! │                                                                         │
//! │  Application write (save template, complete task)                      │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     dayflow-db (THIS CRATE)                     │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐    ┌───────────────┐    ┌──────────────┐  │   │
//! │  │   │  LocalStore   │    │ ObserverSet   │    │  Backends    │  │   │
//! │  │   │  (store.rs)   │    │               │    │              │  │   │
//! │  │   │ put/get/      │───►│ before_create │    │ SqliteStore  │  │   │
//! │  │   │ delete/list   │    │ before_update │    │ MemoryStore  │  │   │
//! │  │   │               │    │ before_delete │    │              │  │   │
//! │  │   └───────────────┘    └───────┬───────┘    └──────────────┘  │   │
//! │  │                                │ PostCommit                    │   │
//! │  └────────────────────────────────┼────────────────────────────────┘   │
//! │                                   ▼                                     │
//! │                      dayflow-sync AutoSyncEngine                        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`store`] - `LocalStore` trait, observers, post-commit callbacks
//! - [`memory`] - In-memory implementation
//! - [`sqlite`] - SQLite implementation
//! - [`pool`] - Connection pool creation and configuration
//! - [`migrations`] - Embedded database migrations
//! - [`repository`] - SQL for records and system state
//! - [`error`] - Store error types
//!
//! ## Usage
//!
//! ```rust,ignore
//! use dayflow_db::{DbConfig, LocalStore, SqliteStore};
//!
//! let store = SqliteStore::open(DbConfig::new("path/to/dayflow.db")).await?;
//! store.put("templates", "tpl-1", json!({"name": "Morning"})).await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod memory;
pub mod migrations;
pub mod pool;
pub mod repository;
pub mod sqlite;
pub mod store;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{DbError, DbResult};
pub use memory::MemoryStore;
pub use pool::{Database, DbConfig};
pub use sqlite::SqliteStore;
pub use store::{LocalStore, ObserverSet, PostCommit, StoreObserver};
