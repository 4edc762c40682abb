//! # Repository Module
//!
//! SQL access for the SQLite store.
//!
//! ```text
//! SqliteStore (LocalStore impl, observers)
//!      │
//!      ├── RecordRepository      → records(collection, key, value)
//!      └── SystemStateRepository → system_state(key, value)
//! ```
//!
//! Values are stored as JSON text; repositories never interpret them.

pub mod record;
pub mod system;

pub use record::RecordRepository;
pub use system::SystemStateRepository;
