//! sharegrid-storage: the storage-server side of a share upload.
//!
//! Defines the capability-set interface ([`StorageServer`]) that the
//! placement engine consumes, the identity types shared by both sides,
//! and an in-memory server used by the command-line grid simulator and
//! by tests.
//!
//! # Architecture
//!
//! ```text
//! StorageServer (trait)
//!   ├── query_held_shares   → HeldShares
//!   ├── allocate_buckets    → Allocation (already_held, allocated)
//!   ├── write_share / close_share / read_share
//!   └── abort               → release unwritten buckets
//!
//! MemoryStorageServer
//!   ├── per-storage-index buckets (open or closed)
//!   ├── capacity accounting (optionally overcommitting)
//!   └── availability switch (online, offline, hanging)
//! ```

pub mod error;
pub mod memory;
pub mod server;
pub mod types;

pub use error::{StorageError, StorageResult};
pub use memory::{Availability, CallCounts, MemoryStorageServer};
pub use server::StorageServer;
pub use types::*;
