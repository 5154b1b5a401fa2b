//! # ragsync
//!
//! Keeps a partitioned vector index and a relational document store
//! consistent for a multi-tenant retrieval-augmented generation backend.
//!
//! Three components cooperate around one guarantee: a write becomes
//! searchable within a bounded delay, and a failed write leaves neither
//! store holding half of it.
//!
//! ```text
//!             ┌────────────────┐   rows    ┌──────────────┐
//!  insert ───▶│ SagaCoordinator│──────────▶│  relational  │
//!  delete     └──────┬─────────┘           └──────────────┘
//!                    │ vectors                    ▲
//!                    ▼                            │ join
//!  ┌────────────────────┐  load/release  ┌────────┴─────┐
//!  │  PartitionCache    │───────────────▶│ vector store │◀── search
//!  └────────────────────┘                └──────────────┘
//!                    ▲ mark dirty               ▲ flush
//!                    └───── FlushBatcher ───────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`sqlite_store`] | SQLite document store |
//! | [`sqlite_kv`] | SQLite key-value store with TTL |
//! | [`retry`] | Exponential backoff for transient failures |
//! | [`shutdown`] | Cancellation signal for background loops |
//! | [`memory`] | Host memory probe |
//! | [`partition_state`] | Durable partition tracking records |
//! | [`partition_cache`] | Singleflight loading and eviction |
//! | [`flush`] | Debounced per-collection flushing |
//! | [`embedding`] | Embedding clients and batching |
//! | [`saga`] | Compensated inserts and ordered deletes |
//! | [`search`] | Query path |
//! | [`provision`] | Collections and bot registration |
//! | [`service`] | Wiring and start/stop lifecycle |
//! | [`stats`] | CLI reports |
//!
//! Storage traits and shared types live in the `ragsync-core` crate.

pub mod config;
pub mod db;
pub mod embedding;
pub mod flush;
pub mod memory;
pub mod migrate;
pub mod partition_cache;
pub mod partition_state;
pub mod provision;
pub mod retry;
pub mod saga;
pub mod search;
pub mod service;
pub mod shutdown;
pub mod sqlite_kv;
pub mod sqlite_store;
pub mod stats;
