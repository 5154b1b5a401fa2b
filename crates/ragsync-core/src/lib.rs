//! # ragsync core
//!
//! Runtime-agnostic building blocks shared by the ragsync service: the
//! error taxonomy, data models, the store traits the service is written
//! against, metadata allow-list filtering, naming rules, and in-memory
//! reference stores.
//!
//! This crate contains no tokio, sqlx, or network dependencies. Every
//! backend trait is `async` via `async-trait` so native and in-memory
//! implementations plug in behind the same seams.

pub mod clock;
pub mod embedding;
pub mod error;
pub mod kv;
pub mod metadata;
pub mod models;
pub mod naming;
pub mod store;
pub mod vector;

pub use error::{ErrorKind, Result, SyncError};
