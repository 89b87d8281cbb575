//! # RowSync Engine
//!
//! Client-side mirror of a remote relational table.
//!
//! This crate provides:
//! - Ordered row cache with snapshot subscribers
//! - Paginated initial load
//! - Push event reconciliation with in-process relevance checks
//! - Optimistic writes with reference-counted rollback
//! - Remote backend abstraction and an in-memory backend
//!
//! ## Architecture
//!
//! A [`TableSync`] owns one table's cache and write log:
//! 1. Open the push channel (events buffer while loading)
//! 2. Load every scoped row page by page
//! 3. Apply push events, evicting rows that drift out of the conditions
//! 4. Apply local mutations, optimistically or after remote confirmation
//!
//! ## Key Invariants
//!
//! - A row is cached only while it satisfies the table's conditions
//! - Re-upserting a cached identity never moves it
//! - Subscribers see every snapshot, in mutation order
//! - An echo of a write still in flight never overwrites the local value
//! - A failed optimistic write restores the pre-attempt row

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod backup;
mod cache;
mod config;
mod error;
mod fetcher;
mod memory;
mod table;

pub use backend::{ChannelSpec, PageWindow, PushChannel, PushSender, RemoteBackend, ScopedQuery};
pub use backup::{BackupTicket, PessimisticWriteLog, Rollback, Settlement};
pub use cache::{RowCache, Snapshot, Subscription};
pub use config::{TableConfig, DEFAULT_PAGE_SIZE};
pub use error::{SyncError, SyncResult};
pub use fetcher::{LoadReport, PageFetcher};
pub use memory::MemoryBackend;
pub use table::{MutationOutcome, PushOutcome, TableState, TableStats, TableSync};
