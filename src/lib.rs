//! # Record Sync
//!
//! A local-first document store kept in sync with many unreliable external
//! sources.
//!
//! Records carry typed relationships, can be grouped into ordered
//! collections, and may hold an embedding vector for similarity search.
//! Source adapters stream items in; the sync engine diffs them against what
//! is stored, applies adds and updates in batches, and advances a durable
//! per-source checkpoint only after each batch has been written.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────┐   ┌───────────┐
//! │  Adapters   │──▶│ Sync engine  │──▶│   Store   │
//! │ filesystem  │   │ diff + apply │   │ SQLite/mem│
//! └─────────────┘   └──────┬───────┘   └─────┬─────┘
//!                          │                 │
//!                   checkpoints,       records, edges,
//!                   sync leases        collections
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! recsync init                     # create database
//! recsync sync filesystem:notes    # incremental sync of one source
//! recsync sync all --full          # rescan every configured source
//! recsync list --source filesystem:notes
//! recsync checkpoint show filesystem:notes
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`models`] | Records, relationships, provenance |
//! | [`metadata`] | Ordered custom metadata map |
//! | [`store`] | Storage trait with in-memory and SQLite backends |
//! | [`records`] | Upserts, relationships, traversal, tombstones |
//! | [`collections`] | Ordered collections with header records |
//! | [`adapter`] | Source adapter trait and registry |
//! | [`source_fs`] | Filesystem adapter |
//! | [`checkpoint`] | Durable per-source sync checkpoints |
//! | [`lock`] | Single-flight sync leases |
//! | [`engine`] | Batched diff/apply sync engine |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema creation |
//! | [`error`] | Library error types |

pub mod adapter;
pub mod checkpoint;
pub mod collections;
pub mod config;
pub mod db;
pub mod embed_cmd;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod get;
pub mod ingest;
pub mod lock;
pub mod metadata;
pub mod migrate;
pub mod models;
pub mod records;
pub mod source_fs;
pub mod sources;
pub mod store;
