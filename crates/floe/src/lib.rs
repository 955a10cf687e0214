//! Floe: replay-safe CDC replication into BigQuery.
//!
//! Applies an ordered stream of row-level change events into BigQuery in
//! three steps:
//! 1. Batches of changes are written to a GCS staging bucket, one object
//!    per table and batch.
//! 2. Each object is loaded into a staging table clustered on `_batch_id`
//!    (snapshot batches load straight into the target).
//! 3. A MERGE query reconciles the staged batch into the target table.
//!
//! Deterministic job ids and a `_sequence_num` high-water mark make every
//! step safe to replay, so the pipeline tolerates at-least-once delivery
//! and crashes between any two steps.

pub mod config;
pub mod consumer;
pub mod context;
pub mod ddl;
pub mod error;
pub mod event;
pub mod load;
pub mod merge;
pub mod metrics;
pub mod names;
pub mod schema;
pub mod state;
pub mod target;
pub mod warehouse;
pub mod writer;

// Re-export commonly used items
pub use config::Config;
pub use consumer::EventConsumer;
pub use error::ReplicationError;
pub use event::{ChangeEvent, DdlEvent, DmlEvent, Offset, SourceProperties};
pub use target::BigQueryTarget;

// Re-export from floe-core
pub use floe_core::{StorageProvider, StorageProviderRef};
