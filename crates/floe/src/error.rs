//! Error taxonomy for the replication pipeline.
//!
//! Three families of failure:
//! - transient errors, absorbed by retry policies;
//! - conflicts (dataset or bucket already exists), swallowed at the call
//!   site;
//! - fatal errors, which stop the pipeline: they latch into the consumer
//!   and re-throw from every subsequent public call.
//!
//! Cleanup failures (blob deletes, staging table drops, table status
//! updates) are logged and never surfaced.

use snafu::prelude::*;

// Re-export common errors
pub use floe_core::error::{ConfigError, StorageError};

use crate::context::ContextError;
use crate::warehouse::WarehouseError;

/// Errors that can occur while encoding or writing a batch blob.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum BlobError {
    /// Failed to build the Avro schema for a shard.
    #[snafu(display("Failed to build Avro schema: {source}"))]
    AvroSchema { source: apache_avro::Error },

    /// Failed to encode rows as Avro.
    #[snafu(display("Failed to encode batch as Avro: {source}"))]
    AvroEncode { source: apache_avro::Error },

    /// Failed to encode rows as JSON.
    #[snafu(display("Failed to encode batch as JSON: {source}"))]
    JsonEncode { source: serde_json::Error },

    /// A row value does not match the shard schema.
    #[snafu(display("Value for column '{column}' does not match its declared type: {message}"))]
    ValueMismatch { column: String, message: String },

    /// Failed to write the blob object.
    #[snafu(display("Failed to write batch object: {source}"))]
    Write { source: StorageError },
}

/// Top-level pipeline errors.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ReplicationError {
    /// Storage error.
    #[snafu(display("Storage error: {source}"))]
    Storage { source: StorageError },

    /// Warehouse error.
    #[snafu(display("Warehouse error: {source}"))]
    Warehouse { source: WarehouseError },

    /// Blob encoding or write error.
    #[snafu(display("Batch write error: {source}"))]
    Blob { source: BlobError },

    /// State store serialization error.
    #[snafu(display("Failed to decode persisted state for '{key}': {source}"))]
    StateDecode {
        key: String,
        source: serde_json::Error,
    },

    /// Host context operation failed.
    #[snafu(display("Host context error: {source}"))]
    Context { source: ContextError },

    /// A table has no primary key.
    #[snafu(display(
        "Table '{table}' in database '{database}' has no primary key. \
         Tables without a primary key are not supported."
    ))]
    NoPrimaryKey { database: String, table: String },

    /// Primary key state was lost.
    #[snafu(display(
        "Primary key information for table '{table}' in dataset '{dataset}' could not be found. \
         This can only happen if state was corrupted. \
         Please create a new replicator and start again."
    ))]
    MissingPrimaryKeyState { dataset: String, table: String },

    /// Drops require manual intervention.
    #[snafu(display(
        "Encountered an event to drop {object} '{name}', but the target is configured to \
         require manual drops. Please manually drop the {object} to make progress."
    ))]
    ManualDropRequired { object: String, name: String },

    /// The warehouse rejected an operation as semantically invalid.
    #[snafu(display("Non-recoverable error applying '{operation}': {source}"))]
    InvalidOperation {
        operation: String,
        source: WarehouseError,
    },

    /// A retried operation ran out of budget.
    #[snafu(display("{message}"))]
    RetriesExhausted {
        message: String,
        source: WarehouseError,
    },

    /// Startup wiring failed: missing project, unreachable bucket, bad
    /// credentials.
    #[snafu(display("{message}"))]
    Setup { message: String },

    /// Shutdown was requested mid-operation.
    #[snafu(display("Operation cancelled by shutdown"))]
    Cancelled,

    /// A scheduled flush failed earlier; the pipeline is stopped.
    #[snafu(display("A scheduled flush failed: {message}"))]
    FlushFailed { message: String },

    /// Task join error.
    #[snafu(display("Task join error: {source}"))]
    TaskJoin { source: tokio::task::JoinError },

    /// Offset commit ran out of retries.
    #[snafu(display("Failed to commit offset: {message}"))]
    CommitOffset { message: String },
}

impl ReplicationError {
    /// Whether this error stops the pipeline rather than the current
    /// attempt. Fatal errors latch into the consumer.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ReplicationError::NoPrimaryKey { .. }
                | ReplicationError::MissingPrimaryKeyState { .. }
                | ReplicationError::ManualDropRequired { .. }
                | ReplicationError::InvalidOperation { .. }
                | ReplicationError::RetriesExhausted { .. }
                | ReplicationError::FlushFailed { .. }
                | ReplicationError::CommitOffset { .. }
                | ReplicationError::Setup { .. }
        )
    }
}

impl From<StorageError> for ReplicationError {
    fn from(source: StorageError) -> Self {
        ReplicationError::Storage { source }
    }
}

impl From<WarehouseError> for ReplicationError {
    fn from(source: WarehouseError) -> Self {
        ReplicationError::Warehouse { source }
    }
}

impl From<BlobError> for ReplicationError {
    fn from(source: BlobError) -> Self {
        ReplicationError::Blob { source }
    }
}

impl From<ContextError> for ReplicationError {
    fn from(source: ContextError) -> Self {
        ReplicationError::Context { source }
    }
}
