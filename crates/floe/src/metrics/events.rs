//! Internal events for pipeline metrics emission.
//!
//! Each event struct represents a measurable occurrence in the pipeline.
//! Events implement the `InternalEvent` trait which emits the
//! corresponding Prometheus metric, labeled by table for multi-table
//! observability.

use metrics::{counter, gauge, histogram};
use std::time::Duration;
use tracing::trace;

pub use floe_core::metrics::events::InternalEvent;

/// Event emitted when a change event is accepted by the consumer.
pub struct EventReceived {
    pub operation: &'static str,
}

impl InternalEvent for EventReceived {
    fn emit(self) {
        counter!("floe_events_received_total", "operation" => self.operation).increment(1);
    }
}

/// Event emitted when a batch object is written to the staging bucket.
pub struct BlobWritten {
    pub table: String,
    pub bytes: usize,
    pub events: usize,
}

impl InternalEvent for BlobWritten {
    fn emit(self) {
        trace!(table = %self.table, bytes = self.bytes, events = self.events, "Blob written");
        counter!("floe_blobs_written_total", "table" => self.table.clone()).increment(1);
        counter!("floe_blob_bytes_written_total", "table" => self.table.clone())
            .increment(self.bytes as u64);
        counter!("floe_events_staged_total", "table" => self.table).increment(self.events as u64);
    }
}

/// Event emitted when a load job completes.
pub struct LoadCompleted {
    pub table: String,
    pub duration: Duration,
}

impl InternalEvent for LoadCompleted {
    fn emit(self) {
        trace!(table = %self.table, duration_ms = self.duration.as_millis() as u64, "Load completed");
        histogram!("floe_load_duration_seconds", "table" => self.table)
            .record(self.duration.as_secs_f64());
    }
}

/// Event emitted when a merge job completes.
pub struct MergeCompleted {
    pub table: String,
    pub duration: Duration,
}

impl InternalEvent for MergeCompleted {
    fn emit(self) {
        trace!(table = %self.table, duration_ms = self.duration.as_millis() as u64, "Merge completed");
        histogram!("floe_merge_duration_seconds", "table" => self.table)
            .record(self.duration.as_secs_f64());
    }
}

/// Event emitted when a full flush cycle finishes.
pub struct FlushCompleted {
    pub tables: usize,
    pub duration: Duration,
}

impl InternalEvent for FlushCompleted {
    fn emit(self) {
        trace!(tables = self.tables, duration_ms = self.duration.as_millis() as u64, "Flush completed");
        counter!("floe_flushes_total").increment(1);
        histogram!("floe_flush_duration_seconds").record(self.duration.as_secs_f64());
        gauge!("floe_flush_tables").set(self.tables as f64);
    }
}

/// Event emitted when a flush fails and latches the pipeline error.
pub struct FlushFailed;

impl InternalEvent for FlushFailed {
    fn emit(self) {
        counter!("floe_flush_failures_total").increment(1);
    }
}

/// Event emitted after a successful offset commit.
pub struct OffsetCommitted {
    pub sequence_number: i64,
}

impl InternalEvent for OffsetCommitted {
    fn emit(self) {
        trace!(sequence_number = self.sequence_number, "Offset committed");
        gauge!("floe_committed_sequence_number").set(self.sequence_number as f64);
    }
}
