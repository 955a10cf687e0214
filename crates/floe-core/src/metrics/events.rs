//! Shared internal events for metrics emission.
//!
//! Each event struct represents a measurable occurrence. Events implement
//! the `InternalEvent` trait which emits the corresponding Prometheus
//! metric. Pipeline-specific events live in the `floe` crate; this module
//! holds only the storage-level events emitted by `floe-core` itself.

use metrics::{counter, histogram};
use std::time::Duration;
use tracing::trace;

/// Trait for internal events that can be emitted as metrics.
pub trait InternalEvent {
    /// Emit this event as a metric.
    fn emit(self);
}

/// The kind of storage operation performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageOperation {
    Get,
    Put,
    Delete,
    List,
}

impl StorageOperation {
    fn as_str(&self) -> &'static str {
        match self {
            StorageOperation::Get => "get",
            StorageOperation::Put => "put",
            StorageOperation::Delete => "delete",
            StorageOperation::List => "list",
        }
    }
}

/// Whether a request succeeded or failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    Success,
    Error,
}

impl RequestStatus {
    fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Success => "success",
            RequestStatus::Error => "error",
        }
    }
}

/// Event emitted for every storage request.
pub struct StorageRequest {
    pub operation: StorageOperation,
    pub status: RequestStatus,
}

impl InternalEvent for StorageRequest {
    fn emit(self) {
        counter!(
            "floe_storage_requests_total",
            "operation" => self.operation.as_str(),
            "status" => self.status.as_str(),
        )
        .increment(1);
    }
}

/// Event emitted with the duration of a storage request.
pub struct StorageRequestDuration {
    pub operation: StorageOperation,
    pub duration: Duration,
}

impl InternalEvent for StorageRequestDuration {
    fn emit(self) {
        trace!(
            operation = self.operation.as_str(),
            duration_ms = self.duration.as_millis() as u64,
            "Storage request finished"
        );
        histogram!(
            "floe_storage_request_duration_seconds",
            "operation" => self.operation.as_str(),
        )
        .record(self.duration.as_secs_f64());
    }
}
