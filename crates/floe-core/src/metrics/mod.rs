//! Metrics and observability infrastructure.
//!
//! - `events`: shared internal event types and the `InternalEvent` trait
//! - `server`: Prometheus recorder and HTTP scrape endpoint

pub mod events;
pub mod server;

pub use server::{init_global, init_test, MetricsController, DEFAULT_METRICS_ADDR};

/// Macro for emitting metric events.
///
/// Calls `InternalEvent::emit()` on the given event, which records the
/// corresponding Prometheus metric.
///
/// # Example
///
/// ```ignore
/// use floe_core::metrics::events::StorageRequest;
///
/// emit!(StorageRequest { operation, status });
/// ```
#[macro_export]
macro_rules! emit {
    ($event:expr) => {
        $crate::metrics::events::InternalEvent::emit($event)
    };
}

pub use emit;
