//! Observability for terrace.
//!
//! Provides tracing initialization and metric recording helpers. Metrics go
//! through the `metrics` facade; wiring an exporter is the embedding
//! process's job.

use crate::error::{EngineError, Result};
use metrics::{counter, gauge};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize logging for the embedding process.
///
/// `log_level` is an `EnvFilter` directive used when `RUST_LOG` is unset.
pub fn init(log_level: &str, json_logs: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if json_logs {
        subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| EngineError::Internal(format!("failed to init logging: {}", e)))?;
    } else {
        subscriber
            .with(fmt::layer())
            .try_init()
            .map_err(|e| EngineError::Internal(format!("failed to init logging: {}", e)))?;
    }

    Ok(())
}

/// Register engine metrics at their zero values.
pub fn register_metrics() {
    gauge!("terrace_last_applied_index").set(0.0);
    gauge!("terrace_pending_applies").set(0.0);
    counter!("terrace_applies_total").absolute(0);
    counter!("terrace_redeliveries_total").absolute(0);
    counter!("terrace_reads_total").absolute(0);
    counter!("terrace_delayed_reads_total").absolute(0);
    counter!("terrace_execute_errors_total").absolute(0);
    counter!("terrace_cancelled_waiters_total").absolute(0);
    counter!("terrace_snapshots_created_total").absolute(0);
    counter!("terrace_snapshots_deleted_total").absolute(0);
}

/// Record one applied entry and the new applied index.
pub(crate) fn record_apply(index: u64) {
    counter!("terrace_applies_total").increment(1);
    gauge!("terrace_last_applied_index").set(index as f64);
}

/// Record a duplicate apply delivery.
pub(crate) fn record_redelivery() {
    counter!("terrace_redeliveries_total").increment(1);
}

/// Record an immediate read execution.
pub(crate) fn record_read() {
    counter!("terrace_reads_total").increment(1);
}

/// Record delayed reads drained after an apply.
pub(crate) fn record_delayed_reads(count: usize) {
    counter!("terrace_delayed_reads_total").increment(count as u64);
}

/// Record a failed host-function invocation.
pub(crate) fn record_execute_error() {
    counter!("terrace_execute_errors_total").increment(1);
}

/// Record waiters resolved with `NotLeader`.
pub(crate) fn record_cancelled_waiters(count: usize) {
    counter!("terrace_cancelled_waiters_total").increment(count as u64);
}

/// Record a created snapshot.
pub(crate) fn record_snapshot_created() {
    counter!("terrace_snapshots_created_total").increment(1);
}

/// Record a deleted snapshot directory.
pub(crate) fn record_snapshot_deleted() {
    counter!("terrace_snapshots_deleted_total").increment(1);
}

/// Track the number of registered-but-unapplied commit promises.
pub(crate) fn set_pending_applies(count: usize) {
    gauge!("terrace_pending_applies").set(count as f64);
}
