//! Prometheus metrics of the transfer engine.
//!
//! - `transfer_rows_inserted{res_type}`: destination rows inserted
//! - `transfer_rows_updated{res_type}`: destination rows replaced
//! - `transfer_rows_deleted{res_type}`: destination rows deleted
//! - `transfer_events_received{res_type}`: source change events read
//! - `transfer_events_dropped{res_type}`: events excluded by the metadata oracle
//! - `transfer_full_sync_windows{res_type}`: full sync windows applied
//! - `transfer_batch_duration_seconds{res_type}`: time to apply one incremental batch

use std::sync::Arc;

use cmdb_transfer_primitives::ResType;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;
use tokio::sync::broadcast;

use crate::types::SyncProgress;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ResTypeLabels {
    res_type: String,
}

impl From<ResType> for ResTypeLabels {
    fn from(res_type: ResType) -> Self {
        Self {
            res_type: res_type.to_string(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct TransferMetrics {
    rows_inserted: Family<ResTypeLabels, Counter>,
    rows_updated: Family<ResTypeLabels, Counter>,
    rows_deleted: Family<ResTypeLabels, Counter>,
    events_received: Family<ResTypeLabels, Counter>,
    events_dropped: Family<ResTypeLabels, Counter>,
    full_sync_windows: Family<ResTypeLabels, Counter>,
    batch_duration_seconds: Family<ResTypeLabels, Histogram>,
}

impl Default for TransferMetrics {
    fn default() -> Self {
        Self {
            rows_inserted: Family::default(),
            rows_updated: Family::default(),
            rows_deleted: Family::default(),
            events_received: Family::default(),
            events_dropped: Family::default(),
            full_sync_windows: Family::default(),
            // 1ms to ~16s
            batch_duration_seconds: Family::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.001, 2.0, 15))
            }),
        }
    }
}

impl TransferMetrics {
    /// Creates the metrics and registers them under the `transfer` prefix.
    pub fn new(registry: &mut Registry) -> Self {
        let metrics = Self::default();
        let registry = registry.sub_registry_with_prefix("transfer");

        registry.register(
            "rows_inserted",
            "Destination rows inserted",
            metrics.rows_inserted.clone(),
        );
        registry.register(
            "rows_updated",
            "Destination rows replaced with the source version",
            metrics.rows_updated.clone(),
        );
        registry.register(
            "rows_deleted",
            "Destination rows deleted",
            metrics.rows_deleted.clone(),
        );
        registry.register(
            "events_received",
            "Source change events read from the change stream",
            metrics.events_received.clone(),
        );
        registry.register(
            "events_dropped",
            "Source change events excluded from replication",
            metrics.events_dropped.clone(),
        );
        registry.register(
            "full_sync_windows",
            "Full sync windows compared and applied",
            metrics.full_sync_windows.clone(),
        );
        registry.register(
            "batch_duration_seconds",
            "Time to apply one incremental batch in seconds",
            metrics.batch_duration_seconds.clone(),
        );

        metrics
    }

    pub fn record_applied(&self, res_type: ResType, inserted: usize, updated: usize, deleted: usize) {
        let labels = ResTypeLabels::from(res_type);

        let _ignored = self.rows_inserted.get_or_create(&labels).inc_by(to_u64(inserted));
        let _ignored = self.rows_updated.get_or_create(&labels).inc_by(to_u64(updated));
        let _ignored = self.rows_deleted.get_or_create(&labels).inc_by(to_u64(deleted));
    }

    pub fn record_window(&self, res_type: ResType) {
        let _ignored = self
            .full_sync_windows
            .get_or_create(&ResTypeLabels::from(res_type))
            .inc();
    }

    pub fn record_events(&self, res_type: ResType, received: usize, dropped: usize) {
        let labels = ResTypeLabels::from(res_type);

        let _ignored = self.events_received.get_or_create(&labels).inc_by(to_u64(received));
        let _ignored = self.events_dropped.get_or_create(&labels).inc_by(to_u64(dropped));
    }

    pub fn observe_batch(&self, res_type: ResType, seconds: f64) {
        self.batch_duration_seconds
            .get_or_create(&ResTypeLabels::from(res_type))
            .observe(seconds);
    }
}

fn to_u64(n: usize) -> u64 {
    u64::try_from(n).unwrap_or(u64::MAX)
}

/// Where full and incremental sync report what they did.
#[derive(Clone, Debug)]
pub(crate) struct Reporter {
    progress: broadcast::Sender<SyncProgress>,
    metrics: Arc<TransferMetrics>,
}

impl Reporter {
    pub(crate) const fn new(
        progress: broadcast::Sender<SyncProgress>,
        metrics: Arc<TransferMetrics>,
    ) -> Self {
        Self { progress, metrics }
    }

    pub(crate) fn with_metrics(&self, metrics: Arc<TransferMetrics>) -> Self {
        Self {
            progress: self.progress.clone(),
            metrics,
        }
    }

    pub(crate) fn metrics(&self) -> &TransferMetrics {
        &self.metrics
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<SyncProgress> {
        self.progress.subscribe()
    }

    /// Broadcasts `progress`, nobody listening is fine.
    pub(crate) fn progress(&self, progress: SyncProgress) {
        let _ignored = self.progress.send(progress);
    }
}
