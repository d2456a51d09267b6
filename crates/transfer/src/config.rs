//! Runtime configuration of the transfer engine.

use std::collections::BTreeMap;

use cmdb_transfer_primitives::common::BK_MAX_LIMIT_SIZE;
use cmdb_transfer_primitives::IdRuleMap;
use tokio::time;

/// Default number of rows fetched by one list query.
pub const DEFAULT_PAGE_SIZE: usize = BK_MAX_LIMIT_SIZE;

/// Default number of change events read per incremental batch.
pub const DEFAULT_BATCH_SIZE: usize = BK_MAX_LIMIT_SIZE;

/// Default number of sub-resources synchronized at the same time by a full sync.
pub const DEFAULT_MAX_CONCURRENT: usize = 5;

/// Default wait before polling an idle change stream again (1 second).
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;

/// Default number of retries of a failing full sync step.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default wait before the first retry (1 second).
pub const DEFAULT_RETRY_DELAY_MS: u64 = 1_000;

/// Default upper bound of the exponential retry backoff (1 minute).
pub const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 60_000;

#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct TransferConfig {
    /// Name of the transfer job, part of every persisted resume cursor.
    pub name: String,

    /// Source tenant -> destination tenant.
    pub tenant_map: BTreeMap<String, String>,

    pub sync: SyncConfig,

    pub id_rules: IdRuleMap,
}

impl TransferConfig {
    #[must_use]
    pub const fn new(
        name: String,
        tenant_map: BTreeMap<String, String>,
        sync: SyncConfig,
        id_rules: IdRuleMap,
    ) -> Self {
        Self {
            name,
            tenant_map,
            sync,
            id_rules,
        }
    }
}

#[derive(Copy, Clone, Debug)]
pub struct SyncConfig {
    /// Rows per list query
    pub page_size: usize,

    /// Change events per incremental batch
    pub batch_size: usize,

    /// Concurrent full sync tasks
    pub max_concurrent: usize,

    /// Wait before polling an idle change stream again
    pub poll_interval: time::Duration,

    pub retry: RetryConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            batch_size: DEFAULT_BATCH_SIZE,
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            poll_interval: time::Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Copy, Clone, Debug)]
pub struct RetryConfig {
    /// Retries of a full sync step before the sub-resource fails.
    ///
    /// Incremental batches retry without limit.
    pub max_retries: u32,

    pub delay: time::Duration,

    pub max_delay: time::Duration,
}

impl RetryConfig {
    /// Exponential backoff before the given retry, starting at `delay` and capped at `max_delay`.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> time::Duration {
        let factor = 2_u32.saturating_pow(attempt.min(16));

        self.delay.saturating_mul(factor).min(self.max_delay)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            delay: time::Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
            max_delay: time::Duration::from_millis(DEFAULT_RETRY_MAX_DELAY_MS),
        }
    }
}
