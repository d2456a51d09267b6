//! The sync supervisor.

use std::collections::BTreeMap;
use std::sync::Arc;

use cmdb_store::Store;
use cmdb_transfer_primitives::common::BK_INNER_OBJ_ID_HOST;
use cmdb_transfer_primitives::{ResType, SyncRole};
use prometheus_client::registry::Registry;
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::{RetryConfig, TransferConfig};
use crate::descriptor::{builtin_descriptors, ResourceDescriptor};
use crate::env::Environment;
use crate::error::SyncError;
use crate::full_sync::{sync_sub_resource, with_retries, FullSyncReport};
use crate::id_rule::IdRuleFilter;
use crate::logics::Reconciler;
use crate::metadata::Metadata;
use crate::metrics::{Reporter, TransferMetrics};
use crate::types::{SyncProgress, TenantPair};
use crate::watch::{TokenHandler, Watcher};

const PROGRESS_CAPACITY: usize = 256;

/// Keeps a destination environment consistent with a source environment.
///
/// Resource types are registered with a [`ResourceDescriptor`] and then synced
/// in bulk with [`start_full_sync`](Self::start_full_sync) or followed live
/// with [`start_incremental_sync`](Self::start_incremental_sync).
#[derive(Debug)]
pub struct TransferEngine {
    config: TransferConfig,
    src: Arc<Metadata>,
    dest: Arc<Metadata>,
    id_rules: Arc<IdRuleFilter>,
    token_store: Store,
    reconcilers: BTreeMap<ResType, Arc<Reconciler>>,
    reporter: Reporter,
}

impl TransferEngine {
    /// Loads the exclusion metadata of every mapped tenant on both sides.
    pub async fn new(
        config: TransferConfig,
        src: Environment,
        dest: Environment,
    ) -> Result<Self, SyncError> {
        if config.tenant_map.is_empty() {
            return Err(SyncError::Metadata("no source tenant is mapped".to_owned()));
        }

        let token_store = dest.store.clone();

        let src = Metadata::load(
            SyncRole::Src,
            src,
            config.tenant_map.keys().map(String::as_str),
        )
        .await?;
        let dest = Metadata::load(
            SyncRole::Dest,
            dest,
            config.tenant_map.values().map(String::as_str),
        )
        .await?;

        let (progress, _) = broadcast::channel(PROGRESS_CAPACITY);

        info!(
            name = %config.name,
            src = %src.env().name,
            dest = %dest.env().name,
            tenants = config.tenant_map.len(),
            "Transfer engine ready"
        );

        Ok(Self {
            id_rules: Arc::new(IdRuleFilter::new(config.id_rules.clone())),
            config,
            src: Arc::new(src),
            dest: Arc::new(dest),
            token_store,
            reconcilers: BTreeMap::new(),
            reporter: Reporter::new(progress, Arc::new(TransferMetrics::default())),
        })
    }

    /// Exposes the engine's metrics through `registry`.
    #[must_use]
    pub fn with_metrics(mut self, registry: &mut Registry) -> Self {
        self.reporter = self
            .reporter
            .with_metrics(Arc::new(TransferMetrics::new(registry)));
        self
    }

    /// Persists watch positions in `store` instead of the destination.
    #[must_use]
    pub fn with_token_store(mut self, store: Store) -> Self {
        self.token_store = store;
        self
    }

    /// Registers a resource type, replacing an earlier registration of the same type.
    pub fn register(&mut self, descriptor: Box<dyn ResourceDescriptor>) {
        let res_type = descriptor.res_type();

        let reconciler = Reconciler::new(
            descriptor,
            Arc::clone(&self.src),
            Arc::clone(&self.dest),
            Arc::clone(&self.id_rules),
            self.config.sync.page_size,
        );

        if self
            .reconcilers
            .insert(res_type, Arc::new(reconciler))
            .is_some()
        {
            info!(%res_type, "Replaced resource type registration");
        }
    }

    /// Registers every built-in resource type.
    pub fn register_defaults(&mut self) {
        for descriptor in builtin_descriptors() {
            self.register(descriptor);
        }
    }

    #[must_use]
    pub fn registered(&self) -> Vec<ResType> {
        self.reconcilers.keys().copied().collect()
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SyncProgress> {
        self.reporter.subscribe()
    }

    fn tenant_pairs(&self) -> Vec<TenantPair> {
        self.config
            .tenant_map
            .iter()
            .map(|(src, dest)| TenantPair::new(src.clone(), dest.clone()))
            .collect()
    }

    /// Fully reconciles each of `res_types`, at most `max_concurrent` at a time.
    ///
    /// Every requested type gets its own result, a failing type does not stop the others.
    /// Once `cancel` fires, each type stops after its current window and reports
    /// [`SyncError::Cancelled`].
    pub async fn start_full_sync(
        &self,
        res_types: &[ResType],
        cancel: &CancellationToken,
    ) -> Vec<(ResType, Result<FullSyncReport, SyncError>)> {
        let permits = Arc::new(Semaphore::new(self.config.sync.max_concurrent.max(1)));
        let mut tasks = JoinSet::new();
        let mut results = Vec::with_capacity(res_types.len());

        for res_type in dedup(res_types) {
            let Some(reconciler) = self.reconcilers.get(&res_type) else {
                results.push((res_type, Err(SyncError::UnknownResType(res_type))));
                continue;
            };

            let job = FullSyncJob {
                reconciler: Arc::clone(reconciler),
                tenants: self.tenant_pairs(),
                retry: self.config.sync.retry,
                reporter: self.reporter.clone(),
                cancel: cancel.child_token(),
            };
            let permits = Arc::clone(&permits);
            let waiting = cancel.child_token();

            let _ignored = tasks.spawn(async move {
                let result = tokio::select! {
                    biased;
                    () = waiting.cancelled() => Err(SyncError::Cancelled(res_type)),
                    permit = permits.acquire_owned() => match permit {
                        Ok(_permit) => job.run().await,
                        Err(err) => Err(SyncError::Task(err.to_string())),
                    },
                };

                (res_type, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(err) => error!(%err, "Full sync task did not complete"),
            }
        }

        // tasks that panicked or were aborted left no result
        for res_type in dedup(res_types) {
            if !results.iter().any(|(done, _)| *done == res_type) {
                results.push((
                    res_type,
                    Err(SyncError::Task("full sync task did not complete".to_owned())),
                ));
            }
        }

        results.sort_by_key(|(res_type, _)| res_types.iter().position(|r| r == res_type));

        results
    }

    /// Starts one watcher per resource type.
    ///
    /// Unregistered types are reported by [`IncrementalSyncHandle::join`].
    #[must_use]
    pub fn start_incremental_sync(&self, res_types: &[ResType]) -> IncrementalSyncHandle {
        let cancel = CancellationToken::new();
        let reconcilers = Arc::new(self.reconcilers.clone());
        let tenants = Arc::new(self.config.tenant_map.clone());

        let mut tasks = JoinSet::new();
        let mut rejected = Vec::new();

        for res_type in dedup(res_types) {
            let Some(reconciler) = self.reconcilers.get(&res_type) else {
                rejected.push((res_type, Err(SyncError::UnknownResType(res_type))));
                continue;
            };

            let watcher = Watcher::new(
                Arc::clone(reconciler),
                Arc::clone(&reconcilers),
                Arc::clone(&tenants),
                TokenHandler::new(self.token_store.clone(), &self.config.name, res_type),
                self.config.sync,
                self.reporter.clone(),
                cancel.child_token(),
            );

            let _ignored = tasks.spawn(async move { (res_type, watcher.run().await) });
        }

        info!(watchers = tasks.len(), "Started incremental sync");

        IncrementalSyncHandle {
            cancel,
            tasks,
            rejected,
        }
    }
}

fn dedup(res_types: &[ResType]) -> Vec<ResType> {
    let mut seen = Vec::with_capacity(res_types.len());

    for res_type in res_types {
        if !seen.contains(res_type) {
            seen.push(*res_type);
        }
    }

    seen
}

/// Everything a full sync task of one resource type needs.
#[derive(Debug)]
struct FullSyncJob {
    reconciler: Arc<Reconciler>,
    tenants: Vec<TenantPair>,
    retry: RetryConfig,
    reporter: Reporter,
    cancel: CancellationToken,
}

impl FullSyncJob {
    async fn run(self) -> Result<FullSyncReport, SyncError> {
        let res_type = self.reconciler.res_type();
        let mut report = FullSyncReport::default();
        let mut failure = None;

        for tenants in &self.tenants {
            let sub_resources = match self.sub_resources(&tenants.src).await {
                Ok(sub_resources) => sub_resources,
                Err(err) => {
                    error!(%res_type, tenant = %tenants.src, %err, "Failed to list sub-resources");
                    let _ignored = failure.get_or_insert(err);
                    continue;
                }
            };

            for sub_res in &sub_resources {
                match sync_sub_resource(
                    &self.reconciler,
                    tenants,
                    sub_res,
                    &self.retry,
                    &self.reporter,
                    &self.cancel,
                )
                .await
                {
                    Ok(done) => report.merge(done),
                    Err(err @ SyncError::Cancelled(_)) => return Err(err),
                    Err(err) => {
                        error!(%res_type, tenant = %tenants.src, sub_res, %err, "Full sync failed");
                        let _ignored = failure.get_or_insert(err);
                    }
                }
            }
        }

        match failure {
            Some(err) => Err(err),
            None => Ok(report),
        }
    }

    /// Sub-resources of the resource type in a source tenant.
    async fn sub_resources(&self, tenant: &str) -> Result<Vec<String>, SyncError> {
        let res_type = self.reconciler.res_type();

        if !res_type.has_sub_resource() {
            return Ok(vec![String::new()]);
        }

        let metadata = self.reconciler.metadata(SyncRole::Src);
        let ids = with_retries(&self.retry, res_type, "list objects", move || {
            metadata.common_object_ids(tenant)
        })
        .await?;

        Ok(match res_type {
            ResType::QuotedInstance => ids.quoted,
            ResType::InstAsst => {
                let mut objects = ids.objects;
                objects.push(BK_INNER_OBJ_ID_HOST.to_owned());
                objects
            }
            _ => ids.objects,
        })
    }
}

/// Running watchers started by [`TransferEngine::start_incremental_sync`].
#[derive(Debug)]
pub struct IncrementalSyncHandle {
    cancel: CancellationToken,
    tasks: JoinSet<(ResType, Result<(), SyncError>)>,
    rejected: Vec<(ResType, Result<(), SyncError>)>,
}

impl IncrementalSyncHandle {
    /// Asks every watcher to stop after its current batch.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Waits for every watcher to end, returning how each of them ended.
    pub async fn join(mut self) -> Vec<(ResType, Result<(), SyncError>)> {
        let mut results = self.rejected;

        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(err) => error!(%err, "Watcher task did not complete"),
            }
        }

        results
    }
}
