//! Incremental sync: follows the source change stream of one resource type.

use core::future::Future;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use cmdb_store::{ChangeEvent, CollectionFilter, OperationType};
use cmdb_transfer_primitives::{split_tenant_table, tenant_table, EventType, ResType, SyncRole};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::SyncConfig;
use crate::descriptor::Collection;
use crate::error::SyncError;
use crate::logics::Reconciler;
use crate::metadata::MembershipUndo;
use crate::metrics::Reporter;
use crate::types::{IdentifiedRecord, SyncEvent, SyncProgress, TenantPair};

mod aggregate;
mod token;

pub use aggregate::aggregate;
pub use token::{TokenHandler, WatchCursor};

/// Consecutive records of one batch applied with a single call.
#[derive(Debug)]
struct ApplyGroup {
    tenants: TenantPair,
    res_type: ResType,
    sub_res: String,
    upsert: bool,
    records: Vec<IdentifiedRecord>,
}

impl ApplyGroup {
    fn accepts(&self, tenants: &TenantPair, res_type: ResType, sub_res: &str, upsert: bool) -> bool {
        self.upsert == upsert
            && self.res_type == res_type
            && self.sub_res == sub_res
            && self.tenants == *tenants
    }
}

#[derive(Debug)]
pub(crate) struct Watcher {
    reconciler: Arc<Reconciler>,
    /// Every registered reconciler, translated events may change resource type.
    reconcilers: Arc<BTreeMap<ResType, Arc<Reconciler>>>,
    /// source tenant -> destination tenant
    tenants: Arc<BTreeMap<String, String>>,
    tokens: TokenHandler,
    sync: SyncConfig,
    reporter: Reporter,
    cancel: CancellationToken,
}

impl Watcher {
    pub(crate) const fn new(
        reconciler: Arc<Reconciler>,
        reconcilers: Arc<BTreeMap<ResType, Arc<Reconciler>>>,
        tenants: Arc<BTreeMap<String, String>>,
        tokens: TokenHandler,
        sync: SyncConfig,
        reporter: Reporter,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            reconciler,
            reconcilers,
            tenants,
            tokens,
            sync,
            reporter,
            cancel,
        }
    }

    fn collections(&self) -> CollectionFilter {
        let collection = self.reconciler.descriptor().collection();

        self.tenants
            .keys()
            .fold(CollectionFilter::new(), |filter, tenant| match collection {
                Collection::Fixed(table) => filter.name(tenant_table(tenant, table)),
                Collection::PerObject(prefix) => filter.prefix(tenant_table(tenant, prefix)),
            })
    }

    /// Runs until cancelled or a batch fails permanently.
    ///
    /// Cancellation is observed between batches only.
    pub(crate) async fn run(self) -> Result<(), SyncError> {
        let res_type = self.reconciler.res_type();
        let collections = self.collections();
        let store = &self.reconciler.metadata(SyncRole::Src).env().store;
        let tokens = &self.tokens;

        let mut cursor = tokio::select! {
            () = self.cancel.cancelled() => return Ok(()),
            loaded = self.until_done("load token", move || tokens.load()) => loaded?,
        };

        info!(%res_type, key = %tokens.key(), token = ?cursor.token, "Started watching");

        while !self.cancel.is_cancelled() {
            let events = match store
                .read_changes(&collections, cursor.token.as_ref(), self.sync.batch_size)
                .await
            {
                Ok(events) => events,
                Err(err) if err.is_transient() => {
                    warn!(%res_type, %err, "Failed to read changes, retrying");
                    if !self.idle(self.sync.retry.delay).await {
                        break;
                    }
                    continue;
                }
                Err(err) => return Err(err.into()),
            };

            let Some(last) = events.last().map(|event| event.token.clone()) else {
                if !self.idle(self.sync.poll_interval).await {
                    break;
                }
                continue;
            };

            let started = Instant::now();
            let received = events.len();

            let mut undo = MembershipUndo::default();
            let (groups, dropped) = self.translate(aggregate(events), &mut undo).await;

            let this = &self;
            let groups = &groups;
            if let Err(err) = self.until_done("apply", move || this.apply(groups)).await {
                // the batch is read again on restart and must translate the same way
                self.reconciler.metadata(SyncRole::Src).rollback(undo);
                return Err(err);
            }

            let next = cursor.advance(last.clone());
            let saved = &next;
            self.until_done("save token", move || tokens.save(saved)).await?;
            cursor = next;

            self.reporter.metrics().record_events(res_type, received, dropped);
            self.reporter
                .metrics()
                .observe_batch(res_type, started.elapsed().as_secs_f64());
            self.reporter.progress(SyncProgress::Batch {
                res_type,
                token: last.clone(),
                events: received,
            });

            debug!(%res_type, received, dropped, token = %last, "Applied batch");
        }

        info!(%res_type, "Stopped watching");

        Ok(())
    }

    /// Waits for `duration`, returns `false` if cancelled meanwhile.
    async fn idle(&self, duration: time::Duration) -> bool {
        tokio::select! {
            () = self.cancel.cancelled() => false,
            () = time::sleep(duration) => true,
        }
    }

    /// Retries `op` with backoff for as long as it fails transiently.
    ///
    /// Cancellation is not observed here: once a batch was read it is applied
    /// and its token saved before the watcher stops.
    async fn until_done<T, F, Fut>(&self, step: &str, mut op: F) -> Result<T, SyncError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SyncError>>,
    {
        let res_type = self.reconciler.res_type();
        let mut attempt: u32 = 0;

        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() => {
                    let delay = self.sync.retry.backoff(attempt);
                    warn!(%res_type, step, attempt, ?delay, %err, "Transient failure, retrying batch");

                    time::sleep(delay).await;
                    attempt = attempt.saturating_add(1);
                }
                Err(err) => {
                    error!(%res_type, step, %err, "Watch failed permanently");
                    return Err(err);
                }
            }
        }
    }

    /// Scopes and normalises an aggregated batch, coalescing it into apply groups.
    ///
    /// Returns the groups and the number of events that were dropped.
    async fn translate(
        &self,
        events: Vec<ChangeEvent>,
        undo: &mut MembershipUndo,
    ) -> (Vec<ApplyGroup>, usize) {
        let mut groups: Vec<ApplyGroup> = Vec::new();
        let mut dropped: usize = 0;

        for event in events {
            let Some(event) = self.to_sync_event(event).await else {
                dropped = dropped.saturating_add(1);
                continue;
            };

            let Some(event) = self
                .reconciler
                .metadata(SyncRole::Src)
                .filter_or_translate(event, undo)
                .await
            else {
                dropped = dropped.saturating_add(1);
                continue;
            };

            let Some(reconciler) = self.reconcilers.get(&event.res_type) else {
                warn!(res_type = %event.res_type, "No reconciler for translated event, dropping");
                dropped = dropped.saturating_add(1);
                continue;
            };

            let Some(dest) = self.tenants.get(&event.tenant) else {
                dropped = dropped.saturating_add(1);
                continue;
            };
            let tenants = TenantPair::new(event.tenant.clone(), dest.clone());
            let upsert = event.event_type.is_upsert();

            for sub_res in &event.sub_res {
                let records = reconciler.to_records(
                    SyncRole::Src,
                    &tenants,
                    sub_res,
                    vec![event.detail.clone()],
                );

                match groups.last_mut() {
                    Some(group) if group.accepts(&tenants, event.res_type, sub_res, upsert) => {
                        group.records.extend(records);
                    }
                    _ => groups.push(ApplyGroup {
                        tenants: tenants.clone(),
                        res_type: event.res_type,
                        sub_res: sub_res.clone(),
                        upsert,
                        records,
                    }),
                }
            }
        }

        groups.retain(|group| !group.records.is_empty());

        (groups, dropped)
    }

    async fn to_sync_event(&self, event: ChangeEvent) -> Option<SyncEvent> {
        let res_type = self.reconciler.res_type();

        let Some((tenant, table)) = split_tenant_table(&event.collection) else {
            warn!(%res_type, collection = %event.collection, "Unexpected collection name, dropping event");
            return None;
        };

        if !self.tenants.contains_key(tenant) {
            debug!(%res_type, %tenant, "Event of an unmapped tenant, dropping");
            return None;
        }

        let sub_res = match self.reconciler.descriptor().event_sub_resources(&event.document) {
            Some(sub_res) => sub_res,
            None => match self
                .reconciler
                .object_of_table(SyncRole::Src, tenant, table)
                .await
            {
                Ok(Some(object)) => vec![object],
                Ok(None) => {
                    warn!(%res_type, %tenant, %table, "No object owns the table, dropping event");
                    return None;
                }
                Err(err) => {
                    error!(%res_type, %tenant, %table, %err, "Failed to resolve the table's object, dropping event");
                    return None;
                }
            },
        };

        let event_type = match event.operation {
            OperationType::Insert => EventType::Create,
            OperationType::Update => EventType::Update,
            OperationType::Delete => EventType::Delete,
        };

        Some(
            SyncEvent::new(
                event_type,
                res_type,
                tenant.to_owned(),
                event.oid,
                event.document,
            )
            .with_sub_res(sub_res),
        )
    }

    async fn apply(&self, groups: &[ApplyGroup]) -> Result<(), SyncError> {
        for group in groups {
            let Some(reconciler) = self.reconcilers.get(&group.res_type) else {
                return Err(SyncError::UnknownResType(group.res_type));
            };
            let dest = &group.tenants.dest;
            let records = group.records.clone();

            let (inserted, updated, deleted) = if group.upsert {
                let (insert, update) = reconciler
                    .classify_upsert(dest, &group.sub_res, records)
                    .await?;

                let inserted = reconciler.insert(dest, &group.sub_res, insert).await?;
                let updated = reconciler.update(dest, &group.sub_res, update).await?;

                (inserted, updated, 0)
            } else {
                let ids: Vec<i64> = records.iter().map(|record| record.id).collect();

                (0, 0, reconciler.delete(dest, &group.sub_res, &ids).await?)
            };

            self.reporter
                .metrics()
                .record_applied(group.res_type, inserted, updated, deleted);
        }

        Ok(())
    }
}
