//! Windowed full reconciliation of one sub-resource.
//!
//! Both sides are listed in identity order. A source page fixes the upper edge
//! of a window, the destination is then paged up to that edge and every page is
//! compared against the source records it covers. Records not yet covered are
//! carried to the next destination page, never further than the window.

use core::future::Future;
use core::mem;

use cmdb_transfer_primitives::{ResType, SyncRole};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::RetryConfig;
use crate::error::SyncError;
use crate::logics::Reconciler;
use crate::metrics::Reporter;
use crate::types::{CompareResult, IdMarks, IdentifiedRecord, ListWindow, SyncProgress, TenantPair};

/// What a full sync of one resource type wrote to the destination.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub struct FullSyncReport {
    pub sub_resources: usize,
    pub windows: usize,
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
}

impl FullSyncReport {
    pub(crate) fn merge(&mut self, other: Self) {
        self.sub_resources = self.sub_resources.saturating_add(other.sub_resources);
        self.windows = self.windows.saturating_add(other.windows);
        self.inserted = self.inserted.saturating_add(other.inserted);
        self.updated = self.updated.saturating_add(other.updated);
        self.deleted = self.deleted.saturating_add(other.deleted);
    }
}

/// Runs `op` until it succeeds, fails permanently or used up its retries.
pub(crate) async fn with_retries<T, F, Fut>(
    retry: &RetryConfig,
    res_type: ResType,
    step: &str,
    mut op: F,
) -> Result<T, SyncError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SyncError>>,
{
    let mut attempt: u32 = 0;

    loop {
        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(err) if !err.is_transient() => return Err(err),
            Err(err) => err,
        };

        if attempt >= retry.max_retries {
            return Err(SyncError::RetriesExhausted {
                res_type,
                attempts: attempt.saturating_add(1),
                source: Box::new(err),
            });
        }

        let delay = retry.backoff(attempt);
        warn!(%res_type, step, attempt, ?delay, %err, "Transient failure, retrying");

        time::sleep(delay).await;
        attempt = attempt.saturating_add(1);
    }
}

/// Makes the destination rows of `sub_res` match the source for one tenant pair.
///
/// `cancel` is checked before every window; a window that was started is
/// always applied in full.
pub(crate) async fn sync_sub_resource(
    reconciler: &Reconciler,
    tenants: &TenantPair,
    sub_res: &str,
    retry: &RetryConfig,
    reporter: &Reporter,
    cancel: &CancellationToken,
) -> Result<FullSyncReport, SyncError> {
    let res_type = reconciler.res_type();
    let id_field = reconciler.descriptor().id_field();

    let mut report = FullSyncReport {
        sub_resources: 1,
        ..FullSyncReport::default()
    };

    let mut src_start = IdMarks::new();
    let mut src_exhausted = false;
    let mut dest_start = IdMarks::new();
    // upper edge of the open window, empty once the source is exhausted
    let mut edge = IdMarks::new();
    let mut window_open = false;
    let mut carried: Vec<IdentifiedRecord> = Vec::new();

    info!(%res_type, tenant = %tenants.src, sub_res, "Starting full sync");

    loop {
        if !window_open && src_exhausted {
            break;
        }

        if cancel.is_cancelled() {
            info!(
                %res_type,
                tenant = %tenants.src,
                sub_res,
                windows = report.windows,
                "Full sync cancelled"
            );
            return Err(SyncError::Cancelled(res_type));
        }

        if !window_open {
            let window = &ListWindow::new(sub_res).after(src_start.clone());
            let page = with_retries(retry, res_type, "list source", move || {
                reconciler.list_page(SyncRole::Src, &tenants.src, window)
            })
            .await?;

            src_exhausted = page.is_all;
            edge = if page.is_all {
                IdMarks::new()
            } else {
                page.next_start.clone()
            };
            if !page.next_start.is_empty() {
                src_start = page.next_start;
            }

            carried.extend(reconciler.to_records(SyncRole::Src, tenants, sub_res, page.data));
            window_open = true;
        }

        let window = &ListWindow::new(sub_res)
            .after(dest_start.clone())
            .until(edge.clone());
        let page = with_retries(retry, res_type, "list destination", move || {
            reconciler.list_page(SyncRole::Dest, &tenants.dest, window)
        })
        .await?;

        let dest = reconciler.to_records(SyncRole::Dest, tenants, sub_res, page.data);
        let result = reconciler.compare(
            mem::take(&mut carried),
            dest,
            page.is_all,
            &page.next_start,
        );
        let CompareResult {
            insert,
            update,
            delete,
            remaining_src,
        } = result;
        carried = remaining_src;

        let (insert, update, delete) = (&insert, &update, &delete);
        let (inserted, updated, deleted) = with_retries(retry, res_type, "apply", move || {
            apply(reconciler, &tenants.dest, sub_res, insert, update, delete)
        })
        .await?;

        if page.is_all {
            dest_start = edge.clone();
            window_open = false;
        } else {
            dest_start = page.next_start;
        }

        report.windows = report.windows.saturating_add(1);
        report.inserted = report.inserted.saturating_add(inserted);
        report.updated = report.updated.saturating_add(updated);
        report.deleted = report.deleted.saturating_add(deleted);

        reporter.metrics().record_window(res_type);
        reporter
            .metrics()
            .record_applied(res_type, inserted, updated, deleted);
        reporter.progress(SyncProgress::Window {
            res_type,
            tenant: tenants.src.clone(),
            sub_res: sub_res.to_owned(),
            cursor: dest_start.clone(),
            inserted,
            updated,
            deleted,
        });

        debug!(
            %res_type,
            sub_res,
            id_field,
            cursor = ?dest_start,
            inserted,
            updated,
            deleted,
            carried = carried.len(),
            "Applied full sync window"
        );
    }

    reporter.progress(SyncProgress::FullSyncDone {
        res_type,
        tenant: tenants.src.clone(),
        sub_res: sub_res.to_owned(),
    });

    info!(
        %res_type,
        tenant = %tenants.src,
        sub_res,
        windows = report.windows,
        inserted = report.inserted,
        updated = report.updated,
        deleted = report.deleted,
        "Finished full sync"
    );

    Ok(report)
}

async fn apply(
    reconciler: &Reconciler,
    dest_tenant: &str,
    sub_res: &str,
    insert: &[IdentifiedRecord],
    update: &[IdentifiedRecord],
    delete: &[i64],
) -> Result<(usize, usize, usize), SyncError> {
    let inserted = reconciler
        .insert(dest_tenant, sub_res, insert.to_vec())
        .await?;
    let updated = reconciler
        .update(dest_tenant, sub_res, update.to_vec())
        .await?;
    let deleted = reconciler.delete(dest_tenant, sub_res, delete).await?;

    Ok((inserted, updated, deleted))
}
