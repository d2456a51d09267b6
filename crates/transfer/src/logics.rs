//! The resource-type agnostic diff and apply engine.
//!
//! A [`Reconciler`] pairs one [`ResourceDescriptor`] with the metadata of both
//! environments. Full sync and incremental sync drive the same reconciler, so
//! both paths write the destination the same way.

use core::fmt;
use core::time::Duration;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use cmdb_store::document::{get_i64, get_str, value_as_i64};
use cmdb_store::{Document, Filter, Query, WriteOp};
use cmdb_transfer_primitives::common::{
    BK_INST_ID_FIELD, BK_OBJ_ID_FIELD, BK_OBJ_UUID_FIELD, BK_TABLE_NAME_OBJECT_BASE_MAPPING,
    BK_TABLE_NAME_OBJ_DES, MONGO_META_ID, TENANT_ID_FIELD,
};
use cmdb_transfer_primitives::{tenant_table, ResType, SyncRole};
use dashmap::{DashMap, DashSet};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, error};

use crate::descriptor::{Collection, InnerIdRemap, ResourceDescriptor};
use crate::error::SyncError;
use crate::id_rule::IdRuleFilter;
use crate::metadata::Metadata;
use crate::types::{CompareResult, IdMarks, IdentifiedRecord, ListResult, ListWindow, TenantPair};

/// How long a resolved object uuid is trusted before it is looked up again.
///
/// Objects that are deleted and created again come back under a new uuid.
pub const OBJECT_UUID_TTL: Duration = Duration::from_secs(60);

pub struct Reconciler {
    descriptor: Box<dyn ResourceDescriptor>,
    src: Arc<Metadata>,
    dest: Arc<Metadata>,
    id_rules: Arc<IdRuleFilter>,
    page_size: usize,
    /// (role, tenant, object id) -> object uuid and when it was resolved
    uuids: DashMap<(SyncRole, String, String), (String, Instant)>,
    /// destination tables whose identity field is known to be unique
    indexed: DashSet<String>,
}

impl fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reconciler")
            .field("res_type", &self.res_type())
            .field("page_size", &self.page_size)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    #[must_use]
    pub fn new(
        descriptor: Box<dyn ResourceDescriptor>,
        src: Arc<Metadata>,
        dest: Arc<Metadata>,
        id_rules: Arc<IdRuleFilter>,
        page_size: usize,
    ) -> Self {
        Self {
            descriptor,
            src,
            dest,
            id_rules,
            page_size: page_size.max(1),
            uuids: DashMap::new(),
            indexed: DashSet::new(),
        }
    }

    #[must_use]
    pub fn res_type(&self) -> ResType {
        self.descriptor.res_type()
    }

    #[must_use]
    pub fn descriptor(&self) -> &dyn ResourceDescriptor {
        &*self.descriptor
    }

    #[must_use]
    pub fn metadata(&self, role: SyncRole) -> &Metadata {
        match role {
            SyncRole::Src => &self.src,
            SyncRole::Dest => &self.dest,
        }
    }

    /// Physical table holding the rows of `sub_res` for `tenant` on the given side.
    pub async fn table(
        &self,
        role: SyncRole,
        tenant: &str,
        sub_res: &str,
    ) -> Result<String, SyncError> {
        let prefix = match self.descriptor.collection() {
            Collection::Fixed(table) => return Ok(tenant_table(tenant, table)),
            Collection::PerObject(prefix) => prefix,
        };

        let key = (role, tenant.to_owned(), sub_res.to_owned());
        let cached = self
            .uuids
            .get(&key)
            .filter(|entry| entry.value().1.elapsed() < OBJECT_UUID_TTL)
            .map(|entry| entry.value().0.clone());
        if let Some(uuid) = cached {
            return Ok(tenant_table(tenant, &format!("{prefix}{uuid}")));
        }

        let object = self
            .metadata(role)
            .env()
            .store
            .find_one(
                &tenant_table(tenant, BK_TABLE_NAME_OBJ_DES),
                &Filter::eq(BK_OBJ_ID_FIELD, sub_res),
            )
            .await?;

        let Some(uuid) = object
            .as_ref()
            .and_then(|object| get_str(object, BK_OBJ_UUID_FIELD))
        else {
            let _ignored = self.uuids.remove(&key);

            return Err(SyncError::TableNotFound {
                res_type: self.res_type(),
                sub_res: sub_res.to_owned(),
            });
        };

        let table = tenant_table(tenant, &format!("{prefix}{uuid}"));
        let _ignored = self.uuids.insert(key, (uuid.to_owned(), Instant::now()));

        Ok(table)
    }

    /// Object id owning a per-object table, given the table's logical name.
    pub async fn object_of_table(
        &self,
        role: SyncRole,
        tenant: &str,
        table: &str,
    ) -> Result<Option<String>, SyncError> {
        let Some(uuid) = table.strip_prefix(self.descriptor.collection().prefix()) else {
            return Ok(None);
        };

        let object = self
            .metadata(role)
            .env()
            .store
            .find_one(
                &tenant_table(tenant, BK_TABLE_NAME_OBJ_DES),
                &Filter::eq(BK_OBJ_UUID_FIELD, uuid),
            )
            .await?;

        Ok(object.and_then(|object| get_str(&object, BK_OBJ_ID_FIELD).map(str::to_owned)))
    }

    /// Lists one page of raw rows within `window`, ordered by identity.
    pub async fn list_page(
        &self,
        role: SyncRole,
        tenant: &str,
        window: &ListWindow,
    ) -> Result<ListResult, SyncError> {
        let id_field = self.descriptor.id_field();
        let start = window.start_of(id_field);

        let mut cond = Filter::gt(id_field, start);
        if let Some(end) = window.end_of(id_field) {
            cond = cond.and(Filter::lte(id_field, end));
        }

        let metadata = self.metadata(role);
        let cond = metadata.add_list_cond(tenant, self.res_type(), cond);
        let table = self.table(role, tenant, &window.sub_res).await?;

        let data = metadata
            .env()
            .store
            .find(&table, &Query::new(cond).sort(id_field).limit(self.page_size))
            .await?;

        if data.is_empty() {
            return Ok(ListResult {
                is_all: true,
                data,
                next_start: IdMarks::new(),
            });
        }

        let next = last_id(&data, id_field).unwrap_or_else(|| start.saturating_add(1));

        Ok(ListResult {
            is_all: data.len() < self.page_size,
            data,
            next_start: IdMarks::from([(id_field.to_owned(), next)]),
        })
    }

    /// Turns raw rows of one side into canonical records.
    ///
    /// Rows that fail to parse, or fall outside the ID rules of the source
    /// environment, are skipped.
    pub fn to_records(
        &self,
        role: SyncRole,
        tenants: &TenantPair,
        sub_res: &str,
        docs: Vec<Document>,
    ) -> Vec<IdentifiedRecord> {
        let res_type = self.res_type();

        let remap = match (
            self.src.inner_ids(&tenants.src),
            self.dest.inner_ids(&tenants.dest),
        ) {
            (Some(src), Some(dest)) => Some(InnerIdRemap::new(*src, *dest)),
            _ => None,
        };

        let mut records = Vec::with_capacity(docs.len());

        for mut doc in docs {
            let _ignored = doc.remove(MONGO_META_ID);

            let parsed = match role {
                SyncRole::Src => {
                    if let Some(tenant_id) = doc.get_mut(TENANT_ID_FIELD) {
                        *tenant_id = Value::String(tenants.dest.clone());
                    }

                    self.descriptor.normalize(doc, remap.as_ref())
                }
                SyncRole::Dest => self.descriptor.normalize(doc, None),
            };

            let parsed = parsed.and_then(|doc| {
                let id = self.descriptor.identity(&doc)?;
                let related = self.descriptor.related_ids(sub_res, &doc)?;

                Ok((id, doc, related))
            });

            let (id, doc, mut related) = match parsed {
                Ok(parsed) => parsed,
                Err(err) => {
                    error!(%res_type, %role, sub_res, %err, "Skipping unparsable row");
                    continue;
                }
            };

            related.entry(res_type).or_default().push(id);

            if !self.id_rules.in_scope(&self.src.env().name, &related) {
                debug!(%res_type, %role, sub_res, id, "Skipping row outside of the ID rules");
                continue;
            }

            records.push(IdentifiedRecord::new(id, doc));
        }

        records
    }

    /// Compares source records with one destination page.
    ///
    /// Source records beyond what the destination page covers are handed back
    /// in `remaining_src` for the next page.
    #[must_use]
    pub fn compare(
        &self,
        src: Vec<IdentifiedRecord>,
        dest: Vec<IdentifiedRecord>,
        dest_is_all: bool,
        dest_next_start: &IdMarks,
    ) -> CompareResult {
        let boundary = dest_next_start.get(self.descriptor.id_field()).copied();

        compare_records(src, dest, dest_is_all, boundary)
    }

    /// Splits upsert candidates into those missing at the destination and those present.
    pub async fn classify_upsert(
        &self,
        dest_tenant: &str,
        sub_res: &str,
        records: Vec<IdentifiedRecord>,
    ) -> Result<(Vec<IdentifiedRecord>, Vec<IdentifiedRecord>), SyncError> {
        if records.is_empty() {
            return Ok((Vec::new(), Vec::new()));
        }

        let id_field = self.descriptor.id_field();
        let table = self.table(SyncRole::Dest, dest_tenant, sub_res).await?;

        let existing = self
            .dest
            .env()
            .store
            .distinct(
                &table,
                id_field,
                &Filter::is_in(id_field, records.iter().map(|record| record.id)),
            )
            .await?;
        let existing: BTreeSet<i64> = existing.iter().filter_map(value_as_i64).collect();

        Ok(records
            .into_iter()
            .partition(|record| !existing.contains(&record.id)))
    }

    /// Inserts records at the destination, rows that already exist are left alone.
    pub async fn insert(
        &self,
        dest_tenant: &str,
        sub_res: &str,
        records: Vec<IdentifiedRecord>,
    ) -> Result<usize, SyncError> {
        if records.is_empty() {
            return Ok(0);
        }

        let table = self.table(SyncRole::Dest, dest_tenant, sub_res).await?;
        self.ensure_unique(&table, self.descriptor.id_field()).await?;

        let count = records.len();
        let store = &self.dest.env().store;

        if self.descriptor.indexes_location() {
            let mapping_table = tenant_table(dest_tenant, BK_TABLE_NAME_OBJECT_BASE_MAPPING);
            self.ensure_unique(&mapping_table, BK_INST_ID_FIELD).await?;

            let mappings = records
                .iter()
                .map(|record| location_entry(record.id, sub_res, dest_tenant))
                .collect();
            let docs = records.into_iter().map(|record| record.data).collect();

            let summary = store
                .commit(vec![
                    WriteOp::insert(table.clone(), docs),
                    WriteOp::insert(mapping_table, mappings),
                ])
                .await?;

            debug!(
                %table,
                inserted = summary.inserted,
                duplicates = summary.duplicates,
                "Committed instances with locations"
            );

            return Ok(count);
        }

        let docs = records.into_iter().map(|record| record.data).collect();

        match store.insert(&table, docs).await {
            Ok(()) => {}
            Err(err) if err.is_duplicate() => {
                debug!(%table, %err, "Some rows already existed, treating as inserted");
            }
            Err(err) => return Err(err.into()),
        }

        Ok(count)
    }

    /// Replaces destination rows by identity, missing rows are skipped.
    pub async fn update(
        &self,
        dest_tenant: &str,
        sub_res: &str,
        records: Vec<IdentifiedRecord>,
    ) -> Result<usize, SyncError> {
        if records.is_empty() {
            return Ok(0);
        }

        let id_field = self.descriptor.id_field();
        let table = self.table(SyncRole::Dest, dest_tenant, sub_res).await?;
        let store = &self.dest.env().store;

        let count = records.len();

        for record in records {
            let matched = store
                .update(&table, &Filter::eq(id_field, record.id), record.data)
                .await?;

            if matched == 0 {
                debug!(%table, id = record.id, "Row to update does not exist, skipping");
            }
        }

        Ok(count)
    }

    /// Deletes destination rows by identity, ids that do not exist are ignored.
    ///
    /// Like the other apply methods it returns the number of records applied.
    pub async fn delete(
        &self,
        dest_tenant: &str,
        sub_res: &str,
        ids: &[i64],
    ) -> Result<usize, SyncError> {
        if ids.is_empty() {
            return Ok(0);
        }

        let id_field = self.descriptor.id_field();
        let table = self.table(SyncRole::Dest, dest_tenant, sub_res).await?;
        let store = &self.dest.env().store;
        let cond = Filter::is_in(id_field, ids.iter().copied());

        if self.descriptor.indexes_location() {
            let mapping_table = tenant_table(dest_tenant, BK_TABLE_NAME_OBJECT_BASE_MAPPING);

            let summary = store
                .commit(vec![
                    WriteOp::delete(
                        mapping_table,
                        Filter::is_in(BK_INST_ID_FIELD, ids.iter().copied()),
                    ),
                    WriteOp::delete(table.clone(), cond),
                ])
                .await?;

            debug!(%table, deleted = summary.deleted, "Committed instance and location deletions");

            return Ok(ids.len());
        }

        let deleted = store.delete(&table, &cond).await?;
        debug!(%table, requested = ids.len(), deleted, "Deleted rows");

        Ok(ids.len())
    }

    async fn ensure_unique(&self, table: &str, field: &str) -> Result<(), SyncError> {
        if self.indexed.contains(table) {
            return Ok(());
        }

        self.dest
            .env()
            .store
            .create_unique_index(table, field)
            .await?;

        let _ignored = self.indexed.insert(table.to_owned());

        Ok(())
    }
}

/// Identity of the last row that carries one, rows without it are skipped later.
fn last_id(data: &[Document], id_field: &str) -> Option<i64> {
    data.iter().rev().find_map(|doc| get_i64(doc, id_field))
}

fn location_entry(inst_id: i64, obj_id: &str, tenant: &str) -> Document {
    let mut entry = Document::new();

    let _ignored = entry.insert(BK_INST_ID_FIELD.to_owned(), Value::from(inst_id));
    let _ignored = entry.insert(BK_OBJ_ID_FIELD.to_owned(), Value::from(obj_id));
    let _ignored = entry.insert(TENANT_ID_FIELD.to_owned(), Value::from(tenant));

    entry
}

/// Diffs source records against one destination page.
///
/// Only source records the destination page covers (it is complete, or the
/// record is at or before its `boundary`) are compared; the rest is returned
/// as `remaining_src`.
#[must_use]
pub fn compare_records(
    src: Vec<IdentifiedRecord>,
    dest: Vec<IdentifiedRecord>,
    dest_is_all: bool,
    boundary: Option<i64>,
) -> CompareResult {
    let mut result = CompareResult::default();
    let mut index = BTreeMap::new();

    for record in src {
        if dest_is_all || boundary.is_some_and(|boundary| record.id <= boundary) {
            let _ignored = index.insert(record.id, record);
        } else {
            result.remaining_src.push(record);
        }
    }

    for record in dest {
        match index.remove(&record.id) {
            None => result.delete.push(record.id),
            Some(src) if src.data != record.data => result.update.push(src),
            Some(_) => {}
        }
    }

    result.insert = index.into_values().collect();

    result
}
