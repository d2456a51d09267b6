//! Platform exclusions of one environment.
//!
//! The host pool business (with its default set and module) of every tenant
//! and, on the source side, the platform's own business are never replicated.
//! [`Metadata`] adds the matching conditions to full sync list queries and
//! applies the same rules to change events, so the bulk and the live path
//! agree on what is in scope.

use std::collections::BTreeMap;

use cmdb_store::document::{get_i64, get_str};
use cmdb_store::{Document, Filter, Query};
use cmdb_transfer_primitives::common::{
    BK_APP_ID_FIELD, BK_APP_NAME, BK_APP_NAME_FIELD, BK_ASST_INST_ID_FIELD, BK_ASST_OBJ_ID_FIELD,
    BK_DEFAULT_FIELD, BK_DEST_MODEL_FIELD, BK_HOST_ID_FIELD, BK_INNER_OBJ_ID_HOST,
    BK_INST_ID_FIELD, BK_IS_PRE_FIELD, BK_MODULE_ID_FIELD, BK_OBJ_ID_FIELD, BK_SET_ID_FIELD,
    BK_TABLE_NAME_BASE_APP, BK_TABLE_NAME_BASE_HOST, BK_TABLE_NAME_BASE_MODULE,
    BK_TABLE_NAME_BASE_SET, BK_TABLE_NAME_MODEL_QUOTE_RELATION, BK_TABLE_NAME_MODULE_HOST_CONFIG,
    BK_TABLE_NAME_OBJ_DES, DEFAULT_APP_FLAG, DEFAULT_RES_MODULE_FLAG, DEFAULT_RES_SET_FLAG,
};
use cmdb_transfer_primitives::{
    tenant_table, EventType, HostPoolInfo, InnerDataIdConf, ResType, SyncRole,
};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::env::Environment;
use crate::error::SyncError;
use crate::types::SyncEvent;

mod blueking;

pub use blueking::{BluekingBiz, Members};

/// Object ids a full sync of per-object resource types iterates over.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CommonObjectIds {
    /// Non-preset objects.
    pub objects: Vec<String>,
    /// Non-preset objects that are quoted models of a table-typed property.
    pub quoted: Vec<String>,
}

/// Platform business membership as it was before a batch of events was translated.
///
/// Handed to [`Metadata::rollback`] when the batch could not be applied, so
/// that reading it again yields the same host creations and deletions.
#[derive(Debug, Default)]
pub struct MembershipUndo {
    before: BTreeMap<String, Members>,
}

impl MembershipUndo {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.before.is_empty()
    }

    fn remember(&mut self, tenant: &str, biz: &BluekingBiz) {
        let _ignored = self
            .before
            .entry(tenant.to_owned())
            .or_insert_with(|| biz.snapshot());
    }
}

#[derive(Debug)]
pub struct Metadata {
    role: SyncRole,
    env: Environment,
    inner_ids: BTreeMap<String, InnerDataIdConf>,
    blueking: BTreeMap<String, BluekingBiz>,
}

impl Metadata {
    /// Reads the exclusions of every tenant from the environment's store.
    pub async fn load<'a>(
        role: SyncRole,
        env: Environment,
        tenants: impl IntoIterator<Item = &'a str>,
    ) -> Result<Self, SyncError> {
        let mut inner_ids = BTreeMap::new();
        let mut blueking = BTreeMap::new();

        for tenant in tenants {
            let host_pool = load_host_pool(&env, tenant).await?;

            info!(
                env = %env.name,
                %role,
                %tenant,
                biz = host_pool.biz,
                set = host_pool.set,
                module = host_pool.module,
                "Loaded host pool"
            );

            let _ignored = inner_ids.insert(tenant.to_owned(), InnerDataIdConf::new(host_pool));

            if role != SyncRole::Src {
                continue;
            }

            if let Some(biz) = load_blueking_biz(&env, tenant).await? {
                info!(
                    env = %env.name,
                    %tenant,
                    biz_id = biz.biz_id(),
                    hosts = biz.host_ids().len(),
                    "Loaded blueking business"
                );

                let _ignored = blueking.insert(tenant.to_owned(), biz);
            }
        }

        Ok(Self {
            role,
            env,
            inner_ids,
            blueking,
        })
    }

    #[must_use]
    pub const fn role(&self) -> SyncRole {
        self.role
    }

    #[must_use]
    pub const fn env(&self) -> &Environment {
        &self.env
    }

    #[must_use]
    pub fn inner_ids(&self, tenant: &str) -> Option<&InnerDataIdConf> {
        self.inner_ids.get(tenant)
    }

    #[must_use]
    pub fn blueking(&self, tenant: &str) -> Option<&BluekingBiz> {
        self.blueking.get(tenant)
    }

    /// Restricts a list condition to the rows of `res_type` that may be replicated.
    #[must_use]
    pub fn add_list_cond(&self, tenant: &str, res_type: ResType, cond: Filter) -> Filter {
        let Some(inner) = self.inner_ids.get(tenant) else {
            return cond;
        };
        let host_pool = inner.host_pool;
        let blueking = self.blueking.get(tenant);

        let extra = match res_type {
            ResType::Biz | ResType::ObjectInstance => {
                let excluded = blueking
                    .map_or_else(|| vec![host_pool.biz], |biz| vec![host_pool.biz, biz.biz_id()]);

                return cond.and(Filter::not_in(BK_APP_ID_FIELD, excluded));
            }
            ResType::Set => Filter::ne(BK_SET_ID_FIELD, host_pool.set),
            ResType::Module => Filter::ne(BK_MODULE_ID_FIELD, host_pool.module),
            ResType::Host => {
                let host_ids = blueking.map(BluekingBiz::host_ids).unwrap_or_default();
                if host_ids.is_empty() {
                    return cond;
                }

                return cond.and(Filter::not_in(BK_HOST_ID_FIELD, host_ids));
            }
            ResType::InstAsst => {
                let host_ids = blueking.map(BluekingBiz::host_ids).unwrap_or_default();
                if host_ids.is_empty() {
                    return cond;
                }

                Filter::Nor(vec![
                    Filter::eq(BK_OBJ_ID_FIELD, BK_INNER_OBJ_ID_HOST)
                        .and(Filter::is_in(BK_INST_ID_FIELD, host_ids.iter().copied())),
                    Filter::eq(BK_ASST_OBJ_ID_FIELD, BK_INNER_OBJ_ID_HOST)
                        .and(Filter::is_in(BK_ASST_INST_ID_FIELD, host_ids)),
                ])
            }
            _ => Filter::All,
        };

        let Some(biz) = blueking.filter(|_| res_type.is_biz_related()) else {
            return cond.and(extra);
        };

        cond.and(extra)
            .and(Filter::ne(BK_APP_ID_FIELD, biz.biz_id()))
    }

    /// Decides whether a source change is replicated, and in which form.
    ///
    /// Host relation changes of the platform business are turned into host
    /// deletions and creations as hosts enter and leave it. The membership
    /// changes take effect at once and are recorded in `undo`.
    pub async fn filter_or_translate(
        &self,
        event: SyncEvent,
        undo: &mut MembershipUndo,
    ) -> Option<SyncEvent> {
        if event.res_type == ResType::HostRelation {
            return self.translate_host_relation(event, undo).await;
        }

        let cond = self.add_list_cond(&event.tenant, event.res_type, Filter::All);
        if cond.matches(&event.detail) {
            return Some(event);
        }

        debug!(
            res_type = %event.res_type,
            tenant = %event.tenant,
            oid = %event.oid,
            "Dropped excluded event"
        );

        None
    }

    /// Undoes the membership changes of a batch that was not applied.
    pub fn rollback(&self, undo: MembershipUndo) {
        for (tenant, members) in undo.before {
            let Some(biz) = self.blueking.get(&tenant) else {
                continue;
            };

            biz.restore(members);

            info!(%tenant, hosts = biz.host_ids().len(), "Rolled back blueking business membership");
        }
    }

    async fn translate_host_relation(
        &self,
        event: SyncEvent,
        undo: &mut MembershipUndo,
    ) -> Option<SyncEvent> {
        let Some(biz) = self.blueking.get(&event.tenant) else {
            return Some(event);
        };

        if get_i64(&event.detail, BK_APP_ID_FIELD) != Some(biz.biz_id()) {
            return Some(event);
        }

        let (Some(host_id), Some(module_id)) = (
            get_i64(&event.detail, BK_HOST_ID_FIELD),
            get_i64(&event.detail, BK_MODULE_ID_FIELD),
        ) else {
            warn!(
                tenant = %event.tenant,
                oid = %event.oid,
                "Dropped blueking host relation event without host or module"
            );
            return None;
        };

        undo.remember(&event.tenant, biz);

        if event.event_type.is_upsert() {
            if !biz.add_relation(host_id, module_id) {
                return None;
            }

            info!(tenant = %event.tenant, host_id, "Host entered blueking business");

            let mut detail = Document::new();
            let _ignored = detail.insert(BK_HOST_ID_FIELD.to_owned(), Value::from(host_id));

            return Some(host_event(EventType::Delete, event.tenant, host_id, detail));
        }

        if !biz.remove_relation(host_id, module_id) {
            return None;
        }

        info!(tenant = %event.tenant, host_id, "Host left blueking business");

        let table = tenant_table(&event.tenant, BK_TABLE_NAME_BASE_HOST);
        match self
            .env
            .store
            .find_one(&table, &Filter::eq(BK_HOST_ID_FIELD, host_id))
            .await
        {
            Ok(Some(host)) => Some(host_event(EventType::Create, event.tenant, host_id, host)),
            Ok(None) => {
                warn!(
                    tenant = %event.tenant,
                    host_id,
                    "Host left blueking business but no longer exists, skipping"
                );
                None
            }
            Err(err) => {
                warn!(
                    tenant = %event.tenant,
                    host_id,
                    %err,
                    "Failed to fetch host that left blueking business, skipping"
                );
                None
            }
        }
    }

    /// Object ids of a tenant, split into plain objects and quoted models.
    pub async fn common_object_ids(&self, tenant: &str) -> Result<CommonObjectIds, SyncError> {
        let objects = self
            .env
            .store
            .find(
                &tenant_table(tenant, BK_TABLE_NAME_OBJ_DES),
                &Query::new(Filter::eq(BK_IS_PRE_FIELD, false)).sort(BK_OBJ_ID_FIELD),
            )
            .await?;

        let quoted = self
            .env
            .store
            .distinct(
                &tenant_table(tenant, BK_TABLE_NAME_MODEL_QUOTE_RELATION),
                BK_DEST_MODEL_FIELD,
                &Filter::All,
            )
            .await?;
        let quoted: Vec<&str> = quoted.iter().filter_map(Value::as_str).collect();

        let mut ids = CommonObjectIds::default();
        for object in &objects {
            let Some(obj_id) = get_str(object, BK_OBJ_ID_FIELD) else {
                continue;
            };

            if quoted.contains(&obj_id) {
                ids.quoted.push(obj_id.to_owned());
            } else {
                ids.objects.push(obj_id.to_owned());
            }
        }

        Ok(ids)
    }
}

fn host_event(event_type: EventType, tenant: String, host_id: i64, detail: Document) -> SyncEvent {
    SyncEvent::new(event_type, ResType::Host, tenant, host_id.to_string(), detail)
        .with_sub_res(vec![String::new()])
}

async fn load_host_pool(env: &Environment, tenant: &str) -> Result<HostPoolInfo, SyncError> {
    let biz = find_id(
        env,
        tenant,
        BK_TABLE_NAME_BASE_APP,
        Filter::eq(BK_DEFAULT_FIELD, DEFAULT_APP_FLAG),
        BK_APP_ID_FIELD,
    )
    .await?;

    let set = find_id(
        env,
        tenant,
        BK_TABLE_NAME_BASE_SET,
        Filter::eq(BK_APP_ID_FIELD, biz).and(Filter::eq(BK_DEFAULT_FIELD, DEFAULT_RES_SET_FLAG)),
        BK_SET_ID_FIELD,
    )
    .await?;

    let module = find_id(
        env,
        tenant,
        BK_TABLE_NAME_BASE_MODULE,
        Filter::eq(BK_SET_ID_FIELD, set).and(Filter::eq(BK_DEFAULT_FIELD, DEFAULT_RES_MODULE_FLAG)),
        BK_MODULE_ID_FIELD,
    )
    .await?;

    Ok(HostPoolInfo { biz, set, module })
}

async fn find_id(
    env: &Environment,
    tenant: &str,
    table: &str,
    filter: Filter,
    field: &str,
) -> Result<i64, SyncError> {
    let table = tenant_table(tenant, table);

    let row = env.store.find_one(&table, &filter).await?.ok_or_else(|| {
        SyncError::Metadata(format!("{}: no row of {table} matches {filter:?}", env.name))
    })?;

    get_i64(&row, field)
        .ok_or_else(|| SyncError::Metadata(format!("{}: {table} row has no {field}", env.name)))
}

async fn load_blueking_biz(
    env: &Environment,
    tenant: &str,
) -> Result<Option<BluekingBiz>, SyncError> {
    let biz = env
        .store
        .find_one(
            &tenant_table(tenant, BK_TABLE_NAME_BASE_APP),
            &Filter::eq(BK_APP_NAME_FIELD, BK_APP_NAME),
        )
        .await?;

    let Some(biz_id) = biz.as_ref().and_then(|biz| get_i64(biz, BK_APP_ID_FIELD)) else {
        return Ok(None);
    };

    let relations = env
        .store
        .find(
            &tenant_table(tenant, BK_TABLE_NAME_MODULE_HOST_CONFIG),
            &Query::new(Filter::eq(BK_APP_ID_FIELD, biz_id)),
        )
        .await?;

    let relations = relations.iter().filter_map(|relation| {
        Some((
            get_i64(relation, BK_HOST_ID_FIELD)?,
            get_i64(relation, BK_MODULE_ID_FIELD)?,
        ))
    });

    Ok(Some(BluekingBiz::new(biz_id, relations)))
}
