//! Fixtures shared by the integration tests.
//!
//! Two in-memory deployments: the source tenant `t1` is replicated into the
//! destination tenant `t2`. Both carry their host pool, the source also has
//! the platform business (biz 2) and a regular business (biz 3).

#![allow(dead_code, reason = "Every test crate uses a different subset")]

use core::time::Duration;
use std::collections::BTreeMap;

use cmdb_store::{Document, DocumentStore, InMemoryStore, Store};
use cmdb_transfer::config::{RetryConfig, SyncConfig, TransferConfig};
use cmdb_transfer::{Environment, TransferEngine};
use cmdb_transfer_primitives::{tenant_table, IdRuleMap};
use serde_json::Value;
use tokio::time;

pub const SRC_TENANT: &str = "t1";
pub const DEST_TENANT: &str = "t2";
pub const JOB: &str = "t1-to-t2";

/// Host pool of the source.
pub const SRC_POOL: (i64, i64, i64) = (1, 10, 100);
/// Host pool of the destination.
pub const DEST_POOL: (i64, i64, i64) = (1001, 1010, 1100);
pub const BLUEKING_BIZ: i64 = 2;
pub const GAME_BIZ: i64 = 3;

pub fn doc(value: Value) -> Document {
    match value {
        Value::Object(map) => map,
        other => panic!("not an object: {other}"),
    }
}

#[derive(Clone, Debug)]
pub struct Cluster {
    pub src: InMemoryStore,
    pub dest: InMemoryStore,
}

impl Cluster {
    /// Both deployments with their host pools, the source also with the platform business.
    pub async fn new() -> Self {
        let cluster = Self {
            src: InMemoryStore::new(),
            dest: InMemoryStore::new(),
        };

        seed_pool(&cluster.src, SRC_TENANT, SRC_POOL).await;
        seed_pool(&cluster.dest, DEST_TENANT, DEST_POOL).await;

        cluster
            .seed_src(
                "cc_ApplicationBase",
                vec![
                    serde_json::json!({ "bk_biz_id": BLUEKING_BIZ, "bk_biz_name": "蓝鲸", "default": 0 }),
                    serde_json::json!({ "bk_biz_id": GAME_BIZ, "bk_biz_name": "game", "default": 0 }),
                ],
            )
            .await;

        cluster
    }

    pub async fn seed_src(&self, table: &str, rows: Vec<Value>) {
        insert(&self.src, &tenant_table(SRC_TENANT, table), rows).await;
    }

    pub async fn seed_dest(&self, table: &str, rows: Vec<Value>) {
        insert(&self.dest, &tenant_table(DEST_TENANT, table), rows).await;
    }

    /// Destination rows of `table`, without their store-local `_id`.
    pub fn dest_rows(&self, table: &str) -> Vec<Document> {
        strip(self.dest.rows(&tenant_table(DEST_TENANT, table)))
    }

    /// Source rows of `table`, without their store-local `_id`.
    pub fn src_rows(&self, table: &str) -> Vec<Document> {
        strip(self.src.rows(&tenant_table(SRC_TENANT, table)))
    }

    /// Sorted identities of the destination rows of `table`.
    pub fn dest_ids(&self, table: &str, field: &str) -> Vec<i64> {
        ids(&self.dest_rows(table), field)
    }

    pub async fn engine(&self, page_size: usize) -> TransferEngine {
        self.engine_with(config(page_size, IdRuleMap::new())).await
    }

    pub async fn engine_with(&self, config: TransferConfig) -> TransferEngine {
        let mut engine = TransferEngine::new(
            config,
            Environment::new("sz", Store::new(self.src.clone())),
            Environment::new("gz", Store::new(self.dest.clone())),
        )
        .await
        .expect("both deployments carry their host pool");

        engine.register_defaults();

        engine
    }
}

pub fn config(page_size: usize, id_rules: IdRuleMap) -> TransferConfig {
    let sync = SyncConfig {
        page_size,
        batch_size: 100,
        max_concurrent: 4,
        poll_interval: Duration::from_millis(5),
        retry: RetryConfig {
            max_retries: 3,
            delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
        },
    };

    TransferConfig::new(
        JOB.to_owned(),
        BTreeMap::from([(SRC_TENANT.to_owned(), DEST_TENANT.to_owned())]),
        sync,
        id_rules,
    )
}

async fn seed_pool(store: &InMemoryStore, tenant: &str, (biz, set, module): (i64, i64, i64)) {
    insert(
        store,
        &tenant_table(tenant, "cc_ApplicationBase"),
        vec![serde_json::json!({ "bk_biz_id": biz, "bk_biz_name": "资源池", "default": 1 })],
    )
    .await;
    insert(
        store,
        &tenant_table(tenant, "cc_SetBase"),
        vec![serde_json::json!({ "bk_set_id": set, "bk_biz_id": biz, "default": 1 })],
    )
    .await;
    insert(
        store,
        &tenant_table(tenant, "cc_ModuleBase"),
        vec![serde_json::json!({ "bk_module_id": module, "bk_set_id": set, "bk_biz_id": biz, "default": 1 })],
    )
    .await;
}

pub async fn insert(store: &InMemoryStore, table: &str, rows: Vec<Value>) {
    store
        .insert(table, rows.into_iter().map(doc).collect())
        .await
        .expect("seed rows are unique");
}

pub fn strip(rows: Vec<Document>) -> Vec<Document> {
    rows.into_iter()
        .map(|mut row| {
            let _ignored = row.remove("_id");
            row
        })
        .collect()
}

pub fn ids(rows: &[Document], field: &str) -> Vec<i64> {
    let mut ids: Vec<i64> = rows
        .iter()
        .filter_map(|row| row.get(field).and_then(Value::as_i64))
        .collect();
    ids.sort_unstable();
    ids
}

/// Polls `check` until it holds, failing the test after two seconds.
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let waited = time::timeout(Duration::from_secs(2), async {
        while !check() {
            time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;

    assert!(waited.is_ok(), "timed out waiting until {what}");
}
