//! Incremental sync against two in-memory deployments.

mod common;

use core::time::Duration;

use cmdb_store::{CollectionFilter, DocumentStore, Filter, OperationType, Store};
use cmdb_transfer::descriptor::SimpleDescriptor;
use cmdb_transfer::{Environment, SyncError, TransferEngine};
use cmdb_transfer_primitives::{tenant_table, IdRuleMap, ResType};
use serde_json::{json, Value};
use tokio::time;

use common::{config, doc, eventually, Cluster, DEST_POOL, DEST_TENANT, JOB, SRC_TENANT};

fn host(id: i64, ip: &str) -> Value {
    json!({ "bk_host_id": id, "bk_host_innerip": ip })
}

/// Whether the watcher of `res_type` persisted the position of the last source change.
fn caught_up(cluster: &Cluster, res_type: ResType) -> bool {
    let key = Value::from(format!("{JOB}:{res_type}"));
    let last = Value::from(format!("{:016x}", cluster.src.change_count()));

    cluster
        .dest
        .rows("cc_SyncWatchToken")
        .iter()
        .any(|row| row.get("_id") == Some(&key) && row.get("token") == Some(&last))
}

#[tokio::test]
async fn changes_are_replicated_once_per_row() {
    let cluster = Cluster::new().await;
    let table = tenant_table(SRC_TENANT, "cc_HostBase");

    cluster
        .seed_src("cc_HostBase", vec![host(1, "10.0.0.1"), host(2, "10.0.0.2")])
        .await;
    let _matched = cluster
        .src
        .update(&table, &Filter::eq("bk_host_id", 1), doc(host(1, "10.0.0.11")))
        .await
        .unwrap();
    let _deleted = cluster
        .src
        .delete(&table, &Filter::eq("bk_host_id", 2))
        .await
        .unwrap();

    let engine = cluster.engine(10).await;
    let sync = engine.start_incremental_sync(&[ResType::Host]);

    eventually("host 1 is replicated", || {
        caught_up(&cluster, ResType::Host) && cluster.dest_ids("cc_HostBase", "bk_host_id") == [1]
    })
    .await;

    assert_eq!(
        cluster.dest_rows("cc_HostBase"),
        vec![doc(host(1, "10.0.0.11"))]
    );

    // host 2 was created and removed within one batch, the destination never saw it
    let writes = cluster
        .dest
        .read_changes(
            &CollectionFilter::new().name(tenant_table(DEST_TENANT, "cc_HostBase")),
            None,
            100,
        )
        .await
        .unwrap();
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].operation, OperationType::Insert);

    sync.cancel();
    let results = sync.join().await;
    assert!(
        matches!(results.as_slice(), [(ResType::Host, Ok(()))]),
        "{results:?}"
    );
}

#[tokio::test]
async fn hosts_follow_the_platform_business() {
    let cluster = Cluster::new().await;
    let relations = tenant_table(SRC_TENANT, "cc_ModuleHostConfig");

    cluster.seed_src("cc_HostBase", vec![host(5, "10.0.0.5")]).await;
    cluster.seed_dest("cc_HostBase", vec![host(5, "10.0.0.5")]).await;

    let engine = cluster.engine(10).await;
    let sync = engine.start_incremental_sync(&[ResType::HostRelation]);

    cluster
        .seed_src(
            "cc_ModuleHostConfig",
            vec![json!({ "id": 1, "bk_biz_id": 2, "bk_set_id": 20, "bk_module_id": 200, "bk_host_id": 5 })],
        )
        .await;
    eventually("host 5 leaves the destination", || {
        caught_up(&cluster, ResType::HostRelation)
            && cluster.dest_ids("cc_HostBase", "bk_host_id").is_empty()
    })
    .await;

    // a second module of the same business changes nothing
    cluster
        .seed_src(
            "cc_ModuleHostConfig",
            vec![json!({ "id": 2, "bk_biz_id": 2, "bk_set_id": 20, "bk_module_id": 201, "bk_host_id": 5 })],
        )
        .await;
    eventually("the second relation is read", || {
        caught_up(&cluster, ResType::HostRelation)
    })
    .await;
    assert!(cluster.dest_ids("cc_HostBase", "bk_host_id").is_empty());

    let _deleted = cluster
        .src
        .delete(&relations, &Filter::eq("id", 1))
        .await
        .unwrap();
    eventually("the first relation removal is read", || {
        caught_up(&cluster, ResType::HostRelation)
    })
    .await;
    assert!(cluster.dest_ids("cc_HostBase", "bk_host_id").is_empty());

    let _deleted = cluster
        .src
        .delete(&relations, &Filter::eq("id", 2))
        .await
        .unwrap();
    eventually("host 5 is restored", || {
        caught_up(&cluster, ResType::HostRelation)
            && cluster.dest_ids("cc_HostBase", "bk_host_id") == [5]
    })
    .await;

    assert_eq!(cluster.dest_rows("cc_HostBase"), vec![doc(host(5, "10.0.0.5"))]);
    assert!(cluster.dest_rows("cc_ModuleHostConfig").is_empty());

    sync.cancel();
    let _results = sync.join().await;
}

#[tokio::test]
async fn watching_resumes_after_the_last_applied_batch() {
    let cluster = Cluster::new().await;

    cluster.seed_src("cc_HostBase", vec![host(1, "10.0.0.1")]).await;

    let engine = cluster.engine(10).await;

    let sync = engine.start_incremental_sync(&[ResType::Host]);
    eventually("host 1 is replicated", || {
        caught_up(&cluster, ResType::Host) && cluster.dest_ids("cc_HostBase", "bk_host_id") == [1]
    })
    .await;
    sync.cancel();
    let results = sync.join().await;
    assert!(results.iter().all(|(_, result)| result.is_ok()), "{results:?}");

    // removed behind the engine's back, a replay would bring it back
    let _deleted = cluster
        .dest
        .delete(
            &tenant_table(DEST_TENANT, "cc_HostBase"),
            &Filter::eq("bk_host_id", 1),
        )
        .await
        .unwrap();
    cluster.seed_src("cc_HostBase", vec![host(2, "10.0.0.2")]).await;

    let sync = engine.start_incremental_sync(&[ResType::Host]);
    eventually("host 2 is replicated", || {
        caught_up(&cluster, ResType::Host) && cluster.dest_ids("cc_HostBase", "bk_host_id") == [2]
    })
    .await;
    sync.cancel();
    let _results = sync.join().await;

    let cursor = cluster
        .dest
        .rows("cc_SyncWatchToken")
        .into_iter()
        .find(|row| row["_id"] == json!("t1-to-t2:host"))
        .expect("the host watcher keeps a cursor");
    assert!(cursor["start_at"].as_i64().is_some_and(|start_at| start_at > 0));
}

#[tokio::test]
async fn cancelled_watchers_stop_while_idle() {
    let cluster = Cluster::new().await;

    let mut engine = TransferEngine::new(
        config(10, IdRuleMap::new()),
        Environment::new("sz", Store::new(cluster.src.clone())),
        Environment::new("gz", Store::new(cluster.dest.clone())),
    )
    .await
    .unwrap();
    engine.register(Box::new(SimpleDescriptor::new(
        ResType::Host,
        "bk_host_id",
        "cc_HostBase",
        &[],
    )));

    let sync = engine.start_incremental_sync(&[ResType::Host, ResType::Biz, ResType::Host]);
    time::sleep(Duration::from_millis(20)).await;

    sync.cancel();
    assert!(sync.is_cancelled());

    let mut results = time::timeout(Duration::from_secs(2), sync.join())
        .await
        .expect("watchers stop once cancelled");
    results.sort_by_key(|(res_type, _)| *res_type);

    assert_eq!(results.len(), 2);
    assert!(matches!(results[0], (ResType::Biz, Err(SyncError::UnknownResType(ResType::Biz)))), "{results:?}");
    assert!(matches!(results[1], (ResType::Host, Ok(()))), "{results:?}");
}

#[tokio::test]
async fn transient_failures_delay_but_do_not_lose_changes() {
    let cluster = Cluster::new().await;

    cluster
        .seed_src("cc_HostBase", vec![host(1, "10.0.0.1"), host(2, "10.0.0.2")])
        .await;

    let engine = cluster.engine(10).await;

    cluster.src.fail_next(2);
    cluster.dest.fail_next(3);

    let sync = engine.start_incremental_sync(&[ResType::Host]);
    eventually("both hosts are replicated", || {
        caught_up(&cluster, ResType::Host)
            && cluster.dest_ids("cc_HostBase", "bk_host_id") == [1, 2]
    })
    .await;

    sync.cancel();
    let results = sync.join().await;
    assert!(results.iter().all(|(_, result)| result.is_ok()), "{results:?}");
}

#[tokio::test]
async fn excluded_changes_are_dropped() {
    let cluster = Cluster::new().await;

    let engine = cluster.engine(10).await;
    let sync = engine.start_incremental_sync(&[ResType::Set]);

    cluster
        .seed_src(
            "cc_SetBase",
            vec![
                json!({ "bk_set_id": 20, "bk_biz_id": 2, "default": 0 }),
                json!({ "bk_set_id": 30, "bk_biz_id": 3, "default": 0 }),
            ],
        )
        .await;

    eventually("set 30 is replicated", || {
        caught_up(&cluster, ResType::Set) && cluster.dest_ids("cc_SetBase", "bk_set_id").contains(&30)
    })
    .await;

    assert_eq!(cluster.dest_ids("cc_SetBase", "bk_set_id"), vec![30, DEST_POOL.1]);

    sync.cancel();
    let _results = sync.join().await;
}

#[tokio::test]
async fn object_instances_are_followed_per_object() {
    let cluster = Cluster::new().await;

    cluster
        .seed_src(
            "cc_ObjDes",
            vec![json!({ "bk_obj_id": "switch", "obj_uuid": "s1", "ispre": false })],
        )
        .await;
    cluster
        .seed_dest(
            "cc_ObjDes",
            vec![json!({ "bk_obj_id": "switch", "obj_uuid": "d1", "ispre": false })],
        )
        .await;

    let engine = cluster.engine(10).await;
    let sync = engine.start_incremental_sync(&[ResType::ObjectInstance]);

    cluster
        .seed_src(
            "cc_ObjectBase_s1",
            vec![
                json!({ "bk_inst_id": 1, "bk_obj_id": "switch", "bk_inst_name": "sw-1" }),
                json!({ "bk_inst_id": 2, "bk_obj_id": "switch", "bk_inst_name": "sw-2", "bk_biz_id": 2 }),
            ],
        )
        .await;

    eventually("instance 1 is replicated", || {
        caught_up(&cluster, ResType::ObjectInstance)
            && cluster.dest_ids("cc_ObjectBase_d1", "bk_inst_id") == [1]
    })
    .await;
    assert_eq!(cluster.dest_ids("cc_ObjectBaseMapping", "bk_inst_id"), vec![1]);

    let _deleted = cluster
        .src
        .delete(
            &tenant_table(SRC_TENANT, "cc_ObjectBase_s1"),
            &Filter::eq("bk_inst_id", 1),
        )
        .await
        .unwrap();

    eventually("instance 1 and its location are removed", || {
        caught_up(&cluster, ResType::ObjectInstance)
            && cluster.dest_ids("cc_ObjectBase_d1", "bk_inst_id").is_empty()
            && cluster.dest_ids("cc_ObjectBaseMapping", "bk_inst_id").is_empty()
    })
    .await;

    sync.cancel();
    let _results = sync.join().await;
}

#[tokio::test]
async fn cancelled_watchers_finish_the_batch_they_read() {
    let cluster = Cluster::new().await;

    cluster.seed_src("cc_HostBase", vec![host(1, "10.0.0.1")]).await;

    let engine = cluster.engine(10).await;
    let sync = engine.start_incremental_sync(&[ResType::Host]);
    eventually("host 1 is replicated", || {
        caught_up(&cluster, ResType::Host) && cluster.dest_ids("cc_HostBase", "bk_host_id") == [1]
    })
    .await;

    cluster.dest.fail_next(1_000_000);
    cluster
        .seed_src("cc_HostBase", vec![host(2, "10.0.0.2"), host(3, "10.0.0.3")])
        .await;
    eventually("the batch is being applied", || {
        cluster.dest.pending_failures() < 1_000_000
    })
    .await;

    sync.cancel();
    time::sleep(Duration::from_millis(30)).await;
    assert_eq!(cluster.dest_ids("cc_HostBase", "bk_host_id"), vec![1]);

    cluster.dest.fail_next(0);
    let results = time::timeout(Duration::from_secs(2), sync.join())
        .await
        .expect("the batch is applied once the destination is back");

    assert!(
        matches!(results.as_slice(), [(ResType::Host, Ok(()))]),
        "{results:?}"
    );
    assert_eq!(cluster.dest_ids("cc_HostBase", "bk_host_id"), vec![1, 2, 3]);
    assert!(caught_up(&cluster, ResType::Host));

    let sync = engine.start_incremental_sync(&[ResType::Host]);
    time::sleep(Duration::from_millis(30)).await;
    sync.cancel();
    let _results = sync.join().await;

    assert_eq!(cluster.dest_ids("cc_HostBase", "bk_host_id"), vec![1, 2, 3]);
}

#[tokio::test]
async fn cancelled_watchers_finish_a_platform_business_batch() {
    let cluster = Cluster::new().await;

    cluster.seed_src("cc_HostBase", vec![host(5, "10.0.0.5")]).await;
    cluster.seed_dest("cc_HostBase", vec![host(5, "10.0.0.5")]).await;

    let engine = cluster.engine(10).await;
    let sync = engine.start_incremental_sync(&[ResType::HostRelation]);

    cluster
        .seed_src(
            "cc_ModuleHostConfig",
            vec![json!({ "id": 1, "bk_biz_id": 3, "bk_set_id": 30, "bk_module_id": 300, "bk_host_id": 6 })],
        )
        .await;
    eventually("the watcher is running", || {
        caught_up(&cluster, ResType::HostRelation)
    })
    .await;

    cluster.dest.fail_next(1_000_000);
    cluster
        .seed_src(
            "cc_ModuleHostConfig",
            vec![json!({ "id": 2, "bk_biz_id": 2, "bk_set_id": 20, "bk_module_id": 200, "bk_host_id": 5 })],
        )
        .await;
    eventually("the host removal is being applied", || {
        cluster.dest.pending_failures() < 1_000_000
    })
    .await;

    sync.cancel();
    time::sleep(Duration::from_millis(30)).await;
    assert_eq!(cluster.dest_ids("cc_HostBase", "bk_host_id"), vec![5]);

    cluster.dest.fail_next(0);
    let results = time::timeout(Duration::from_secs(2), sync.join())
        .await
        .expect("the batch is applied once the destination is back");

    assert!(
        matches!(results.as_slice(), [(ResType::HostRelation, Ok(()))]),
        "{results:?}"
    );
    assert!(cluster.dest_ids("cc_HostBase", "bk_host_id").is_empty());
    assert!(caught_up(&cluster, ResType::HostRelation));

    let sync = engine.start_incremental_sync(&[ResType::HostRelation]);
    time::sleep(Duration::from_millis(30)).await;
    sync.cancel();
    let _results = sync.join().await;

    assert!(cluster.dest_ids("cc_HostBase", "bk_host_id").is_empty());
}

#[tokio::test]
async fn rejected_batches_are_applied_after_restart() {
    let cluster = Cluster::new().await;

    cluster.seed_src("cc_HostBase", vec![host(1, "10.0.0.1")]).await;

    let engine = cluster.engine(10).await;
    let sync = engine.start_incremental_sync(&[ResType::Host]);
    eventually("host 1 is replicated", || {
        caught_up(&cluster, ResType::Host) && cluster.dest_ids("cc_HostBase", "bk_host_id") == [1]
    })
    .await;

    cluster.dest.reject_next(1);
    cluster.seed_src("cc_HostBase", vec![host(2, "10.0.0.2")]).await;

    let results = time::timeout(Duration::from_secs(2), sync.join())
        .await
        .expect("a rejected batch stops the watcher");
    assert!(
        matches!(results.as_slice(), [(ResType::Host, Err(SyncError::Store(_)))]),
        "{results:?}"
    );
    assert_eq!(cluster.dest_ids("cc_HostBase", "bk_host_id"), vec![1]);

    let sync = engine.start_incremental_sync(&[ResType::Host]);
    eventually("host 2 is replicated after the restart", || {
        caught_up(&cluster, ResType::Host)
            && cluster.dest_ids("cc_HostBase", "bk_host_id") == [1, 2]
    })
    .await;

    sync.cancel();
    let _results = sync.join().await;
}

#[tokio::test]
async fn rejected_platform_business_batches_translate_again_after_restart() {
    let cluster = Cluster::new().await;

    cluster.seed_src("cc_HostBase", vec![host(5, "10.0.0.5")]).await;
    cluster.seed_dest("cc_HostBase", vec![host(5, "10.0.0.5")]).await;

    let engine = cluster.engine(10).await;
    let sync = engine.start_incremental_sync(&[ResType::HostRelation]);

    cluster
        .seed_src(
            "cc_ModuleHostConfig",
            vec![json!({ "id": 1, "bk_biz_id": 3, "bk_set_id": 30, "bk_module_id": 300, "bk_host_id": 6 })],
        )
        .await;
    eventually("the watcher is running", || {
        caught_up(&cluster, ResType::HostRelation)
    })
    .await;

    cluster.dest.reject_next(1);
    cluster
        .seed_src(
            "cc_ModuleHostConfig",
            vec![json!({ "id": 2, "bk_biz_id": 2, "bk_set_id": 20, "bk_module_id": 200, "bk_host_id": 5 })],
        )
        .await;

    let results = time::timeout(Duration::from_secs(2), sync.join())
        .await
        .expect("a rejected batch stops the watcher");
    assert!(
        matches!(
            results.as_slice(),
            [(ResType::HostRelation, Err(SyncError::Store(_)))]
        ),
        "{results:?}"
    );
    assert_eq!(cluster.dest_ids("cc_HostBase", "bk_host_id"), vec![5]);

    let sync = engine.start_incremental_sync(&[ResType::HostRelation]);
    eventually("host 5 leaves the destination after the restart", || {
        caught_up(&cluster, ResType::HostRelation)
            && cluster.dest_ids("cc_HostBase", "bk_host_id").is_empty()
    })
    .await;

    sync.cancel();
    let _results = sync.join().await;
}
