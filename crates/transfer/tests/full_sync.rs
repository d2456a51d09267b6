//! Full sync against two in-memory deployments.

mod common;

use core::time::Duration;

use cmdb_store::{DocumentStore, Filter, Store};
use cmdb_transfer::descriptor::SimpleDescriptor;
use cmdb_transfer::logics::OBJECT_UUID_TTL;
use cmdb_transfer::{Environment, SyncError, SyncProgress, TransferEngine};
use cmdb_transfer_primitives::{IdRange, IdRule, IdRuleMap, ResType};
use serde_json::json;
use tokio::time;
use tokio_util::sync::CancellationToken;

use common::{config, doc, Cluster, DEST_POOL, DEST_TENANT, SRC_POOL};

fn host(id: i64, ip: &str) -> serde_json::Value {
    json!({ "bk_host_id": id, "bk_host_innerip": ip })
}

#[tokio::test]
async fn worked_example_converges() {
    let cluster = Cluster::new().await;

    cluster
        .seed_src(
            "cc_HostBase",
            (1..=5).map(|id| host(id, &format!("10.0.0.{id}"))).collect(),
        )
        .await;
    cluster
        .seed_dest(
            "cc_HostBase",
            vec![host(2, "10.0.0.2"), host(3, "stale"), host(6, "10.0.0.6")],
        )
        .await;

    let engine = cluster.engine(2).await;
    let results = engine.start_full_sync(&[ResType::Host], &CancellationToken::new()).await;

    assert_eq!(results.len(), 1);
    let (res_type, report) = &results[0];
    assert_eq!(*res_type, ResType::Host);

    let report = report.as_ref().expect("host sync succeeds");
    assert_eq!(report.inserted, 3);
    assert_eq!(report.updated, 1);
    assert_eq!(report.deleted, 1);
    assert_eq!(report.windows, 3);

    assert_eq!(cluster.dest_ids("cc_HostBase", "bk_host_id"), vec![1, 2, 3, 4, 5]);

    let host_3 = cluster
        .dest_rows("cc_HostBase")
        .into_iter()
        .find(|row| row["bk_host_id"] == json!(3))
        .expect("host 3 was kept");
    assert_eq!(host_3, doc(host(3, "10.0.0.3")));
}

#[tokio::test]
async fn windows_cover_every_row_for_any_page_size() {
    let src_ids = [1, 2, 4, 7, 8, 9, 15, 20];
    let dest_ids = [3, 4, 5, 9, 10, 16, 21, 22];

    for page_size in 1..=9 {
        let cluster = Cluster::new().await;

        cluster
            .seed_src(
                "cc_HostBase",
                src_ids.iter().map(|id| host(*id, "src")).collect(),
            )
            .await;
        cluster
            .seed_dest(
                "cc_HostBase",
                dest_ids.iter().map(|id| host(*id, "dest")).collect(),
            )
            .await;

        let engine = cluster.engine(page_size).await;
        let results = engine.start_full_sync(&[ResType::Host], &CancellationToken::new()).await;
        assert!(results[0].1.is_ok(), "page size {page_size}: {results:?}");

        let mut dest = cluster.dest_rows("cc_HostBase");
        dest.sort_by_key(|row| row["bk_host_id"].as_i64());
        let mut src = cluster.src_rows("cc_HostBase");
        src.sort_by_key(|row| row["bk_host_id"].as_i64());

        assert_eq!(dest, src, "page size {page_size}");
    }
}

#[tokio::test]
async fn second_run_changes_nothing() {
    let cluster = Cluster::new().await;

    cluster
        .seed_src("cc_HostBase", (1..=7).map(|id| host(id, "src")).collect())
        .await;
    cluster
        .seed_dest("cc_HostBase", vec![host(3, "dest"), host(9, "dest")])
        .await;

    let engine = cluster.engine(3).await;

    let first = engine.start_full_sync(&[ResType::Host], &CancellationToken::new()).await;
    assert!(first[0].1.is_ok(), "{first:?}");

    let changes = cluster.dest.change_count();

    let second = engine.start_full_sync(&[ResType::Host], &CancellationToken::new()).await;
    let report = second[0].1.as_ref().expect("second run succeeds");

    assert_eq!((report.inserted, report.updated, report.deleted), (0, 0, 0));
    assert_eq!(cluster.dest.change_count(), changes);
}

#[tokio::test]
async fn excluded_businesses_stay_behind() {
    let cluster = Cluster::new().await;

    cluster
        .seed_src(
            "cc_ApplicationBase",
            vec![json!({ "bk_biz_id": 4, "bk_biz_name": "shop", "default": 0 })],
        )
        .await;
    cluster
        .seed_src(
            "cc_SetBase",
            vec![
                json!({ "bk_set_id": 20, "bk_biz_id": 2, "default": 0 }),
                json!({ "bk_set_id": 30, "bk_biz_id": 3, "default": 0 }),
            ],
        )
        .await;
    cluster
        .seed_dest(
            "cc_ApplicationBase",
            vec![json!({ "bk_biz_id": 5, "bk_biz_name": "gone", "default": 0 })],
        )
        .await;

    let engine = cluster.engine(2).await;
    let results = engine
        .start_full_sync(&[ResType::Biz, ResType::Set], &CancellationToken::new())
        .await;

    assert_eq!(
        results.iter().map(|(res_type, _)| *res_type).collect::<Vec<_>>(),
        vec![ResType::Biz, ResType::Set]
    );
    assert!(results.iter().all(|(_, result)| result.is_ok()), "{results:?}");

    // the destination's own host pool is never touched
    assert_eq!(
        cluster.dest_ids("cc_ApplicationBase", "bk_biz_id"),
        vec![3, 4, DEST_POOL.0]
    );
    assert_eq!(
        cluster.dest_ids("cc_SetBase", "bk_set_id"),
        vec![30, DEST_POOL.1]
    );
}

#[tokio::test]
async fn host_pool_relations_are_remapped() {
    let cluster = Cluster::new().await;

    cluster
        .seed_src(
            "cc_ModuleHostConfig",
            vec![
                json!({ "id": 1, "bk_biz_id": SRC_POOL.0, "bk_set_id": SRC_POOL.1, "bk_module_id": SRC_POOL.2, "bk_host_id": 5 }),
                json!({ "id": 2, "bk_biz_id": 2, "bk_set_id": 20, "bk_module_id": 200, "bk_host_id": 7 }),
                json!({ "id": 3, "bk_biz_id": 3, "bk_set_id": 30, "bk_module_id": 300, "bk_host_id": 6 }),
            ],
        )
        .await;
    cluster
        .seed_src(
            "cc_HostBase",
            vec![host(5, "10.0.0.5"), host(6, "10.0.0.6"), host(7, "10.0.0.7")],
        )
        .await;

    let engine = cluster.engine(10).await;
    let results = engine
        .start_full_sync(&[ResType::HostRelation, ResType::Host], &CancellationToken::new())
        .await;
    assert!(results.iter().all(|(_, result)| result.is_ok()), "{results:?}");

    let mut relations = cluster.dest_rows("cc_ModuleHostConfig");
    relations.sort_by_key(|row| row["id"].as_i64());

    assert_eq!(
        relations,
        vec![
            doc(json!({ "id": 1, "bk_biz_id": DEST_POOL.0, "bk_set_id": DEST_POOL.1, "bk_module_id": DEST_POOL.2, "bk_host_id": 5 })),
            doc(json!({ "id": 3, "bk_biz_id": 3, "bk_set_id": 30, "bk_module_id": 300, "bk_host_id": 6 })),
        ]
    );

    // host 7 belongs to the platform business
    assert_eq!(cluster.dest_ids("cc_HostBase", "bk_host_id"), vec![5, 6]);
}

#[tokio::test]
async fn object_instances_maintain_their_locations() {
    let cluster = Cluster::new().await;

    cluster
        .seed_src(
            "cc_ObjDes",
            vec![
                json!({ "bk_obj_id": "host", "obj_uuid": "h0", "ispre": true }),
                json!({ "bk_obj_id": "switch", "obj_uuid": "s1", "ispre": false }),
            ],
        )
        .await;
    cluster
        .seed_dest(
            "cc_ObjDes",
            vec![json!({ "bk_obj_id": "switch", "obj_uuid": "d1", "ispre": false })],
        )
        .await;
    cluster
        .seed_src(
            "cc_ObjectBase_s1",
            vec![
                json!({ "bk_inst_id": 1, "bk_obj_id": "switch", "bk_inst_name": "sw-1" }),
                json!({ "bk_inst_id": 2, "bk_obj_id": "switch", "bk_inst_name": "sw-2", "bk_biz_id": 2 }),
                json!({ "bk_inst_id": 3, "bk_obj_id": "switch", "bk_inst_name": "sw-3", "bk_biz_id": 3 }),
            ],
        )
        .await;

    let engine = cluster.engine(2).await;

    let results = engine
        .start_full_sync(&[ResType::ObjectInstance], &CancellationToken::new())
        .await;
    let report = results[0].1.as_ref().expect("object sync succeeds");
    assert_eq!(report.sub_resources, 1);

    assert_eq!(cluster.dest_ids("cc_ObjectBase_d1", "bk_inst_id"), vec![1, 3]);

    let mut locations = cluster.dest_rows("cc_ObjectBaseMapping");
    locations.sort_by_key(|row| row["bk_inst_id"].as_i64());
    assert_eq!(
        locations,
        vec![
            doc(json!({ "bk_inst_id": 1, "bk_obj_id": "switch", "tenant_id": DEST_TENANT })),
            doc(json!({ "bk_inst_id": 3, "bk_obj_id": "switch", "tenant_id": DEST_TENANT })),
        ]
    );

    let _deleted = cluster
        .src
        .delete("t1_cc_ObjectBase_s1", &Filter::eq("bk_inst_id", 1))
        .await
        .unwrap();

    let results = engine
        .start_full_sync(&[ResType::ObjectInstance], &CancellationToken::new())
        .await;
    assert!(results[0].1.is_ok(), "{results:?}");

    assert_eq!(cluster.dest_ids("cc_ObjectBase_d1", "bk_inst_id"), vec![3]);
    assert_eq!(
        cluster.dest_ids("cc_ObjectBaseMapping", "bk_inst_id"),
        vec![3]
    );
}

#[tokio::test]
async fn rows_outside_the_id_rules_are_left_alone() {
    let cluster = Cluster::new().await;

    cluster
        .seed_src("cc_HostBase", (1..=5).map(|id| host(id, "src")).collect())
        .await;
    cluster
        .seed_dest("cc_HostBase", vec![host(2, "dest"), host(9, "dest")])
        .await;

    let mut rules = IdRuleMap::new();
    let _ignored = rules
        .entry("sz".to_owned())
        .or_default()
        .insert(ResType::Host, IdRule::new(vec![IdRange::new(1, Some(3))]));

    let engine = cluster.engine_with(config(2, rules)).await;
    let results = engine.start_full_sync(&[ResType::Host], &CancellationToken::new()).await;
    assert!(results[0].1.is_ok(), "{results:?}");

    assert_eq!(cluster.dest_ids("cc_HostBase", "bk_host_id"), vec![1, 2, 3, 9]);
}

#[tokio::test]
async fn transient_failures_are_retried() {
    let cluster = Cluster::new().await;

    cluster
        .seed_src("cc_HostBase", (1..=4).map(|id| host(id, "src")).collect())
        .await;

    let engine = cluster.engine(2).await;

    cluster.src.fail_next(2);
    cluster.dest.fail_next(1);

    let results = engine.start_full_sync(&[ResType::Host], &CancellationToken::new()).await;
    assert!(results[0].1.is_ok(), "{results:?}");

    assert_eq!(cluster.dest_ids("cc_HostBase", "bk_host_id"), vec![1, 2, 3, 4]);
}

#[tokio::test]
async fn failures_are_reported_per_resource_type() {
    let cluster = Cluster::new().await;

    let mut engine = TransferEngine::new(
        config(2, IdRuleMap::new()),
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

    cluster.src.fail_next(100);

    let results = engine
        .start_full_sync(&[ResType::Host, ResType::Biz], &CancellationToken::new())
        .await;

    assert_eq!(results.len(), 2);
    assert!(
        matches!(
            &results[0],
            (ResType::Host, Err(SyncError::RetriesExhausted { attempts: 4, .. }))
        ),
        "{results:?}"
    );
    assert!(
        matches!(
            &results[1],
            (ResType::Biz, Err(SyncError::UnknownResType(ResType::Biz)))
        ),
        "{results:?}"
    );
}

#[tokio::test]
async fn progress_is_broadcast() {
    let cluster = Cluster::new().await;

    cluster
        .seed_src("cc_HostBase", (1..=3).map(|id| host(id, "src")).collect())
        .await;

    let engine = cluster.engine(2).await;
    let mut progress = engine.subscribe();

    let results = engine.start_full_sync(&[ResType::Host], &CancellationToken::new()).await;
    assert!(results[0].1.is_ok(), "{results:?}");

    let mut windows = 0;
    let mut done = false;
    while let Ok(event) = progress.try_recv() {
        match event {
            SyncProgress::Window { res_type, .. } => {
                assert_eq!(res_type, ResType::Host);
                windows += 1;
            }
            SyncProgress::FullSyncDone { res_type, tenant, .. } => {
                assert_eq!(res_type, ResType::Host);
                assert_eq!(tenant, common::SRC_TENANT);
                done = true;
            }
            other => panic!("unexpected progress {other:?}"),
        }
    }

    assert_eq!(windows, 2);
    assert!(done, "the end of the sync is announced");
}

#[tokio::test]
async fn cancelled_syncs_write_nothing() {
    let cluster = Cluster::new().await;

    cluster
        .seed_src("cc_HostBase", (1..=3).map(|id| host(id, "src")).collect())
        .await;

    let engine = cluster.engine(2).await;

    let cancel = CancellationToken::new();
    cancel.cancel();

    let results = engine
        .start_full_sync(&[ResType::Host, ResType::Biz], &cancel)
        .await;

    assert!(
        matches!(
            results.as_slice(),
            [
                (ResType::Host, Err(SyncError::Cancelled(ResType::Host))),
                (ResType::Biz, Err(SyncError::Cancelled(ResType::Biz))),
            ]
        ),
        "{results:?}"
    );
    assert!(cluster.dest_ids("cc_HostBase", "bk_host_id").is_empty());
}

#[tokio::test(start_paused = true)]
async fn cancellation_stops_after_the_current_window() {
    let cluster = Cluster::new().await;

    cluster
        .seed_src("cc_HostBase", (1..=5).map(|id| host(id, "src")).collect())
        .await;

    let engine = cluster.engine(2).await;

    // the first destination page is retried after 1ms, cancel while it waits
    cluster.dest.fail_next(1);

    let cancel = CancellationToken::new();
    let canceller = async {
        time::sleep(Duration::from_micros(500)).await;
        cancel.cancel();
    };

    let (results, ()) = tokio::join!(
        engine.start_full_sync(&[ResType::Host], &cancel),
        canceller
    );

    assert!(
        matches!(
            results.as_slice(),
            [(ResType::Host, Err(SyncError::Cancelled(ResType::Host)))]
        ),
        "{results:?}"
    );
    assert_eq!(cluster.dest_ids("cc_HostBase", "bk_host_id"), vec![1, 2]);

    let results = engine
        .start_full_sync(&[ResType::Host], &CancellationToken::new())
        .await;
    assert!(results[0].1.is_ok(), "{results:?}");
    assert_eq!(cluster.dest_ids("cc_HostBase", "bk_host_id"), vec![1, 2, 3, 4, 5]);
}

#[tokio::test(start_paused = true)]
async fn recreated_objects_are_resolved_again() {
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
    cluster
        .seed_src(
            "cc_ObjectBase_s1",
            vec![json!({ "bk_inst_id": 1, "bk_obj_id": "switch", "bk_inst_name": "sw-1" })],
        )
        .await;

    let engine = cluster.engine(10).await;

    let results = engine
        .start_full_sync(&[ResType::ObjectInstance], &CancellationToken::new())
        .await;
    assert!(results[0].1.is_ok(), "{results:?}");
    assert_eq!(cluster.dest_ids("cc_ObjectBase_d1", "bk_inst_id"), vec![1]);

    // the object is deleted and created again at the destination
    let _deleted = cluster
        .dest
        .delete("t2_cc_ObjDes", &Filter::eq("bk_obj_id", "switch"))
        .await
        .unwrap();
    cluster
        .seed_dest(
            "cc_ObjDes",
            vec![json!({ "bk_obj_id": "switch", "obj_uuid": "d2", "ispre": false })],
        )
        .await;

    time::advance(OBJECT_UUID_TTL).await;

    let results = engine
        .start_full_sync(&[ResType::ObjectInstance], &CancellationToken::new())
        .await;
    assert!(results[0].1.is_ok(), "{results:?}");
    assert_eq!(cluster.dest_ids("cc_ObjectBase_d2", "bk_inst_id"), vec![1]);
}
