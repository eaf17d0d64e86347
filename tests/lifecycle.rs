//! Runtime lifecycle against an in-memory cluster with a simulated scheduler

use std::collections::BTreeMap;
use std::sync::Arc;

use cacheplane::cluster::{CacheRuntime, EngineType, InMemoryCluster, Node, RuntimeInfo};
use cacheplane::engine::{EngineContext, EngineError, EngineLifecycleController, ShutdownStage};
use cacheplane::engines::backend_for;
use cacheplane::placement::labels::{dataset_num, STORAGE_PREFIX};
use cacheplane::ports::{
    AllocationStrategy, PortAllocatorHandle, PortError, PortRange, StaticReservedPorts,
    ValuesConfigMapScanner,
};
use cacheplane::reconciler::Reconciler;

fn scheduled_cluster(nodes: &[&str]) -> Arc<InMemoryCluster> {
    let cluster = Arc::new(InMemoryCluster::new().with_simulated_scheduler());
    for node in nodes {
        cluster.insert_node(Node::new(*node));
    }
    cluster
}

async fn ports(min: u16, max: u16) -> Arc<PortAllocatorHandle> {
    let handle = Arc::new(PortAllocatorHandle::new());
    handle
        .setup(
            PortRange::new(min, max).unwrap(),
            AllocationStrategy::Bitmap,
            &StaticReservedPorts::default(),
        )
        .await
        .unwrap();
    handle
}

/// Runtime presence markers (`fluid.io/s-<engine>-...=true`) on a node
fn runtime_markers(labels: &BTreeMap<String, String>) -> u32 {
    labels
        .iter()
        .filter(|(key, value)| {
            value.as_str() == "true"
                && ["alluxio", "juicefs"]
                    .iter()
                    .any(|engine| key.starts_with(&format!("{}{}-", STORAGE_PREFIX, engine)))
        })
        .count() as u32
}

fn assert_dataset_num_matches_markers(cluster: &InMemoryCluster, nodes: &[&str]) {
    for node in nodes {
        let labels = cluster.node(node).unwrap().labels().clone();
        assert_eq!(
            dataset_num(&labels),
            runtime_markers(&labels),
            "{} labels out of step: {:?}",
            node,
            labels
        );
    }
}

fn set_workers(cluster: &InMemoryCluster, name: &str, replicas: u32) {
    let mut runtime = cluster.runtime("default", name).unwrap();
    runtime.spec.worker.replicas = replicas;
    cluster.insert_runtime(runtime);
}

fn controller(
    cluster: &Arc<InMemoryCluster>,
    ports: Arc<PortAllocatorHandle>,
    runtime: &CacheRuntime,
) -> EngineLifecycleController {
    cluster.insert_runtime(runtime.clone());
    let ctx = EngineContext::new(cluster.clone(), cluster.clone(), ports);
    let info = RuntimeInfo::from_runtime(runtime, None);
    EngineLifecycleController::new(ctx, backend_for(runtime.spec.engine), info)
}

#[tokio::test]
async fn test_port_exhaustion_blocks_second_runtime_until_first_shuts_down() {
    let cluster = scheduled_cluster(&["n1"]);
    let handle = ports(14000, 14003).await;
    let allocator = handle.get_runtime_port_allocator().unwrap();

    let hbase = CacheRuntime::new("default", "hbase", EngineType::Alluxio);
    let hadoop = CacheRuntime::new("default", "hadoop", EngineType::Alluxio);
    let mut first = controller(&cluster, handle.clone(), &hbase);
    let second = controller(&cluster, handle.clone(), &hadoop);

    first.setup().await.unwrap();
    assert_eq!(allocator.allocated(), 4);

    let err = second.setup().await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::Port(PortError::InsufficientPorts {
            requested: 4,
            available: 0
        })
    ));
    assert!(err.is_precondition());
    assert!(cluster.release("default", "hadoop").is_none());
    assert!(cluster.config_map("default", "hadoop-alluxio-values").is_none());

    first.shutdown().await.unwrap();
    assert_eq!(allocator.allocated(), 0);

    second.setup().await.unwrap();
    assert_eq!(allocator.allocated(), 4);
    assert!(cluster.release("default", "hadoop").is_some());
}

#[tokio::test]
async fn test_shutdown_resumes_without_repeating_teardown() {
    let cluster = scheduled_cluster(&["n1", "n2"]);
    let handle = ports(20000, 20009).await;
    let runtime = CacheRuntime::new("default", "hbase", EngineType::Alluxio).with_workers(2);
    let mut controller = controller(&cluster, handle.clone(), &runtime);

    controller.setup().await.unwrap();
    let synced = controller.sync_schedule_info().await.unwrap();
    assert_eq!(synced.added.len(), 2);

    // allocator lost mid-shutdown: the port step cannot run
    handle.teardown();
    let err = controller.shutdown().await.unwrap_err();
    assert!(matches!(err, EngineError::Port(PortError::NotInitialized)));
    assert_eq!(controller.shutdown_progress().stage, ShutdownStage::ReleasePorts);
    assert!(cluster.release("default", "hbase").is_none());
    let writes = cluster.total_node_writes();

    // a restarted allocator rediscovers the runtime's ports from its values
    handle
        .setup(
            PortRange::new(20000, 20009).unwrap(),
            AllocationStrategy::Bitmap,
            &ValuesConfigMapScanner::new(cluster.clone()),
        )
        .await
        .unwrap();
    let allocator = handle.get_runtime_port_allocator().unwrap();
    assert_eq!(allocator.allocated(), 4);

    controller.shutdown().await.unwrap();
    assert_eq!(controller.shutdown_progress().stage, ShutdownStage::Done);
    assert_eq!(allocator.allocated(), 0);
    assert_eq!(cluster.total_node_writes(), writes);
    assert!(cluster.config_map("default", "hbase-alluxio-values").is_none());

    // finished shutdown is a no-op
    controller.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_setup_retries_do_not_leak_ports() {
    let cluster = scheduled_cluster(&["n1"]);
    let handle = ports(20000, 20009).await;
    let allocator = handle.get_runtime_port_allocator().unwrap();
    cluster.insert_runtime(CacheRuntime::new("default", "hbase", EngineType::Alluxio));
    cluster.fail_next_installs(2);
    let reconciler = Reconciler::new(EngineContext::new(
        cluster.clone(),
        cluster.clone(),
        handle.clone(),
    ));

    for _ in 0..2 {
        let summary = reconciler.reconcile_all().await.unwrap();
        assert_eq!(summary.requeued, 1);
        assert_eq!(allocator.allocated(), 4);
    }

    let summary = reconciler.reconcile_all().await.unwrap();
    assert_eq!(summary.running, 1);
    assert_eq!(allocator.allocated(), 4);
}

#[tokio::test]
async fn test_schedule_sync_is_write_free_when_settled() {
    let cluster = scheduled_cluster(&["n1", "n2", "n3"]);
    let handle = ports(20000, 20009).await;
    let runtime = CacheRuntime::new("default", "hbase", EngineType::Juicefs).with_workers(3);
    let controller = controller(&cluster, handle, &runtime);

    controller.setup().await.unwrap();
    let first = controller.sync_schedule_info().await.unwrap();
    assert_eq!(first.added, vec!["n1", "n2", "n3"]);
    let writes = cluster.total_node_writes();

    let second = controller.sync_schedule_info().await.unwrap();
    assert!(second.is_empty());
    assert_eq!(cluster.total_node_writes(), writes);
}

#[tokio::test]
async fn test_schedule_sync_unlabels_nodes_workers_left() {
    let cluster = scheduled_cluster(&["n1", "n2"]);
    let handle = ports(20000, 20009).await;
    let hbase = CacheRuntime::new("default", "hbase", EngineType::Juicefs).with_workers(2);
    let hadoop = CacheRuntime::new("default", "hadoop", EngineType::Juicefs).with_workers(2);
    let first = controller(&cluster, handle.clone(), &hbase);
    let second = controller(&cluster, handle, &hadoop);

    first.setup().await.unwrap();
    assert_eq!(first.sync_schedule_info().await.unwrap().added, vec!["n1", "n2"]);
    second.setup().await.unwrap();
    assert_eq!(second.sync_schedule_info().await.unwrap().added, vec!["n1", "n2"]);
    assert_eq!(cluster.node("n2").unwrap().labels()["fluid.io/dataset-num"], "2");

    // hbase-worker-1 on n2 goes away
    let mut worker = cluster.workload("default", "hbase-worker").unwrap();
    worker.spec.replicas = Some(1);
    cluster.insert_workload(worker);

    let synced = first.sync_schedule_info().await.unwrap();
    assert!(synced.added.is_empty());
    assert_eq!(synced.removed, vec!["n2"]);
    let n1 = cluster.node("n1").unwrap().labels().clone();
    let n2 = cluster.node("n2").unwrap().labels().clone();
    assert_eq!(dataset_num(&n1), 2);
    assert_eq!(dataset_num(&n2), 1);
    assert_eq!(runtime_markers(&n2), 1);
    assert_dataset_num_matches_markers(&cluster, &["n1", "n2"]);

    // the remaining runtime leaving n2 drops the count label entirely
    let mut worker = cluster.workload("default", "hadoop-worker").unwrap();
    worker.spec.replicas = Some(1);
    cluster.insert_workload(worker);
    assert_eq!(second.sync_schedule_info().await.unwrap().removed, vec!["n2"]);
    assert!(!cluster
        .node("n2")
        .unwrap()
        .labels()
        .contains_key("fluid.io/dataset-num"));
    assert_dataset_num_matches_markers(&cluster, &["n1", "n2"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_teardown_interleaved_with_setup_and_scaling_keeps_counts() {
    let nodes = ["n1", "n2", "n3"];
    let cluster = scheduled_cluster(&nodes);
    for node in nodes {
        cluster.inject_conflicts(node, 2);
    }
    let handle = ports(20000, 20099).await;
    // one context, so every controller shares the scheduler lock
    let ctx = EngineContext::new(cluster.clone(), cluster.clone(), handle);
    let new_controller = |runtime: CacheRuntime| {
        cluster.insert_runtime(runtime.clone());
        let info = RuntimeInfo::from_runtime(&runtime, None);
        EngineLifecycleController::new(ctx.clone(), backend_for(runtime.spec.engine), info)
    };

    let hbase = new_controller(
        CacheRuntime::new("default", "hbase", EngineType::Juicefs).with_workers(3),
    );
    let mut hadoop = new_controller(
        CacheRuntime::new("default", "hadoop", EngineType::Juicefs).with_workers(2),
    );
    let spark = new_controller(
        CacheRuntime::new("default", "spark", EngineType::Juicefs).with_workers(2),
    );
    for controller in [&hbase, &hadoop] {
        controller.setup().await.unwrap();
        controller.sync_schedule_info().await.unwrap();
    }
    assert_dataset_num_matches_markers(&cluster, &nodes);
    set_workers(&cluster, "hadoop", 3);

    let labeler = ctx.labeler.clone();
    let hbase_info = hbase.info().clone();
    let teardown = tokio::spawn(async move { labeler.tear_down_workers(&hbase_info).await });
    let scale = tokio::spawn(async move {
        hadoop.sync_replicas().await?;
        hadoop.sync_schedule_info().await?;
        Ok::<_, EngineError>(hadoop)
    });
    let setup = tokio::spawn(async move {
        spark.setup().await?;
        spark.sync_schedule_info().await?;
        Ok::<_, EngineError>(spark)
    });

    teardown.await.unwrap().unwrap();
    let hadoop = scale.await.unwrap().unwrap();
    let spark = setup.await.unwrap().unwrap();

    // settle anything the teardown raced past
    hadoop.sync_schedule_info().await.unwrap();
    spark.sync_schedule_info().await.unwrap();
    assert_dataset_num_matches_markers(&cluster, &nodes);

    assert_eq!(
        cluster.workload("default", "hbase-worker").unwrap().spec.replicas,
        Some(0)
    );
    let hbase_marker = cacheplane::placement::PlacementLabels::for_runtime(hbase.info()).runtime;
    for node in nodes {
        assert!(!cluster.node(node).unwrap().labels().contains_key(&hbase_marker));
    }
    assert_eq!(
        cluster.workload("default", "hadoop-worker").unwrap().spec.replicas,
        Some(3)
    );
    assert_eq!(hadoop.sync_schedule_info().await.unwrap().added.len(), 0);
}

