//! End-to-end worker scenarios: tasks put on a site queue are harvested into the local site by
//! pools the worker manager keeps for each remote site.

mod common;

use common::{MockFactory, MockSite};
use sitesync_repl::adapter::{AdapterError, Metadata, NodeAdapterRegistry};
use sitesync_repl::task_info::{DdfMetadataInfo, MetadataInfo, ResourceInfo};
use sitesync_repl::{
    ErrorCode, InMemorySiteManager, OperationType, QueueBroker, ReplicationProperties, Site,
    SiteKind, SiteType, State, SystemClock, TaskEvent, TaskInfo, TaskOutcome, WorkerManager,
};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

struct Harness {
    local: Arc<MockSite>,
    remote: Arc<MockSite>,
    sites: Arc<InMemorySiteManager>,
    broker: Arc<QueueBroker>,
    manager: WorkerManager,
}

async fn harness() -> Harness {
    let local = MockSite::new("local");
    let remote = MockSite::new("remote");
    let factory = MockFactory::new();
    factory.add("mock://local", local.clone());
    factory.add("mock://remote", remote.clone());

    let adapters = Arc::new(NodeAdapterRegistry::new());
    adapters.register(SiteType::Ddf, factory).unwrap();

    let sites = Arc::new(InMemorySiteManager::new());
    sites.save(Site::new("local", "mock://local", SiteType::Ddf, SiteKind::Regional));
    sites.save(Site::new("remote", "mock://remote", SiteType::Ddf, SiteKind::Tactical));

    let broker = Arc::new(QueueBroker::new(16, Arc::new(SystemClock)));
    let props = ReplicationProperties {
        local_site: "local".to_string(),
        unlock_backoff_ms: 10,
        ..ReplicationProperties::default()
    };
    let manager = WorkerManager::new(broker.clone(), sites.clone(), adapters, &props)
        .await
        .unwrap();
    manager.monitor_sites().await.unwrap();

    Harness {
        local,
        remote,
        sites,
        broker,
        manager,
    }
}

fn harvest(intel_id: &str) -> TaskInfo {
    TaskInfo::new(intel_id, 5, OperationType::Harvest, Utc::now()).with_metadata(MetadataInfo::Ddf(
        DdfMetadataInfo {
            metadata_type: "xml".to_string(),
            last_modified: Utc::now(),
            size: 6,
            data_class: "String".to_string(),
            data: serde_json::json!("<doc/>"),
        },
    ))
}

async fn next_event(rx: &mut broadcast::Receiver<TaskEvent>) -> TaskEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("no task event within 5s")
        .expect("event channel closed")
}

#[tokio::test]
async fn test_manager_creates_pool_for_remote_only() {
    let h = harness().await;
    let sizes = h.manager.pool_sizes().await;
    assert_eq!(sizes.len(), 1);
    assert_eq!(sizes.get("remote"), Some(&1));
    h.manager.stop().await;
}

#[tokio::test]
async fn test_harvest_metadata_completes() {
    let h = harness().await;
    h.remote.put(Metadata::new("intel-1", "xml", Utc::now()));
    let queue = h.broker.site_queue("remote");
    let mut events = queue.subscribe();

    queue.put(harvest("intel-1")).await;
    let event = next_event(&mut events).await;

    assert_eq!(event.site, "remote");
    assert_eq!(event.outcome, TaskOutcome::Completed);
    assert_eq!(event.task.state(), State::Successful);
    let created = h.local.get("intel-1").unwrap();
    assert_eq!(created.metadata_type, "xml");
    assert_eq!(created.metadata_modified, event.task.metadatas()[0].last_modified().unwrap());
    assert_eq!(h.local.calls_named("create intel-1"), 1);
    assert!(queue.is_empty());
    h.manager.stop().await;
}

#[tokio::test]
async fn test_harvest_resource_completes() {
    let h = harness().await;
    h.remote.put(Metadata::new("intel-2", "xml", Utc::now()).with_resource("mock://remote/r2", 64, Utc::now()));
    let queue = h.broker.site_queue("remote");
    let mut events = queue.subscribe();

    let info = harvest("intel-2").with_resource(ResourceInfo {
        uri: Some("mock://remote/r2".to_string()),
        last_modified: Utc::now(),
        size: 64,
    });
    queue.put(info).await;
    let event = next_event(&mut events).await;

    assert_eq!(event.outcome, TaskOutcome::Completed);
    assert_eq!(h.remote.calls_named("read intel-2"), 1);
    assert_eq!(h.local.calls_named("create_resource intel-2"), 1);
    assert_eq!(h.local.calls_named("create intel-2"), 0);
    h.manager.stop().await;
}

#[tokio::test]
async fn test_deleted_at_source_fails_without_retry() {
    let h = harness().await;
    let queue = h.broker.site_queue("remote");
    let mut events = queue.subscribe();

    queue.put(harvest("gone")).await;
    let event = next_event(&mut events).await;

    match event.outcome {
        TaskOutcome::Failed(failure) => {
            assert_eq!(failure.code, ErrorCode::NoLongerExists);
            assert_eq!(failure.reason, "Metadata deleted from site remote before able to create");
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(event.task.state(), State::Failed);
    assert_eq!(h.local.len(), 0);
    h.manager.stop().await;
}

#[tokio::test]
async fn test_rejected_create_fails() {
    let h = harness().await;
    h.remote.put(Metadata::new("intel-3", "xml", Utc::now()));
    h.local.set_writes_succeed(false);
    let queue = h.broker.site_queue("remote");
    let mut events = queue.subscribe();

    queue.put(harvest("intel-3")).await;
    let event = next_event(&mut events).await;

    match event.outcome {
        TaskOutcome::Failed(failure) => {
            assert_eq!(failure.code, ErrorCode::OperationFailure);
            assert_eq!(failure.reason, "Failed to HARVEST metadata intel-3 from remote to local");
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    h.manager.stop().await;
}

#[tokio::test]
async fn test_unavailable_site_requeues() {
    let h = harness().await;
    h.remote.set_available(false);
    let queue = h.broker.site_queue("remote");
    let mut events = queue.subscribe();

    queue.put(harvest("intel-4")).await;
    let event = next_event(&mut events).await;

    match event.outcome {
        TaskOutcome::Requeued(failure) => {
            assert_eq!(failure.code, ErrorCode::SiteUnavailable);
            assert_eq!(failure.reason, "Site remote is unavailable");
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(event.task.state(), State::Pending);
    assert_eq!(event.task.total_attempts(), 2);
    h.manager.stop().await;
}

#[tokio::test]
async fn test_unsupported_task_is_unlocked() {
    let h = harness().await;
    let queue = h.broker.site_queue("remote");
    let mut events = queue.subscribe();

    queue
        .put(TaskInfo::new("intel-5", 5, OperationType::Delete, Utc::now()))
        .await;
    let event = next_event(&mut events).await;

    assert_eq!(event.outcome, TaskOutcome::Unlocked);
    assert_eq!(event.task.total_attempts(), 1);
    assert_eq!(queue.size(), 1);
    h.manager.stop().await;

    assert!(h.manager.site_metrics().await.is_empty());
    assert_eq!(h.local.calls_named("create"), 0);
}

#[tokio::test]
async fn test_interrupted_adapter_call_keeps_worker_draining() {
    let h = harness().await;
    h.remote.put(Metadata::new("intel-7", "xml", Utc::now()));
    h.remote.put(Metadata::new("intel-8", "xml", Utc::now()));
    h.remote.set_exists(Some(Err(AdapterError::Interrupted)));
    let queue = h.broker.site_queue("remote");
    let mut events = queue.subscribe();

    queue.put(harvest("intel-7")).await;
    let event = next_event(&mut events).await;
    assert_eq!(event.outcome, TaskOutcome::Unlocked);

    h.remote.set_exists(None);
    queue.put(harvest("intel-8")).await;
    let mut completed = Vec::new();
    while completed.len() < 2 {
        let event = next_event(&mut events).await;
        if event.outcome == TaskOutcome::Completed {
            completed.push(event.task.intel_id().to_string());
        }
    }
    completed.sort();
    assert_eq!(completed, vec!["intel-7", "intel-8"]);
    assert!(queue.is_empty());

    let pool = h.manager.pool("remote").await.unwrap();
    assert_eq!(pool.size(), 1);
    assert_eq!(pool.stats().workers_started, 1);
    assert!(pool.worker_stats().interrupted >= 1);
    h.manager.stop().await;
}

#[tokio::test]
async fn test_removed_site_loses_its_pool() {
    let h = harness().await;
    let pool = h.manager.pool("remote").await.unwrap();
    h.sites.remove("remote");
    h.manager.monitor_sites().await.unwrap();

    assert!(h.manager.pool_sizes().await.is_empty());
    assert!(pool.is_shutdown());
    // the worker's local adapter is closed when it exits
    assert_eq!(h.local.closed(), 1);
    h.manager.stop().await;
}

#[tokio::test]
async fn test_site_metrics_after_harvest() {
    let h = harness().await;
    h.remote.put(Metadata::new("intel-6", "xml", Utc::now()));
    let queue = h.broker.site_queue("remote");
    let mut events = queue.subscribe();
    queue.put(harvest("intel-6")).await;
    next_event(&mut events).await;

    let metrics = h.manager.site_metrics().await;
    assert_eq!(metrics.len(), 1);
    assert_eq!(metrics[0].site_id, "remote");
    assert_eq!(metrics[0].queue.succeeded, 1);
    assert_eq!(metrics[0].pool_size, 1);
    h.manager.stop().await;
}
