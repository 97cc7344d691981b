use crate::error::SchedulerError;
use crate::scheduler::{Scheduler, SchedulerConfig};
use crate::task::TaskWatchEvent;
use async_trait::async_trait;
use oxtel_common::error::{CoreError, CoreResult, ErrorKind};
use oxtel_common::event::EventBus;
use oxtel_common::manage::{MetricManager, TaskReaper};
use oxtel_common::policy::ConfigMap;
use oxtel_common::types::{
    CollectRequest, Metric, Payload, PluginId, PluginType, ScheduleSpec, TaskManifest, TaskState,
};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// An in-memory stand-in for the plugin catalog.
struct FakeManager {
    known: Vec<String>,
    collects: AtomicUsize,
    publishes: AtomicUsize,
    /// When set, collect calls hang forever to saturate the pipeline.
    stall_collect: bool,
}

impl FakeManager {
    fn new(known: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            known: known.iter().map(|s| s.to_string()).collect(),
            collects: AtomicUsize::new(0),
            publishes: AtomicUsize::new(0),
            stall_collect: false,
        })
    }

    fn stalled(known: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            known: known.iter().map(|s| s.to_string()).collect(),
            collects: AtomicUsize::new(0),
            publishes: AtomicUsize::new(0),
            stall_collect: true,
        })
    }
}

#[async_trait]
impl MetricManager for FakeManager {
    async fn collect_metrics(
        &self,
        requests: &[CollectRequest],
        _config: &ConfigMap,
    ) -> CoreResult<Vec<Metric>> {
        self.collects.fetch_add(1, Ordering::SeqCst);
        if self.stall_collect {
            std::future::pending::<()>().await;
        }
        Ok(requests
            .iter()
            .map(|r| Metric {
                namespace: r.namespace.clone(),
                version: 1,
                data: json!(1),
                tags: Default::default(),
                unit: None,
                timestamp: chrono::Utc::now(),
            })
            .collect())
    }

    async fn process(
        &self,
        _plugin: &PluginId,
        payload: Payload,
        _config: &ConfigMap,
    ) -> CoreResult<Payload> {
        Ok(payload)
    }

    async fn publish(
        &self,
        _plugin: &PluginId,
        _payload: Payload,
        _config: &ConfigMap,
    ) -> CoreResult<()> {
        self.publishes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn validate_requests(&self, requests: &[CollectRequest]) -> CoreResult<()> {
        for r in requests {
            if !self.known.contains(&r.namespace) {
                return Err(CoreError::new(
                    ErrorKind::Validation,
                    format!("unknown metric {}", r.namespace),
                ));
            }
        }
        Ok(())
    }
}

fn manifest(interval_ms: u64, duration_ms: Option<u64>, no_start: bool) -> TaskManifest {
    TaskManifest {
        name: Some("mock-to-file".to_string()),
        schedule: ScheduleSpec {
            interval_ms,
            start: None,
            stop: None,
            duration_ms,
        },
        workflow: json!({
            "collect": {
                "metrics": { "/intel/mock/foo": 0 },
                "publish": [ { "plugin_name": "file", "config": { "file": "/tmp/out" } } ]
            }
        }),
        no_start,
    }
}

fn scheduler_with(cfg: SchedulerConfig, manager: Arc<FakeManager>) -> Arc<Scheduler> {
    Scheduler::new(cfg, manager, Arc::new(EventBus::new()))
}

#[tokio::test(start_paused = true)]
async fn windowed_task_fires_floor_to_ceiling_times_then_ends() {
    let manager = FakeManager::new(&["/intel/mock/foo"]);
    let scheduler = scheduler_with(SchedulerConfig::default(), manager.clone());

    let info = scheduler
        .create(manifest(50, Some(500), false))
        .await
        .unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(700)).await;

    let info = scheduler.get(info.id).unwrap();
    assert_eq!(info.state, TaskState::Ended);
    // floor(500/50) = 10 fires, allow the ceiling+1 margin of the window
    assert!(
        (9..=11).contains(&info.hit_count),
        "unexpected fire count {}",
        info.hit_count
    );
    assert_eq!(info.miss_count, 0);
    assert!(manager.collects.load(Ordering::SeqCst) >= 1);
    let published = manager.publishes.load(Ordering::SeqCst) as u64;
    assert!(published >= info.hit_count - 1);
}

#[tokio::test(start_paused = true)]
async fn saturated_collect_queue_drops_fires_and_errors_the_task() {
    let manager = FakeManager::stalled(&["/intel/mock/foo"]);
    let cfg = SchedulerConfig {
        collect_queue_size: 2,
        collect_workers: 1,
        max_consecutive_drops: 10,
        ..SchedulerConfig::default()
    };
    let scheduler = scheduler_with(cfg, manager);

    // 2ms fires against a 50ms-floor stage deadline: the queue stays
    // full long enough for ten consecutive drops
    let info = scheduler.create(manifest(2, None, false)).await.unwrap();

    tokio::time::sleep(std::time::Duration::from_secs(1)).await;

    let info = scheduler.get(info.id).unwrap();
    assert_eq!(info.state, TaskState::Error);
    assert_eq!(info.last_error.as_deref(), Some("scheduler backpressure"));
    // every dropped fire is counted exactly once, and the loop halts at
    // the threshold
    assert_eq!(info.miss_count, 10);
}

#[tokio::test]
async fn create_rejects_unknown_metrics_and_bad_manifests() {
    let manager = FakeManager::new(&["/intel/mock/foo"]);
    let scheduler = scheduler_with(SchedulerConfig::default(), manager);

    let mut bad_metric = manifest(100, None, true);
    bad_metric.workflow = json!({
        "collect": {
            "metrics": { "/intel/unknown/qux": 0 },
            "publish": [ { "plugin_name": "file" } ]
        }
    });
    assert!(scheduler.create(bad_metric).await.is_err());

    let mut dry_run = manifest(100, None, true);
    dry_run.workflow = json!({
        "collect": { "metrics": { "/intel/mock/foo": 0 } }
    });
    assert!(scheduler.create(dry_run).await.is_err());

    let mut past_stop = manifest(100, None, true);
    past_stop.schedule.stop = Some(chrono::Utc::now() - chrono::Duration::seconds(5));
    assert!(scheduler.create(past_stop).await.is_err());
}

#[tokio::test]
async fn no_start_tasks_wait_for_an_explicit_start() {
    let manager = FakeManager::new(&["/intel/mock/foo"]);
    let scheduler = scheduler_with(SchedulerConfig::default(), manager);

    let info = scheduler.create(manifest(100, None, true)).await.unwrap();
    assert_eq!(info.state, TaskState::Created);

    let info = scheduler.start(info.id).unwrap();
    assert!(matches!(info.state, TaskState::Spinning | TaskState::Running));

    let info = scheduler.stop(info.id).unwrap();
    assert_eq!(info.state, TaskState::Stopped);
}

#[tokio::test]
async fn enable_recovers_an_errored_task_to_stopped() {
    let manager = FakeManager::new(&["/intel/mock/foo"]);
    let scheduler = scheduler_with(SchedulerConfig::default(), manager);

    let info = scheduler.create(manifest(100, None, true)).await.unwrap();
    let handle = scheduler.task(info.id).unwrap();
    handle.set_error("boom");
    assert_eq!(scheduler.get(info.id).unwrap().state, TaskState::Error);
    assert!(scheduler.start(info.id).is_err());

    let info = scheduler.enable(info.id).unwrap();
    assert_eq!(info.state, TaskState::Stopped);
    scheduler.start(info.id).unwrap();
}

#[tokio::test]
async fn zero_interval_schedules_are_rejected() {
    let manager = FakeManager::new(&["/intel/mock/foo"]);
    let scheduler = scheduler_with(SchedulerConfig::default(), manager);

    let err = scheduler.create(manifest(0, None, true)).await.unwrap_err();
    assert!(matches!(err, SchedulerError::BadSchedule(_)));
    assert!(scheduler.list().is_empty());
}

#[tokio::test]
async fn remove_withdraws_the_task() {
    let manager = FakeManager::new(&["/intel/mock/foo"]);
    let scheduler = scheduler_with(SchedulerConfig::default(), manager);

    let info = scheduler.create(manifest(100, None, true)).await.unwrap();
    scheduler.remove(info.id).unwrap();
    assert!(scheduler.get(info.id).is_err());
    assert!(scheduler.remove(info.id).is_err());
    assert!(scheduler.list().is_empty());
}

#[tokio::test]
async fn reaper_stops_tasks_referencing_an_unloaded_plugin() {
    let manager = FakeManager::new(&["/intel/mock/foo"]);
    let scheduler = scheduler_with(SchedulerConfig::default(), manager);

    let info = scheduler.create(manifest(100, None, false)).await.unwrap();
    assert!(matches!(
        scheduler.get(info.id).unwrap().state,
        TaskState::Spinning | TaskState::Running
    ));

    let stopped = scheduler
        .stop_tasks_for_plugin(&PluginId::latest(PluginType::Publisher, "file"))
        .await;
    assert_eq!(stopped, vec![info.id]);
    assert_eq!(scheduler.get(info.id).unwrap().state, TaskState::Stopped);

    // an unrelated plugin reaps nothing
    scheduler.start(info.id).unwrap();
    let stopped = scheduler
        .stop_tasks_for_plugin(&PluginId::latest(PluginType::Publisher, "statsd"))
        .await;
    assert!(stopped.is_empty());
}

#[tokio::test]
async fn watchers_observe_lifecycle_and_fires() {
    let manager = FakeManager::new(&["/intel/mock/foo"]);
    let scheduler = scheduler_with(SchedulerConfig::default(), manager);

    let info = scheduler.create(manifest(100, None, true)).await.unwrap();
    let mut watch = scheduler.watch(info.id).unwrap();
    scheduler.start(info.id).unwrap();

    let event = watch.recv().await.unwrap();
    assert!(matches!(
        event,
        TaskWatchEvent::StateChange {
            state: TaskState::Spinning
        }
    ));

    scheduler.stop(info.id).unwrap();
    let event = watch.recv().await.unwrap();
    assert!(matches!(
        event,
        TaskWatchEvent::StateChange { .. } | TaskWatchEvent::Fired { .. }
    ));
}
