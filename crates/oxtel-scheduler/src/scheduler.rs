//! The scheduler: task table, per-task firing loops, and the three
//! bounded worker pools a firing flows through.

use crate::error::{Result, SchedulerError};
use crate::exec::{CollectJob, ProcessJob, PublishJob};
use crate::queue::{work_pool, WorkQueue};
use crate::schedule::Schedule;
use crate::task::{TaskHandle, TaskRecord, TaskWatchEvent};
use crate::workflow::Workflow;
use async_trait::async_trait;
use chrono::Utc;
use oxtel_common::event::{Event, EventBus};
use oxtel_common::manage::{MetricManager, TaskReaper};
use oxtel_common::types::{PluginId, TaskInfo, TaskManifest, TaskState};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub collect_queue_size: usize,
    pub process_queue_size: usize,
    pub publish_queue_size: usize,
    pub collect_workers: usize,
    pub process_workers: usize,
    pub publish_workers: usize,
    /// Consecutive dropped fires before a task errors out with
    /// scheduler backpressure.
    pub max_consecutive_drops: u32,
    /// Consecutive branch failures before a task errors out.
    pub max_consecutive_failures: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            collect_queue_size: 25,
            process_queue_size: 25,
            publish_queue_size: 25,
            collect_workers: 4,
            process_workers: 4,
            publish_workers: 4,
            max_consecutive_drops: 10,
            max_consecutive_failures: 5,
        }
    }
}

pub struct Scheduler {
    pub(crate) cfg: SchedulerConfig,
    pub(crate) manager: Arc<dyn MetricManager>,
    events: Arc<EventBus>,
    tasks: RwLock<HashMap<Uuid, Arc<TaskHandle>>>,
    collect_queue: OnceLock<WorkQueue<CollectJob>>,
    process_queue: OnceLock<WorkQueue<ProcessJob>>,
    publish_queue: OnceLock<WorkQueue<PublishJob>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    firing_loops: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(
        cfg: SchedulerConfig,
        manager: Arc<dyn MetricManager>,
        events: Arc<EventBus>,
    ) -> Arc<Self> {
        let scheduler = Arc::new(Self {
            cfg,
            manager,
            events,
            tasks: RwLock::new(HashMap::new()),
            collect_queue: OnceLock::new(),
            process_queue: OnceLock::new(),
            publish_queue: OnceLock::new(),
            workers: Mutex::new(Vec::new()),
            firing_loops: Mutex::new(Vec::new()),
        });
        scheduler.start_workers();
        scheduler
    }

    fn start_workers(self: &Arc<Self>) {
        let mut handles = Vec::new();

        let weak = Arc::downgrade(self);
        let (publish_queue, mut h) = work_pool(
            "publish",
            self.cfg.publish_queue_size,
            self.cfg.publish_workers,
            move |job: PublishJob| {
                let weak = weak.clone();
                async move {
                    if let Some(scheduler) = weak.upgrade() {
                        scheduler.handle_publish(job).await;
                    }
                }
            },
        );
        handles.append(&mut h);
        self.publish_queue
            .set(publish_queue)
            .unwrap_or_else(|_| unreachable!("publish queue initialized twice"));

        let weak = Arc::downgrade(self);
        let (process_queue, mut h) = work_pool(
            "process",
            self.cfg.process_queue_size,
            self.cfg.process_workers,
            move |job: ProcessJob| {
                let weak = weak.clone();
                async move {
                    if let Some(scheduler) = weak.upgrade() {
                        scheduler.handle_process(job).await;
                    }
                }
            },
        );
        handles.append(&mut h);
        self.process_queue
            .set(process_queue)
            .unwrap_or_else(|_| unreachable!("process queue initialized twice"));

        let weak = Arc::downgrade(self);
        let (collect_queue, mut h) = work_pool(
            "collect",
            self.cfg.collect_queue_size,
            self.cfg.collect_workers,
            move |job: CollectJob| {
                let weak = weak.clone();
                async move {
                    if let Some(scheduler) = weak.upgrade() {
                        scheduler.handle_collect(job).await;
                    }
                }
            },
        );
        handles.append(&mut h);
        self.collect_queue
            .set(collect_queue)
            .unwrap_or_else(|_| unreachable!("collect queue initialized twice"));

        let mut workers = self.workers.lock().unwrap_or_else(|p| p.into_inner());
        *workers = handles;
    }

    pub(crate) fn collect_queue(&self) -> &WorkQueue<CollectJob> {
        self.collect_queue.get().expect("scheduler started")
    }

    pub(crate) fn process_queue(&self) -> &WorkQueue<ProcessJob> {
        self.process_queue.get().expect("scheduler started")
    }

    pub(crate) fn publish_queue(&self) -> &WorkQueue<PublishJob> {
        self.publish_queue.get().expect("scheduler started")
    }

    pub(crate) fn task(&self, id: Uuid) -> Option<Arc<TaskHandle>> {
        let tasks = self.tasks.read().unwrap_or_else(|p| p.into_inner());
        tasks.get(&id).cloned()
    }

    /// Admit a task: validate the workflow and schedule, check every
    /// requested metric against the catalog, and auto-start unless the
    /// manifest says otherwise.
    pub async fn create(&self, manifest: TaskManifest) -> Result<TaskInfo> {
        self.create_with_id(Uuid::new_v4(), manifest).await
    }

    /// Like `create`, but with a caller-chosen id. Replicated tasks keep
    /// their originating id so the cluster converges on one record.
    pub async fn create_with_id(&self, id: Uuid, manifest: TaskManifest) -> Result<TaskInfo> {
        let workflow = Workflow::parse(&manifest.workflow)?;
        let schedule = Schedule::from_spec(&manifest.schedule, Utc::now())?;
        self.manager.validate_requests(&workflow.requests())?;

        {
            let tasks = self.tasks.read().unwrap_or_else(|p| p.into_inner());
            if tasks.contains_key(&id) {
                return Err(SchedulerError::Core(oxtel_common::error::CoreError::new(
                    oxtel_common::error::ErrorKind::Conflict,
                    format!("task {id} already exists"),
                )));
            }
        }

        let record = TaskRecord {
            id,
            name: manifest.name.clone(),
            schedule,
            workflow,
            manifest: manifest.clone(),
            state: TaskState::Created,
            created_at: Utc::now(),
            hit_count: 0,
            drop_count: 0,
            consecutive_drops: 0,
            failure_count: 0,
            consecutive_failures: 0,
            last_fire: None,
            last_error: None,
            stop_tx: None,
        };
        let handle = Arc::new(TaskHandle::new(record));
        {
            let mut tasks = self.tasks.write().unwrap_or_else(|p| p.into_inner());
            tasks.insert(id, handle.clone());
        }

        tracing::info!(task_id = %id, name = ?manifest.name, "task created");
        self.events.publish(&Event::TaskCreated { id, manifest });

        let no_start = {
            let record = handle.record.lock().unwrap_or_else(|p| p.into_inner());
            record.manifest.no_start
        };
        if !no_start {
            self.start(id)?;
        }
        Ok(handle.info())
    }

    /// Start (or restart) a task's firing loop.
    pub fn start(&self, id: Uuid) -> Result<TaskInfo> {
        let handle = self.task(id).ok_or(SchedulerError::TaskNotFound(id))?;
        let state = handle.state();
        match state {
            TaskState::Created | TaskState::Stopped => {}
            TaskState::Spinning | TaskState::Running => return Ok(handle.info()),
            TaskState::Ended | TaskState::Disabled | TaskState::Error => {
                return Err(SchedulerError::InvalidTransition {
                    id,
                    action: "start",
                    state,
                })
            }
        }

        let schedule = {
            let record = handle.record.lock().unwrap_or_else(|p| p.into_inner());
            record.schedule.clone()
        };

        handle.set_state(TaskState::Spinning);
        self.events.publish(&Event::TaskStarted { id });

        let (stop_tx, stop_rx) = watch::channel(false);
        {
            let mut record = handle.record.lock().unwrap_or_else(|p| p.into_inner());
            record.stop_tx = Some(stop_tx);
        }

        let loop_handle = tokio::spawn(Self::firing_loop(
            handle.clone(),
            self.collect_queue().clone(),
            self.cfg.max_consecutive_drops,
            schedule,
            stop_rx,
        ));
        let mut loops = self.firing_loops.lock().unwrap_or_else(|p| p.into_inner());
        loops.retain(|h| !h.is_finished());
        loops.push(loop_handle);

        Ok(handle.info())
    }

    async fn firing_loop(
        task: Arc<TaskHandle>,
        queue: WorkQueue<CollectJob>,
        max_drops: u32,
        schedule: Schedule,
        mut stop_rx: watch::Receiver<bool>,
    ) {
        let task_id = task.info().id;

        if let Some(delay) = schedule.until_start(Utc::now()) {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = stop_rx.changed() => return,
            }
        }

        let mut tick = tokio::time::interval(schedule.interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = stop_rx.changed() => break,
            }

            match task.state() {
                TaskState::Spinning | TaskState::Running => {}
                _ => break,
            }
            if schedule.expired(Utc::now()) {
                task.set_state(TaskState::Ended);
                tracing::info!(task_id = %task_id, "task schedule expired");
                break;
            }

            if queue.try_push(CollectJob { task_id }).is_ok() {
                task.record_fire();
                if task.state() == TaskState::Spinning {
                    task.set_state(TaskState::Running);
                }
            } else {
                let drops = task.record_drop();
                if drops >= max_drops {
                    tracing::warn!(
                        task_id = %task_id,
                        drops,
                        "collect queue saturated, task errored"
                    );
                    task.set_error("scheduler backpressure");
                    break;
                }
            }
        }
    }

    /// Stop a running task. In-flight work is discarded at the next stage
    /// boundary.
    pub fn stop(&self, id: Uuid) -> Result<TaskInfo> {
        let handle = self.task(id).ok_or(SchedulerError::TaskNotFound(id))?;
        let state = handle.state();
        match state {
            TaskState::Spinning | TaskState::Running => {}
            TaskState::Stopped => return Ok(handle.info()),
            _ => {
                return Err(SchedulerError::InvalidTransition {
                    id,
                    action: "stop",
                    state,
                })
            }
        }
        self.halt(&handle, TaskState::Stopped);
        self.events.publish(&Event::TaskStopped { id });
        Ok(handle.info())
    }

    /// Re-admit a disabled or errored task; it returns to `stopped` and
    /// must be started explicitly.
    pub fn enable(&self, id: Uuid) -> Result<TaskInfo> {
        let handle = self.task(id).ok_or(SchedulerError::TaskNotFound(id))?;
        let state = handle.state();
        match state {
            TaskState::Disabled | TaskState::Error => {}
            _ => {
                return Err(SchedulerError::InvalidTransition {
                    id,
                    action: "enable",
                    state,
                })
            }
        }
        {
            let mut record = handle.record.lock().unwrap_or_else(|p| p.into_inner());
            record.consecutive_drops = 0;
            record.consecutive_failures = 0;
        }
        handle.set_state(TaskState::Stopped);
        Ok(handle.info())
    }

    /// Take a task out of rotation until manually re-enabled.
    pub fn disable(&self, id: Uuid) -> Result<TaskInfo> {
        let handle = self.task(id).ok_or(SchedulerError::TaskNotFound(id))?;
        self.halt(&handle, TaskState::Disabled);
        Ok(handle.info())
    }

    /// Remove a task entirely, cancelling any firing loop.
    pub fn remove(&self, id: Uuid) -> Result<TaskInfo> {
        let handle = {
            let mut tasks = self.tasks.write().unwrap_or_else(|p| p.into_inner());
            tasks.remove(&id)
        }
        .ok_or(SchedulerError::TaskNotFound(id))?;
        self.halt(&handle, TaskState::Stopped);
        let info = handle.info();
        tracing::info!(task_id = %id, "task removed");
        self.events.publish(&Event::TaskRemoved { id });
        Ok(info)
    }

    fn halt(&self, handle: &Arc<TaskHandle>, state: TaskState) {
        let stop_tx = {
            let mut record = handle.record.lock().unwrap_or_else(|p| p.into_inner());
            record.stop_tx.take()
        };
        handle.set_state(state);
        if let Some(stop_tx) = stop_tx {
            let _ = stop_tx.send(true);
        }
    }

    pub fn list(&self) -> Vec<TaskInfo> {
        let tasks = self.tasks.read().unwrap_or_else(|p| p.into_inner());
        let mut out: Vec<TaskInfo> = tasks.values().map(|t| t.info()).collect();
        out.sort_by_key(|t| t.created_at);
        out
    }

    pub fn get(&self, id: Uuid) -> Result<TaskInfo> {
        self.task(id)
            .map(|t| t.info())
            .ok_or(SchedulerError::TaskNotFound(id))
    }

    /// The manifest as submitted, for export and replication.
    pub fn manifest(&self, id: Uuid) -> Result<TaskManifest> {
        let handle = self.task(id).ok_or(SchedulerError::TaskNotFound(id))?;
        let record = handle.record.lock().unwrap_or_else(|p| p.into_inner());
        Ok(record.manifest.clone())
    }

    pub fn watch(&self, id: Uuid) -> Result<broadcast::Receiver<TaskWatchEvent>> {
        self.task(id)
            .map(|t| t.subscribe())
            .ok_or(SchedulerError::TaskNotFound(id))
    }

    /// Stop firing, cancel loops, and let workers drain. Called once at
    /// daemon shutdown, before the plugin catalog goes down.
    pub async fn shutdown(&self) {
        let handles: Vec<Arc<TaskHandle>> = {
            let tasks = self.tasks.read().unwrap_or_else(|p| p.into_inner());
            tasks.values().cloned().collect()
        };
        for handle in handles {
            if matches!(handle.state(), TaskState::Spinning | TaskState::Running) {
                self.halt(&handle, TaskState::Stopped);
            }
        }
        let loops: Vec<JoinHandle<()>> = {
            let mut guard = self.firing_loops.lock().unwrap_or_else(|p| p.into_inner());
            guard.drain(..).collect()
        };
        for handle in loops {
            let _ = handle.await;
        }
        let workers: Vec<JoinHandle<()>> = {
            let mut guard = self.workers.lock().unwrap_or_else(|p| p.into_inner());
            guard.drain(..).collect()
        };
        for handle in workers {
            handle.abort();
        }
        tracing::info!("scheduler stopped");
    }
}

#[async_trait]
impl TaskReaper for Scheduler {
    async fn stop_tasks_for_plugin(&self, plugin: &PluginId) -> Vec<Uuid> {
        let handles: Vec<(Uuid, Arc<TaskHandle>)> = {
            let tasks = self.tasks.read().unwrap_or_else(|p| p.into_inner());
            tasks.iter().map(|(id, h)| (*id, h.clone())).collect()
        };
        let mut stopped = Vec::new();
        for (id, handle) in handles {
            if !matches!(handle.state(), TaskState::Spinning | TaskState::Running) {
                continue;
            }
            let (references, requests) = {
                let record = handle.record.lock().unwrap_or_else(|p| p.into_inner());
                (
                    record.workflow.references_plugin(plugin),
                    record.workflow.requests(),
                )
            };
            let orphaned =
                references || self.manager.validate_requests(&requests).is_err();
            if orphaned {
                self.halt(&handle, TaskState::Stopped);
                self.events.publish(&Event::TaskStopped { id });
                stopped.push(id);
            }
        }
        stopped
    }
}
