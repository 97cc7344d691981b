//! Workflow execution: the pipeline handlers the worker pools run. A
//! firing is not one unit of work; each stage completes by dispatching
//! its children into the next stage's queue.

use crate::scheduler::Scheduler;
use crate::task::TaskHandle;
use crate::workflow::{ProcessNode, PublishNode};
use oxtel_common::types::{Payload, PluginId, PluginType};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub const PAYLOAD_CONTENT_TYPE: &str = "application/json";

/// Floor for stage deadlines so millisecond intervals do not starve the
/// pipeline outright.
const MIN_STAGE_TIMEOUT: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct CollectJob {
    pub task_id: Uuid,
}

#[derive(Clone)]
pub struct ProcessJob {
    pub task_id: Uuid,
    pub node: ProcessNode,
    pub payload: Payload,
}

#[derive(Clone)]
pub struct PublishJob {
    pub task_id: Uuid,
    pub node: PublishNode,
    pub payload: Payload,
}

impl Scheduler {
    pub(crate) async fn handle_collect(self: Arc<Self>, job: CollectJob) {
        let Some(task) = self.task(job.task_id) else {
            return;
        };
        if !task.accepts_work() {
            return;
        }

        let (requests, config, deadline) = {
            let record = task.record.lock().unwrap_or_else(|p| p.into_inner());
            (
                record.workflow.requests(),
                record.workflow.collect.config.clone(),
                stage_timeout(record.schedule.interval),
            )
        };

        // The call runs on its own task: on timeout the in-flight RPC is
        // left to finish and return its instance to the pool, only the
        // result is discarded.
        let manager = self.manager.clone();
        let call =
            tokio::spawn(async move { manager.collect_metrics(&requests, &config).await });
        let metrics = match tokio::time::timeout(deadline, call).await {
            Ok(Ok(Ok(metrics))) => metrics,
            Ok(Ok(Err(e))) => {
                self.branch_failed(&task, &format!("collect: {e}"));
                return;
            }
            Ok(Err(e)) => {
                self.branch_failed(&task, &format!("collect worker failed: {e}"));
                return;
            }
            Err(_) => {
                self.branch_failed(&task, &format!("collect timed out after {deadline:?}"));
                return;
            }
        };

        task.record_collected(metrics.len());

        let body = match serde_json::to_vec(&metrics) {
            Ok(body) => body,
            Err(e) => {
                self.branch_failed(&task, &format!("encode metrics: {e}"));
                return;
            }
        };
        let payload = Payload {
            content_type: PAYLOAD_CONTENT_TYPE.to_string(),
            body,
        };

        let (children, leaves) = {
            let record = task.record.lock().unwrap_or_else(|p| p.into_inner());
            (
                record.workflow.collect.process.clone(),
                record.workflow.collect.publish.clone(),
            )
        };
        self.fan_out(&task, job.task_id, children, leaves, payload);
    }

    pub(crate) async fn handle_process(self: Arc<Self>, job: ProcessJob) {
        let Some(task) = self.task(job.task_id) else {
            return;
        };
        if !task.accepts_work() {
            return;
        }

        let deadline = {
            let record = task.record.lock().unwrap_or_else(|p| p.into_inner());
            stage_timeout(record.schedule.interval)
        };
        let plugin = PluginId::new(
            PluginType::Processor,
            job.node.plugin_name.clone(),
            job.node.plugin_version,
        );

        let manager = self.manager.clone();
        let config = job.node.config.clone();
        let payload_in = job.payload;
        let rpc_plugin = plugin.clone();
        let call =
            tokio::spawn(async move { manager.process(&rpc_plugin, payload_in, &config).await });
        let payload = match tokio::time::timeout(deadline, call).await {
            Ok(Ok(Ok(payload))) => payload,
            Ok(Ok(Err(e))) => {
                self.branch_failed(&task, &format!("process {}: {e}", job.node.plugin_name));
                return;
            }
            Ok(Err(e)) => {
                self.branch_failed(&task, &format!("process worker failed: {e}"));
                return;
            }
            Err(_) => {
                self.branch_failed(
                    &task,
                    &format!("process {} timed out after {deadline:?}", job.node.plugin_name),
                );
                return;
            }
        };

        self.fan_out(
            &task,
            job.task_id,
            job.node.process,
            job.node.publish,
            payload,
        );
    }

    pub(crate) async fn handle_publish(self: Arc<Self>, job: PublishJob) {
        let Some(task) = self.task(job.task_id) else {
            return;
        };
        if !task.accepts_work() {
            return;
        }

        let deadline = {
            let record = task.record.lock().unwrap_or_else(|p| p.into_inner());
            stage_timeout(record.schedule.interval)
        };
        let plugin = PluginId::new(
            PluginType::Publisher,
            job.node.plugin_name.clone(),
            job.node.plugin_version,
        );

        let manager = self.manager.clone();
        let config = job.node.config.clone();
        let payload_in = job.payload;
        let rpc_plugin = plugin.clone();
        let call =
            tokio::spawn(async move { manager.publish(&rpc_plugin, payload_in, &config).await });
        match tokio::time::timeout(deadline, call).await {
            Ok(Ok(Ok(()))) => task.record_branch_success(),
            Ok(Ok(Err(e))) => {
                self.branch_failed(&task, &format!("publish {}: {e}", job.node.plugin_name));
            }
            Ok(Err(e)) => {
                self.branch_failed(&task, &format!("publish worker failed: {e}"));
            }
            Err(_) => {
                self.branch_failed(
                    &task,
                    &format!("publish {} timed out after {deadline:?}", job.node.plugin_name),
                );
            }
        }
    }

    /// Dispatch a stage's children into the next queues. Sibling branches
    /// are independent: a full queue fails that branch only.
    fn fan_out(
        &self,
        task: &Arc<TaskHandle>,
        task_id: Uuid,
        children: Vec<ProcessNode>,
        leaves: Vec<PublishNode>,
        payload: Payload,
    ) {
        for node in children {
            let job = ProcessJob {
                task_id,
                node,
                payload: payload.clone(),
            };
            if self.process_queue().try_push(job).is_err() {
                self.branch_failed(task, "process queue full");
            }
        }
        for node in leaves {
            let job = PublishJob {
                task_id,
                node,
                payload: payload.clone(),
            };
            if self.publish_queue().try_push(job).is_err() {
                self.branch_failed(task, "publish queue full");
            }
        }
    }

    pub(crate) fn branch_failed(&self, task: &Arc<TaskHandle>, message: &str) {
        if !task.accepts_work() {
            // the task already stopped or errored; discard the straggler
            return;
        }
        let failures = task.record_branch_failure(message);
        tracing::warn!(
            task_id = %task.info().id,
            consecutive = failures,
            error = message,
            "workflow branch failed"
        );
        if failures >= self.cfg.max_consecutive_failures {
            task.set_error(message);
        }
    }
}

/// Stage deadlines default to the task interval: a firing that cannot
/// complete within its own period is stuck.
fn stage_timeout(interval: Duration) -> Duration {
    interval.max(MIN_STAGE_TIMEOUT)
}
