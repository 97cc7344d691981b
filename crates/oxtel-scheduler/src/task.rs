//! Task records: lifecycle state, hit/drop/failure accounting, and the
//! per-task watch channel feeding the SSE endpoint.

use crate::schedule::Schedule;
use crate::workflow::Workflow;
use chrono::{DateTime, Utc};
use oxtel_common::types::{TaskInfo, TaskManifest, TaskState};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tokio::sync::{broadcast, watch};
use uuid::Uuid;

/// Events streamed to watchers of a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum TaskWatchEvent {
    StateChange { state: TaskState },
    Fired { metrics: usize },
    BranchFailure { message: String },
}

pub struct TaskRecord {
    pub id: Uuid,
    pub name: Option<String>,
    pub schedule: Schedule,
    pub workflow: Workflow,
    /// The wire manifest, kept verbatim for replication and export.
    pub manifest: TaskManifest,
    pub state: TaskState,
    pub created_at: DateTime<Utc>,
    pub hit_count: u64,
    pub drop_count: u64,
    pub consecutive_drops: u32,
    pub failure_count: u64,
    pub consecutive_failures: u32,
    pub last_fire: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Signals the firing loop to wind down.
    pub stop_tx: Option<watch::Sender<bool>>,
}

/// A task as held by the scheduler: the record under a short-lived lock
/// plus the watch fan-out.
pub struct TaskHandle {
    pub record: Mutex<TaskRecord>,
    pub watch: broadcast::Sender<TaskWatchEvent>,
}

impl TaskHandle {
    pub fn new(record: TaskRecord) -> Self {
        let (watch, _) = broadcast::channel(64);
        Self {
            record: Mutex::new(record),
            watch,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskWatchEvent> {
        self.watch.subscribe()
    }

    pub fn state(&self) -> TaskState {
        self.record.lock().unwrap_or_else(|p| p.into_inner()).state
    }

    pub fn set_state(&self, state: TaskState) {
        {
            let mut record = self.record.lock().unwrap_or_else(|p| p.into_inner());
            if record.state == state {
                return;
            }
            record.state = state;
        }
        let _ = self.watch.send(TaskWatchEvent::StateChange { state });
    }

    pub fn info(&self) -> TaskInfo {
        let record = self.record.lock().unwrap_or_else(|p| p.into_inner());
        TaskInfo {
            id: record.id,
            name: record.name.clone(),
            state: record.state,
            schedule: record.manifest.schedule.clone(),
            hit_count: record.hit_count,
            miss_count: record.drop_count,
            failure_count: record.failure_count,
            last_fire: record.last_fire,
            last_error: record.last_error.clone(),
            created_at: record.created_at,
            deadline: record.schedule.stop,
        }
    }

    /// Account a successful enqueue of a firing.
    pub fn record_fire(&self) {
        let mut record = self.record.lock().unwrap_or_else(|p| p.into_inner());
        record.hit_count += 1;
        record.consecutive_drops = 0;
        record.last_fire = Some(Utc::now());
    }

    /// Account a dropped firing. Returns the consecutive-drop count so
    /// the firing loop can apply the backpressure threshold.
    pub fn record_drop(&self) -> u32 {
        let mut record = self.record.lock().unwrap_or_else(|p| p.into_inner());
        record.drop_count += 1;
        record.consecutive_drops += 1;
        record.consecutive_drops
    }

    /// Account a failed pipeline branch. Returns the consecutive-failure
    /// count; the caller moves the task to `error` past the threshold.
    pub fn record_branch_failure(&self, message: &str) -> u32 {
        let failures = {
            let mut record = self.record.lock().unwrap_or_else(|p| p.into_inner());
            record.failure_count += 1;
            record.consecutive_failures += 1;
            record.last_error = Some(message.to_string());
            record.consecutive_failures
        };
        let _ = self.watch.send(TaskWatchEvent::BranchFailure {
            message: message.to_string(),
        });
        failures
    }

    /// A branch reached its publish leaf; the failure streak resets.
    pub fn record_branch_success(&self) {
        let mut record = self.record.lock().unwrap_or_else(|p| p.into_inner());
        record.consecutive_failures = 0;
    }

    pub fn record_collected(&self, metrics: usize) {
        let _ = self.watch.send(TaskWatchEvent::Fired { metrics });
    }

    pub fn set_error(&self, message: &str) {
        {
            let mut record = self.record.lock().unwrap_or_else(|p| p.into_inner());
            record.last_error = Some(message.to_string());
        }
        self.set_state(TaskState::Error);
    }

    /// Whether workers should keep spending cycles on this task's
    /// in-flight jobs. Checked at stage boundaries for cooperative
    /// cancellation: work survives a schedule's natural end but not a
    /// stop, error, or disable.
    pub fn accepts_work(&self) -> bool {
        matches!(
            self.state(),
            TaskState::Spinning | TaskState::Running | TaskState::Ended
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oxtel_common::types::ScheduleSpec;
    use serde_json::json;

    fn handle() -> TaskHandle {
        let manifest = TaskManifest {
            name: Some("t".to_string()),
            schedule: ScheduleSpec {
                interval_ms: 100,
                start: None,
                stop: None,
                duration_ms: None,
            },
            workflow: json!({
                "collect": {
                    "metrics": { "/intel/mock/foo": 0 },
                    "publish": [ { "plugin_name": "file" } ]
                }
            }),
            no_start: false,
        };
        let workflow = Workflow::parse(&manifest.workflow).unwrap();
        let schedule = Schedule::from_spec(&manifest.schedule, Utc::now()).unwrap();
        TaskHandle::new(TaskRecord {
            id: Uuid::new_v4(),
            name: manifest.name.clone(),
            schedule,
            workflow,
            manifest,
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
        })
    }

    #[test]
    fn drop_accounting_is_exact() {
        let handle = handle();
        assert_eq!(handle.record_drop(), 1);
        assert_eq!(handle.record_drop(), 2);
        handle.record_fire();
        assert_eq!(handle.record_drop(), 1, "fire resets the streak");
        let info = handle.info();
        assert_eq!(info.miss_count, 3);
        assert_eq!(info.hit_count, 1);
    }

    #[test]
    fn failure_streak_resets_on_success() {
        let handle = handle();
        assert_eq!(handle.record_branch_failure("boom"), 1);
        assert_eq!(handle.record_branch_failure("boom"), 2);
        handle.record_branch_success();
        assert_eq!(handle.record_branch_failure("boom"), 1);
        assert_eq!(handle.info().failure_count, 3);
        assert_eq!(handle.info().last_error.as_deref(), Some("boom"));
    }

    #[test]
    fn watchers_see_state_changes() {
        let handle = handle();
        let mut rx = handle.subscribe();
        handle.set_state(TaskState::Spinning);
        handle.set_state(TaskState::Spinning); // no duplicate event
        handle.set_state(TaskState::Running);

        let first = rx.try_recv().unwrap();
        assert!(matches!(
            first,
            TaskWatchEvent::StateChange {
                state: TaskState::Spinning
            }
        ));
        let second = rx.try_recv().unwrap();
        assert!(matches!(
            second,
            TaskWatchEvent::StateChange {
                state: TaskState::Running
            }
        ));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn accepts_work_only_while_live() {
        let handle = handle();
        assert!(!handle.accepts_work());
        handle.set_state(TaskState::Running);
        assert!(handle.accepts_work());
        handle.set_state(TaskState::Stopped);
        assert!(!handle.accepts_work());
    }
}
