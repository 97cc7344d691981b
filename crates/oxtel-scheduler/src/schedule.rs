//! Task schedules: simple intervals and bounded windows derived from
//! start/stop/duration.

use crate::error::{Result, SchedulerError};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use oxtel_common::types::ScheduleSpec;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleKind {
    Simple,
    Windowed,
}

#[derive(Debug, Clone)]
pub struct Schedule {
    pub kind: ScheduleKind,
    pub interval: Duration,
    pub start: Option<DateTime<Utc>>,
    pub stop: Option<DateTime<Utc>>,
}

impl Schedule {
    /// Validate a wire spec. `duration` without `stop` derives
    /// `stop = start + duration` (start defaulting to now); a stop already
    /// in the past rejects the schedule. The interval must be positive:
    /// the plugin call surface has no collector-push channel, so a
    /// zero-interval (event-driven) task could never fire.
    pub fn from_spec(spec: &ScheduleSpec, now: DateTime<Utc>) -> Result<Self> {
        if spec.interval_ms == 0 {
            return Err(SchedulerError::BadSchedule(
                "interval must be greater than zero".to_string(),
            ));
        }

        let start = spec.start;
        let stop = match (spec.stop, spec.duration_ms) {
            (Some(stop), _) => Some(stop),
            (None, Some(duration_ms)) => {
                let base = start.unwrap_or(now);
                Some(base + ChronoDuration::milliseconds(duration_ms as i64))
            }
            (None, None) => None,
        };

        if let Some(stop) = stop {
            if stop <= now {
                return Err(SchedulerError::BadSchedule(format!(
                    "stop {stop} is already past"
                )));
            }
            if let Some(start) = start {
                if stop <= start {
                    return Err(SchedulerError::BadSchedule(
                        "stop precedes start".to_string(),
                    ));
                }
            }
        }

        let kind = if start.is_some() || stop.is_some() {
            ScheduleKind::Windowed
        } else {
            ScheduleKind::Simple
        };
        Ok(Self {
            kind,
            interval: Duration::from_millis(spec.interval_ms),
            start,
            stop,
        })
    }

    /// Whether the firing window has closed.
    pub fn expired(&self, now: DateTime<Utc>) -> bool {
        self.stop.is_some_and(|stop| now >= stop)
    }

    /// Time until the window opens, when a future start is declared.
    pub fn until_start(&self, now: DateTime<Utc>) -> Option<Duration> {
        let start = self.start?;
        if start <= now {
            return None;
        }
        (start - now).to_std().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(interval_ms: u64) -> ScheduleSpec {
        ScheduleSpec {
            interval_ms,
            start: None,
            stop: None,
            duration_ms: None,
        }
    }

    #[test]
    fn plain_interval_is_simple() {
        let s = Schedule::from_spec(&spec(100), Utc::now()).unwrap();
        assert_eq!(s.kind, ScheduleKind::Simple);
        assert_eq!(s.interval, Duration::from_millis(100));
        assert!(!s.expired(Utc::now()));
    }

    #[test]
    fn duration_derives_stop_from_start() {
        let now = Utc::now();
        let start = now + ChronoDuration::seconds(10);
        let s = Schedule::from_spec(
            &ScheduleSpec {
                interval_ms: 100,
                start: Some(start),
                stop: None,
                duration_ms: Some(1000),
            },
            now,
        )
        .unwrap();
        assert_eq!(s.kind, ScheduleKind::Windowed);
        assert_eq!(s.stop, Some(start + ChronoDuration::milliseconds(1000)));
    }

    #[test]
    fn duration_without_start_counts_from_now() {
        let now = Utc::now();
        let s = Schedule::from_spec(
            &ScheduleSpec {
                interval_ms: 100,
                start: None,
                stop: None,
                duration_ms: Some(1000),
            },
            now,
        )
        .unwrap();
        assert_eq!(s.stop, Some(now + ChronoDuration::milliseconds(1000)));
    }

    #[test]
    fn past_stop_is_rejected() {
        let now = Utc::now();
        let err = Schedule::from_spec(
            &ScheduleSpec {
                interval_ms: 100,
                start: None,
                stop: Some(now - ChronoDuration::seconds(1)),
                duration_ms: None,
            },
            now,
        )
        .unwrap_err();
        assert!(matches!(err, SchedulerError::BadSchedule(_)));
    }

    #[test]
    fn stop_before_start_is_rejected() {
        let now = Utc::now();
        let err = Schedule::from_spec(
            &ScheduleSpec {
                interval_ms: 100,
                start: Some(now + ChronoDuration::seconds(20)),
                stop: Some(now + ChronoDuration::seconds(10)),
                duration_ms: None,
            },
            now,
        )
        .unwrap_err();
        assert!(matches!(err, SchedulerError::BadSchedule(_)));
    }

    #[test]
    fn zero_interval_is_rejected() {
        let err = Schedule::from_spec(&spec(0), Utc::now()).unwrap_err();
        assert!(matches!(err, SchedulerError::BadSchedule(_)));
    }
}
