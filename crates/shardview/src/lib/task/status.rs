//! Run lifecycle of an assembly task

use std::fmt;
use thiserror::Error;

/// Lifecycle state of an [`AssemblyTask`](super::AssemblyTask)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TaskStatus {
    #[default]
    Init,
    Requested,
    Queued,
    Progressing,
    Completed,
    Failed,
}

/// Input to [`TaskStatus::transition`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunSignal {
    /// A caller starts a new run
    Start,
    /// Backend reported the run as queued
    Pending,
    /// Backend started producing steps
    Generating,
    /// Backend finished the run
    Complete,
    /// Backend error or transport failure
    Fail,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("{signal:?} is not valid while the task is {from}")]
pub struct InvalidTransition {
    pub from: TaskStatus,
    pub signal: RunSignal,
}

impl TaskStatus {
    /// Whether a run is currently open
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            TaskStatus::Requested | TaskStatus::Queued | TaskStatus::Progressing
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// The single place where run state changes are decided
    pub fn transition(self, signal: RunSignal) -> Result<TaskStatus, InvalidTransition> {
        use RunSignal as S;
        use TaskStatus as T;

        let next = match (self, signal) {
            (T::Init | T::Completed | T::Failed, S::Start) => T::Requested,
            (T::Requested | T::Queued, S::Pending) => T::Queued,
            (T::Requested | T::Queued | T::Progressing, S::Generating) => T::Progressing,
            (T::Requested | T::Queued | T::Progressing, S::Complete) => T::Completed,
            (from, S::Fail) if from.is_in_flight() => T::Failed,
            (from, signal) => return Err(InvalidTransition { from, signal }),
        };
        Ok(next)
    }

    /// Short user-facing text for a status notification
    pub fn message(&self, step: Option<i64>, total_steps: Option<u32>) -> String {
        match self {
            TaskStatus::Init => "Ready to assemble".to_string(),
            TaskStatus::Requested => "Uploading fragments".to_string(),
            TaskStatus::Queued => "Waiting for a free worker".to_string(),
            TaskStatus::Progressing => match (step, total_steps) {
                (Some(step), Some(total)) => format!("Assembling: step {step} of {total}"),
                _ => "Assembling".to_string(),
            },
            TaskStatus::Completed => "Assembly complete".to_string(),
            TaskStatus::Failed => "Assembly failed".to_string(),
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskStatus::Init => "INIT",
            TaskStatus::Requested => "REQUESTED",
            TaskStatus::Queued => "QUEUED",
            TaskStatus::Progressing => "PROGRESSING",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [TaskStatus; 6] = [
        TaskStatus::Init,
        TaskStatus::Requested,
        TaskStatus::Queued,
        TaskStatus::Progressing,
        TaskStatus::Completed,
        TaskStatus::Failed,
    ];

    #[test]
    fn test_happy_path() {
        let status = TaskStatus::Init
            .transition(RunSignal::Start)
            .and_then(|s| s.transition(RunSignal::Pending))
            .and_then(|s| s.transition(RunSignal::Generating))
            .and_then(|s| s.transition(RunSignal::Generating))
            .and_then(|s| s.transition(RunSignal::Complete))
            .unwrap();
        assert_eq!(status, TaskStatus::Completed);
    }

    #[test]
    fn test_start_only_when_idle() {
        for status in ALL {
            let result = status.transition(RunSignal::Start);
            if status.is_in_flight() {
                assert!(result.is_err(), "{status} accepted Start");
            } else {
                assert_eq!(result, Ok(TaskStatus::Requested));
            }
        }
    }

    #[test]
    fn test_fail_only_when_in_flight() {
        for status in ALL {
            let result = status.transition(RunSignal::Fail);
            assert_eq!(result.is_ok(), status.is_in_flight(), "{status}");
        }
    }

    #[test]
    fn test_no_going_back_to_queued() {
        let err = TaskStatus::Progressing
            .transition(RunSignal::Pending)
            .unwrap_err();
        assert_eq!(err.from, TaskStatus::Progressing);
        assert_eq!(err.signal, RunSignal::Pending);
        assert!(TaskStatus::Completed.transition(RunSignal::Generating).is_err());
    }

    #[test]
    fn test_progress_message() {
        assert_eq!(
            TaskStatus::Progressing.message(Some(3), Some(20)),
            "Assembling: step 3 of 20"
        );
        assert_eq!(TaskStatus::Progressing.message(None, None), "Assembling");
        assert_eq!(TaskStatus::Failed.to_string(), "FAILED");
    }
}
