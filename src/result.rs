//! Collected task results.

use crate::message::ErrorRecord;
use serde_json::Value;

/// What a dispatched task came back as.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    /// The worker returned data.
    Data(Value),
    /// Worker code raised an error while handling the task.
    WorkerError(ErrorRecord),
    /// The pool machinery failed around the task.
    PoolError(ErrorRecord),
    /// The worker process died before producing a result.
    Terminated { exit_status: i32 },
}

/// One collected result, attributed to the worker that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerResult {
    /// Pid of the worker process.
    pub pid: i32,
    pub outcome: TaskOutcome,
}

impl WorkerResult {
    pub fn new(pid: i32, outcome: TaskOutcome) -> Self {
        Self { pid, outcome }
    }

    /// Did the task fail, in any of the three failure shapes?
    pub fn is_error(&self) -> bool {
        !matches!(self.outcome, TaskOutcome::Data(_))
    }

    /// The returned data, if the task succeeded.
    pub fn data(&self) -> Option<&Value> {
        match &self.outcome {
            TaskOutcome::Data(value) => Some(value),
            _ => None,
        }
    }

    /// The error record, for worker-level and pool-level failures.
    pub fn error(&self) -> Option<&ErrorRecord> {
        match &self.outcome {
            TaskOutcome::WorkerError(error) | TaskOutcome::PoolError(error) => Some(error),
            _ => None,
        }
    }
}
