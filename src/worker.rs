//! Worker logic trait and its process wrapper.
//!
//! A [`Worker`] is the user-supplied task logic. [`WorkerProcess`] runs a
//! clone of it in a forked child, routing `run` requests to it and
//! classifying the outcome into a response payload.

use crate::error::Result;
use crate::message::{ErrorRecord, Message, PROC_RUN, Payload};
use crate::process::{ChildRun, Process, Status};
use crate::semaphore::Semaphore;
use crate::transport::Channel;
use nix::unistd::Pid;
use serde_json::Value;
use std::time::Duration;

/// Outcome of one task: data, no result, or an error.
pub type TaskResult = std::result::Result<Option<Value>, Box<dyn std::error::Error + Send + Sync>>;

/// Task logic executed inside worker processes.
pub trait Worker: Send + 'static {
    /// Runs once in the freshly forked child, before any task.
    ///
    /// The semaphore is shared with every other worker of the pool; use it
    /// to serialize critical sections across processes. A failing hook
    /// aborts the worker.
    fn on_process_create(&mut self, _semaphore: &Semaphore) -> Result<()> {
        Ok(())
    }

    /// Handle one task. `Ok(None)` means the task legitimately produced
    /// no result and nothing will be recorded for it.
    fn run(&mut self, input: Value) -> TaskResult;

    /// Runs once in the child when the worker shuts down.
    fn on_process_destroy(&mut self) {}
}

/// Adapts a plain closure into a [`Worker`].
#[derive(Clone)]
pub struct ClosureWorker<F> {
    task: F,
}

impl<F> ClosureWorker<F>
where
    F: FnMut(Value) -> TaskResult + Send + 'static,
{
    pub fn new(task: F) -> Self {
        Self { task }
    }
}

impl<F> Worker for ClosureWorker<F>
where
    F: FnMut(Value) -> TaskResult + Send + 'static,
{
    fn run(&mut self, input: Value) -> TaskResult {
        (self.task)(input)
    }
}

/// Child-side dispatcher: routes procedures to the worker and turns
/// outcomes into payloads.
pub struct WorkerChild<W> {
    worker: W,
    semaphore: Semaphore,
}

impl<W: Worker> WorkerChild<W> {
    pub fn new(worker: W, semaphore: Semaphore) -> Self {
        Self { worker, semaphore }
    }
}

impl<W: Worker> ChildRun for WorkerChild<W> {
    fn on_create(&mut self) -> Result<()> {
        self.worker.on_process_create(&self.semaphore)
    }

    fn handle(&mut self, procedure: &str, payload: Payload) -> Payload {
        if procedure != PROC_RUN {
            // Unknown procedures produce no result.
            return Payload::None;
        }
        let Payload::Data { value } = payload else {
            return Payload::PoolError {
                error: ErrorRecord::new(
                    "Protocol",
                    format!("run request without a data payload: {:?}", payload),
                    "",
                ),
            };
        };
        match self.worker.run(value) {
            Ok(Some(value)) => Payload::Data { value },
            Ok(None) => Payload::None,
            Err(e) => Payload::WorkerError {
                error: ErrorRecord::from_error(&*e),
            },
        }
    }

    fn on_exit(&mut self) {
        self.worker.on_process_destroy();
    }
}

/// A forked process running a [`Worker`].
pub struct WorkerProcess<W: Worker> {
    process: Process<WorkerChild<W>>,
}

impl<W: Worker> WorkerProcess<W> {
    pub fn new(worker: W, semaphore: Semaphore) -> Self {
        Self {
            process: Process::new(WorkerChild::new(worker, semaphore)),
        }
    }

    /// Like [`new`], but with an explicit supervisor reference.
    ///
    /// [`new`]: WorkerProcess::new
    pub fn with_supervisor(
        worker: W,
        semaphore: Semaphore,
        control: &'static crate::control::ProcessControl,
    ) -> Self {
        Self {
            process: Process::with_supervisor(WorkerChild::new(worker, semaphore), control),
        }
    }

    /// Fork the worker process.
    pub fn start(&mut self) -> Result<()> {
        self.process.start()
    }

    /// Dispatch a task without waiting for its result.
    ///
    /// Returns a synthesized termination message if the worker turned out
    /// to be dead, `None` on a successful dispatch.
    pub fn assign(&mut self, input: Value) -> Result<Option<Message>> {
        self.process
            .invoke(PROC_RUN, Payload::Data { value: input }, false)
    }

    pub fn pid(&self) -> Option<Pid> {
        self.process.pid()
    }

    pub fn status(&self) -> Status {
        self.process.status()
    }

    pub fn exit_status(&self) -> Option<i32> {
        self.process.exit_status()
    }

    pub fn is_running(&self) -> bool {
        self.process.is_running()
    }

    pub fn idle_time(&self) -> Option<Duration> {
        self.process.idle_time()
    }

    pub fn channel(&self) -> Option<&Channel> {
        self.process.channel()
    }

    /// Blocking receive of the worker's next message.
    pub fn receive_pending(&mut self) -> Result<Message> {
        self.process.receive_pending()
    }

    /// Drain responses that arrived out of order.
    pub fn take_deferred(&mut self) -> Vec<Message> {
        self.process.take_deferred()
    }

    /// Graceful shutdown with SIGKILL escalation after `max_wait`.
    pub fn destroy(&mut self, max_wait: Duration) -> Result<()> {
        self.process.destroy(max_wait)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Clone)]
    struct DoublingWorker;

    impl Worker for DoublingWorker {
        fn run(&mut self, input: Value) -> TaskResult {
            let n = input.as_i64().ok_or("input is not a number")?;
            Ok(Some(json!(n * 2)))
        }
    }

    #[test]
    fn test_child_routes_run() {
        let mut child = WorkerChild::new(DoublingWorker, Semaphore::disabled());
        let out = child.handle(PROC_RUN, Payload::Data { value: json!(21) });
        assert_eq!(out, Payload::Data { value: json!(42) });
    }

    #[test]
    fn test_child_worker_error() {
        let mut child = WorkerChild::new(DoublingWorker, Semaphore::disabled());
        let out = child.handle(PROC_RUN, Payload::Data { value: json!("nope") });
        match out {
            Payload::WorkerError { error } => {
                assert!(error.message.contains("not a number"));
            }
            other => panic!("expected WorkerError, got {:?}", other),
        }
    }

    #[test]
    fn test_child_rejects_run_without_data() {
        let mut child = WorkerChild::new(DoublingWorker, Semaphore::disabled());
        let out = child.handle(PROC_RUN, Payload::None);
        assert!(matches!(out, Payload::PoolError { .. }));
    }

    #[test]
    fn test_child_unknown_procedure_yields_no_result() {
        let mut child = WorkerChild::new(DoublingWorker, Semaphore::disabled());
        let out = child.handle("status", Payload::Data { value: json!(1) });
        assert_eq!(out, Payload::None);
    }

    #[test]
    fn test_closure_worker() {
        let mut worker = ClosureWorker::new(|input: Value| {
            let n = input.as_i64().unwrap_or(0);
            Ok(Some(json!(n + 1)))
        });
        let out = worker.run(json!(9)).unwrap();
        assert_eq!(out, Some(json!(10)));
    }

    #[test]
    fn test_worker_process_round_trip() {
        let mut wp = WorkerProcess::new(DoublingWorker, Semaphore::disabled());
        wp.start().unwrap();

        assert!(wp.assign(json!(10)).unwrap().is_none());
        let response = wp.receive_pending().unwrap();
        assert_eq!(response.payload, Payload::Data { value: json!(20) });

        wp.destroy(Duration::from_secs(2)).unwrap();
        assert!(!wp.is_running());
    }
}
