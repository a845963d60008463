//! The worker pool: forks worker processes, dispatches tasks, collects
//! results, and keeps the pool topped up.
//!
//! All pool mutations happen through `&mut self` from the owning process;
//! workers never touch the table. Result collection runs from every
//! status query and dispatch so the pool makes progress even when the
//! caller never blocks explicitly.

use crate::control::ProcessControl;
use crate::error::{PoolError, Result};
use crate::message::{Message, Payload};
use crate::result::{TaskOutcome, WorkerResult};
use crate::semaphore::{SemKey, Semaphore};
use crate::transport;
use crate::worker::{Worker, WorkerProcess};
use nix::unistd::Pid;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Granularity of the blocking waits in the pool.
const WAIT_TICK: Duration = Duration::from_millis(100);

/// Permission bits for the pool's own semaphore.
const SEM_PERMS: u32 = 0o666;

/// When new worker processes are forked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkPolicy {
    /// Fork `min_workers` at start.
    Eager,
    /// Fork nothing at start; grow as tasks arrive.
    OnDemand,
}

/// Pool sizing and lifecycle configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    min_workers: usize,
    max_workers: usize,
    idle_timeout: Option<Duration>,
    fork_policy: ForkPolicy,
    destroy_timeout: Duration,
}

impl PoolConfig {
    /// Configure a pool keeping between `min_workers` and `max_workers`
    /// processes.
    pub fn new(min_workers: usize, max_workers: usize) -> Result<Self> {
        if min_workers == 0 {
            return Err(PoolError::Config(
                "min_workers must be at least 1".to_string(),
            ));
        }
        if max_workers < min_workers {
            return Err(PoolError::Config(format!(
                "max_workers ({}) must not be below min_workers ({})",
                max_workers, min_workers
            )));
        }
        Ok(Self {
            min_workers,
            max_workers,
            idle_timeout: None,
            fork_policy: ForkPolicy::Eager,
            destroy_timeout: Duration::from_secs(10),
        })
    }

    /// Fixed-size pool: min == max.
    pub fn fixed(workers: usize) -> Result<Self> {
        Self::new(workers, workers)
    }

    /// Destroy idle workers above the minimum after this long.
    /// `None` disables idle reaping.
    pub fn idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn fork_policy(mut self, policy: ForkPolicy) -> Self {
        self.fork_policy = policy;
        self
    }

    /// Grace period per worker during pool teardown.
    pub fn destroy_timeout(mut self, timeout: Duration) -> Self {
        self.destroy_timeout = timeout;
        self
    }

    pub fn min_workers(&self) -> usize {
        self.min_workers
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }
}

/// Worker processes keyed by pid, with a FIFO of the free ones.
///
/// Removal is atomic: a pid leaves the map, the free FIFO, and the
/// multiplexer set together, so no query can see a half-removed worker.
struct ProcessTable<W: Worker> {
    procs: HashMap<i32, WorkerProcess<W>>,
    free: VecDeque<i32>,
}

impl<W: Worker> ProcessTable<W> {
    fn new() -> Self {
        Self {
            procs: HashMap::new(),
            free: VecDeque::new(),
        }
    }

    fn insert_free(&mut self, pid: i32, process: WorkerProcess<W>) {
        self.procs.insert(pid, process);
        self.free.push_back(pid);
    }

    /// Insert a worker that is about to receive a task, keeping it out of
    /// the free FIFO.
    fn insert_busy(&mut self, pid: i32, process: WorkerProcess<W>) {
        self.procs.insert(pid, process);
    }

    fn remove(&mut self, pid: i32) -> Option<WorkerProcess<W>> {
        self.free.retain(|p| *p != pid);
        self.procs.remove(&pid)
    }

    /// Pop the next free pid, marking it busy.
    fn take_free(&mut self) -> Option<i32> {
        self.free.pop_front()
    }

    fn mark_free(&mut self, pid: i32) {
        if self.procs.contains_key(&pid) && !self.free.contains(&pid) {
            self.free.push_back(pid);
        }
    }

    fn is_free(&self, pid: i32) -> bool {
        self.free.contains(&pid)
    }

    fn get_mut(&mut self, pid: i32) -> Option<&mut WorkerProcess<W>> {
        self.procs.get_mut(&pid)
    }

    fn len(&self) -> usize {
        self.procs.len()
    }

    fn free_count(&self) -> usize {
        self.free.len()
    }

    fn pids(&self) -> Vec<i32> {
        self.procs.keys().copied().collect()
    }

    fn drain(&mut self) -> Vec<WorkerProcess<W>> {
        self.free.clear();
        self.procs.drain().map(|(_, process)| process).collect()
    }
}

/// Process-based worker pool.
///
/// Tasks go in through [`run`], results come back out through the result
/// queue in completion order, each attributed to the worker pid that
/// handled it.
///
/// [`run`]: WorkerPool::run
pub struct WorkerPool<W: Worker + Clone> {
    config: PoolConfig,
    prototype: W,
    table: ProcessTable<W>,
    results: VecDeque<WorkerResult>,
    semaphore: Option<Semaphore>,
    control: &'static ProcessControl,
    created_by: Option<Pid>,
    started: bool,
    destroyed: bool,
}

impl<W: Worker + Clone> WorkerPool<W> {
    /// Create a pool around a worker prototype; each forked process runs
    /// its own clone. Nothing is forked until [`start`].
    ///
    /// [`start`]: WorkerPool::start
    pub fn new(config: PoolConfig, worker: W) -> Self {
        Self {
            config,
            prototype: worker,
            table: ProcessTable::new(),
            results: VecDeque::new(),
            semaphore: None,
            control: ProcessControl::instance(),
            created_by: None,
            started: false,
            destroyed: false,
        }
    }

    /// Use this semaphore instead of creating one at start.
    pub fn with_semaphore(mut self, semaphore: Semaphore) -> Self {
        self.semaphore = Some(semaphore);
        self
    }

    /// Use an explicit supervisor reference instead of the process-wide
    /// default.
    pub fn with_supervisor(mut self, control: &'static ProcessControl) -> Self {
        self.control = control;
        self
    }

    /// Create the shared semaphore and, under the eager policy, fork the
    /// minimum number of workers.
    pub fn start(&mut self) -> Result<()> {
        if self.started {
            return Err(PoolError::InvalidOperation(
                "pool already started".to_string(),
            ));
        }
        if self.semaphore.is_none() {
            self.semaphore = Some(Semaphore::create(SemKey::Random, 1, SEM_PERMS)?);
        }
        self.created_by = Some(Pid::this());
        self.started = true;

        if self.config.fork_policy == ForkPolicy::Eager {
            for _ in 0..self.config.min_workers {
                self.fork_worker()?;
            }
        }
        info!(
            min = self.config.min_workers,
            max = self.config.max_workers,
            policy = ?self.config.fork_policy,
            "worker pool started"
        );
        Ok(())
    }

    fn ensure_usable(&self) -> Result<()> {
        if !self.started {
            return Err(PoolError::InvalidOperation(
                "pool has not been started".to_string(),
            ));
        }
        if self.destroyed {
            return Err(PoolError::InvalidOperation(
                "pool has been destroyed".to_string(),
            ));
        }
        Ok(())
    }

    fn spawn_worker(&mut self) -> Result<(i32, WorkerProcess<W>)> {
        let semaphore = self
            .semaphore
            .clone()
            .unwrap_or_else(Semaphore::disabled);
        let mut process =
            WorkerProcess::with_supervisor(self.prototype.clone(), semaphore, self.control);
        process.start()?;
        let pid = process
            .pid()
            .map(Pid::as_raw)
            .ok_or_else(|| PoolError::Pool("started worker has no pid".to_string()))?;
        Ok((pid, process))
    }

    fn fork_worker(&mut self) -> Result<i32> {
        let (pid, process) = self.spawn_worker()?;
        self.table.insert_free(pid, process);
        debug!(pid, total = self.table.len(), "forked worker");
        Ok(pid)
    }

    /// Respawn workers until the pool is back at its minimum size.
    fn top_up(&mut self) {
        while self.table.len() < self.config.min_workers {
            match self.fork_worker() {
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "failed to respawn worker");
                    break;
                }
            }
        }
    }

    /// Dispatch a task to a worker, forking or waiting as needed.
    ///
    /// Returns the pid of the chosen worker as soon as the task has been
    /// handed over; the result is collected later. Fails with
    /// `AllWorkersGone` when no worker exists and none can be forked.
    pub fn run(&mut self, input: Value) -> Result<Pid> {
        self.ensure_usable()?;
        loop {
            self.top_up();
            self.collect(Duration::ZERO)?;

            if let Some(pid) = self.table.take_free() {
                if let Some(pid) = self.dispatch_to(pid, input.clone())? {
                    return Ok(pid);
                }
                continue;
            }

            if self.table.len() < self.config.max_workers {
                // The new worker goes straight to this task, so it never
                // enters the free FIFO.
                let (pid, process) = self.spawn_worker()?;
                self.table.insert_busy(pid, process);
                debug!(pid, total = self.table.len(), "forked worker for dispatch");
                if let Some(pid) = self.dispatch_to(pid, input.clone())? {
                    return Ok(pid);
                }
                continue;
            }

            if self.table.len() == 0 {
                return Err(PoolError::AllWorkersGone);
            }

            // Pool is full and everyone is busy: wait for a result.
            self.collect(WAIT_TICK)?;
        }
    }

    /// Hand the task to `pid`. Returns `None` when the worker turned out
    /// to be dead, so the caller retries with another one.
    fn dispatch_to(&mut self, pid: i32, input: Value) -> Result<Option<Pid>> {
        let Some(process) = self.table.get_mut(pid) else {
            return Ok(None);
        };
        match process.assign(input)? {
            None => {
                trace!(pid, "task dispatched");
                Ok(Some(Pid::from_raw(pid)))
            }
            Some(_termination) => {
                // Died while idle: no task was in flight, nothing to record.
                debug!(pid, "worker was dead at dispatch, discarding it");
                self.table.remove(pid);
                Ok(None)
            }
        }
    }

    /// One result-collection pass: reap the dead, drain deferred
    /// responses, then wait up to `timeout` for worker messages.
    fn collect(&mut self, timeout: Duration) -> Result<()> {
        self.control.dispatch();

        // Workers that died while busy owe their task a result.
        for pid in self.table.pids() {
            let running = self
                .table
                .get_mut(pid)
                .map(|p| p.is_running())
                .unwrap_or(false);
            if running {
                continue;
            }
            let was_busy = !self.table.is_free(pid);
            if let Some(process) = self.table.remove(pid) {
                let exit_status = process.exit_status().unwrap_or(-1);
                if was_busy {
                    warn!(pid, exit_status, "worker died while busy");
                    self.results
                        .push_back(WorkerResult::new(pid, TaskOutcome::Terminated { exit_status }));
                } else {
                    debug!(pid, exit_status, "discarding dead idle worker");
                }
            }
        }

        // Responses that were drained out of order during dispatch.
        for pid in self.table.pids() {
            let deferred = match self.table.get_mut(pid) {
                Some(process) => process.take_deferred(),
                None => continue,
            };
            for message in deferred {
                self.record(pid, &message);
            }
        }

        let ready = {
            let channels = self
                .table
                .procs
                .values()
                .filter_map(|p| p.channel());
            transport::select(channels, timeout)?
        };

        for pid in ready {
            let pid = pid.as_raw();
            let Some(process) = self.table.get_mut(pid) else {
                continue;
            };
            let message = process.receive_pending()?;
            if message.is_exception() {
                // Termination notice. Only a death with a task in flight
                // owes that task a result.
                if !self.table.is_free(pid) {
                    self.record(pid, &message);
                }
                self.table.remove(pid);
                continue;
            }
            self.table.mark_free(pid);
            self.record(pid, &message);
        }
        Ok(())
    }

    /// Classify a worker message into the result queue. "No result"
    /// responses are dropped.
    fn record(&mut self, pid: i32, message: &Message) {
        let outcome = match &message.payload {
            Payload::None => return,
            Payload::Data { value } => TaskOutcome::Data(value.clone()),
            Payload::WorkerError { error } => TaskOutcome::WorkerError(error.clone()),
            Payload::PoolError { error } => TaskOutcome::PoolError(error.clone()),
            Payload::Terminated { exit_status, .. } => TaskOutcome::Terminated {
                exit_status: *exit_status,
            },
        };
        trace!(pid, outcome = ?outcome, "collected result");
        self.results.push_back(WorkerResult::new(pid, outcome));
    }

    /// Block until no worker is busy, collecting results along the way.
    pub fn wait_for_all_workers(&mut self) -> Result<()> {
        self.ensure_usable()?;
        loop {
            self.collect(Duration::ZERO)?;
            if self.table.len() == self.table.free_count() {
                return Ok(());
            }
            self.collect(WAIT_TICK)?;
        }
    }

    /// Destroy workers idle longer than the configured timeout, never
    /// shrinking below the minimum. A no-op when idle reaping is disabled.
    pub fn terminate_idle_workers(&mut self) -> Result<()> {
        self.ensure_usable()?;
        let Some(idle_timeout) = self.config.idle_timeout else {
            return Ok(());
        };
        self.collect(Duration::ZERO)?;

        let mut expired: Vec<i32> = Vec::new();
        for pid in self.table.pids() {
            if !self.table.is_free(pid) {
                continue;
            }
            if let Some(process) = self.table.get_mut(pid)
                && let Some(idle) = process.idle_time()
                && idle >= idle_timeout
            {
                expired.push(pid);
            }
        }

        let destroy_timeout = self.config.destroy_timeout;
        for pid in expired {
            if self.table.len() <= self.config.min_workers {
                break;
            }
            if let Some(mut process) = self.table.remove(pid) {
                info!(pid, "terminating idle worker");
                if let Err(e) = process.destroy(destroy_timeout) {
                    warn!(pid, error = %e, "idle worker did not shut down cleanly");
                }
            }
        }
        Ok(())
    }

    /// Number of workers with no task in flight.
    pub fn free_workers(&mut self) -> Result<usize> {
        self.ensure_usable()?;
        self.collect(Duration::ZERO)?;
        Ok(self.table.free_count())
    }

    /// Number of workers currently handling a task.
    pub fn busy_workers(&mut self) -> Result<usize> {
        let (_, busy) = self.free_and_busy_workers()?;
        Ok(busy)
    }

    /// Free and busy counts from one snapshot, so they always sum to the
    /// total.
    pub fn free_and_busy_workers(&mut self) -> Result<(usize, usize)> {
        self.ensure_usable()?;
        self.collect(Duration::ZERO)?;
        let free = self.table.free_count();
        Ok((free, self.table.len() - free))
    }

    /// Total number of live worker processes.
    pub fn total_workers(&mut self) -> Result<usize> {
        self.ensure_usable()?;
        self.collect(Duration::ZERO)?;
        Ok(self.table.len())
    }

    /// Are any results waiting to be taken?
    pub fn has_results(&mut self) -> Result<bool> {
        Ok(self.count_results()? > 0)
    }

    /// Number of collected results waiting to be taken.
    pub fn count_results(&mut self) -> Result<usize> {
        self.ensure_usable()?;
        self.collect(Duration::ZERO)?;
        Ok(self.results.len())
    }

    /// Take the oldest collected result.
    pub fn next_result(&mut self) -> Result<Option<WorkerResult>> {
        self.ensure_usable()?;
        self.collect(Duration::ZERO)?;
        Ok(self.results.pop_front())
    }

    /// Drain all collected results.
    pub fn results(&mut self) -> Result<Vec<WorkerResult>> {
        self.ensure_usable()?;
        self.collect(Duration::ZERO)?;
        Ok(self.results.drain(..).collect())
    }

    /// Tear the pool down: destroy every worker, discard the table, and
    /// destroy the semaphore.
    ///
    /// Only the process that started the pool tears it down; in any other
    /// process this is a no-op, so a forked child can never destroy its
    /// parent's workers or semaphore.
    pub fn destroy(&mut self, max_wait: Duration) -> Result<()> {
        self.ensure_usable()?;
        if self.created_by != Some(Pid::this()) {
            debug!("destroy called from a process that did not start the pool, ignoring");
            return Ok(());
        }
        self.destroyed = true;

        let workers = self.table.drain();
        info!(workers = workers.len(), "destroying worker pool");
        for mut process in workers {
            // Broken workers are covered by the SIGKILL escalation.
            if let Err(e) = process.destroy(max_wait) {
                debug!(pid = ?process.pid(), error = %e, "worker destroy reported an error");
            }
        }

        if let Some(semaphore) = self.semaphore.as_mut()
            && let Err(e) = semaphore.destroy()
        {
            warn!(error = %e, "failed to destroy pool semaphore");
        }
        Ok(())
    }
}

impl<W: Worker + Clone> Drop for WorkerPool<W> {
    fn drop(&mut self) {
        if self.started && !self.destroyed {
            let timeout = self.config.destroy_timeout;
            let _ = self.destroy(timeout);
        }
    }
}
