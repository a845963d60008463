//! Child process lifecycle and request/response plumbing.
//!
//! A [`Process`] forks a child running a [`ChildRun`] loop, keeps a framed
//! channel to it, and tracks its status through the supervisor's reap
//! callbacks. One request is in flight per channel at a time; stale
//! responses are deferred and drained by the caller.

use crate::control::{ProcessControl, exit_status_of};
use crate::error::{PoolError, Result};
use crate::message::{Message, Payload};
use crate::transport::Channel;
use nix::sys::signal::{self, SigHandler, Signal};
use nix::unistd::{ForkResult, Pid, fork, getppid};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, error, trace, warn};

/// Granularity of the bounded waits in this module.
const WAIT_TICK: Duration = Duration::from_millis(10);

/// How long to wait for an unresponsive child before SIGKILL when a
/// transport break already told us it is going away.
const EXIT_GRACE: Duration = Duration::from_secs(2);

/// Lifecycle states of a forked process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Created, not yet forked.
    Initializing,
    /// Running, no request in flight.
    Idle,
    /// Running, a request is in flight.
    Busy,
    /// Asked to exit, not yet reaped.
    Exiting,
    /// Reaped after a clean exit.
    Exited,
    /// Reaped after a non-zero exit or a signal death.
    Aborted,
}

/// Logic executed in the child after the fork.
pub trait ChildRun {
    /// Runs once in the child before the receive loop.
    fn on_create(&mut self) -> Result<()> {
        Ok(())
    }

    /// Handle one request; the returned payload becomes the response body.
    fn handle(&mut self, procedure: &str, payload: Payload) -> Payload;

    /// Runs once in the child after the receive loop ends.
    fn on_exit(&mut self) {}
}

/// State shared with the supervisor's reap callback.
struct Shared {
    status: Status,
    exit_status: Option<i32>,
    idle_since: Instant,
}

/// Handle to one forked child process.
pub struct Process<C: ChildRun> {
    child_logic: Option<C>,
    pid: Option<Pid>,
    channel: Option<Channel>,
    shared: Arc<Mutex<Shared>>,
    control: &'static ProcessControl,
    /// Responses received out of order, drained by the caller.
    deferred: Vec<Message>,
    destroying: bool,
}

impl<C: ChildRun> Process<C> {
    /// Create a process handle; nothing is forked until [`start`].
    ///
    /// [`start`]: Process::start
    pub fn new(child_logic: C) -> Self {
        Self::with_supervisor(child_logic, ProcessControl::instance())
    }

    /// Like [`new`], but with an explicit supervisor reference.
    ///
    /// [`new`]: Process::new
    pub fn with_supervisor(child_logic: C, control: &'static ProcessControl) -> Self {
        Self {
            child_logic: Some(child_logic),
            control,
            pid: None,
            channel: None,
            shared: Arc::new(Mutex::new(Shared {
                status: Status::Initializing,
                exit_status: None,
                idle_since: Instant::now(),
            })),
            deferred: Vec::new(),
            destroying: false,
        }
    }

    /// Fork the child and wire up the channel.
    ///
    /// Fails with `InvalidOperation` when called twice.
    pub fn start(&mut self) -> Result<()> {
        if self.pid.is_some() {
            return Err(PoolError::InvalidOperation(
                "process already started".to_string(),
            ));
        }
        let logic = self
            .child_logic
            .take()
            .ok_or_else(|| PoolError::InvalidOperation("process already started".to_string()))?;

        let control = self.control;
        let (parent_half, child_half) = Channel::pair()?;

        match unsafe { fork() }.map_err(|e| PoolError::Fork(e.to_string()))? {
            ForkResult::Child => {
                drop(parent_half);
                let channel = Channel::new(child_half, getppid());
                run_child_loop(logic, channel);
            }
            ForkResult::Parent { child } => {
                drop(child_half);
                self.pid = Some(child);
                self.channel = Some(Channel::new(parent_half, child));

                let shared = Arc::clone(&self.shared);
                control.on_reaped(
                    child,
                    Box::new(move |wait_status| {
                        let code = exit_status_of(wait_status);
                        let mut s = shared.lock().unwrap_or_else(PoisonError::into_inner);
                        s.exit_status = Some(code);
                        s.status = if code == 0 {
                            Status::Exited
                        } else {
                            Status::Aborted
                        };
                    }),
                );

                {
                    let mut s = self.lock();
                    s.status = Status::Idle;
                    s.idle_since = Instant::now();
                }
                debug!(pid = child.as_raw(), "forked child process");
                Ok(())
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pid of the child, once started.
    pub fn pid(&self) -> Option<Pid> {
        self.pid
    }

    /// Current lifecycle status.
    pub fn status(&self) -> Status {
        self.lock().status
    }

    /// Exit status once the child has been reaped.
    pub fn exit_status(&self) -> Option<i32> {
        self.lock().exit_status
    }

    /// Is the OS process still running (i.e. not reaped)?
    pub fn is_running(&self) -> bool {
        self.pid.is_some() && !matches!(self.status(), Status::Exited | Status::Aborted)
    }

    /// Time since the process last finished a request, while idle.
    pub fn idle_time(&self) -> Option<Duration> {
        let s = self.lock();
        if s.status == Status::Idle {
            Some(s.idle_since.elapsed())
        } else {
            None
        }
    }

    /// The parent-side channel, for multiplexed waits.
    pub fn channel(&self) -> Option<&Channel> {
        self.channel.as_ref()
    }

    /// Drain messages that arrived out of order.
    pub fn take_deferred(&mut self) -> Vec<Message> {
        std::mem::take(&mut self.deferred)
    }

    /// Queue a message for a later drain.
    pub fn defer(&mut self, message: Message) {
        self.deferred.push(message);
    }

    /// Send a request to the child.
    ///
    /// With `wait_for_response`, blocks until the matching response (or an
    /// exception) arrives and returns it. Without, returns `Ok(None)` right
    /// after the send and the response is picked up by a later receive.
    ///
    /// If the child is already dead, or dies mid-call, a synthesized
    /// termination message is returned instead of an error.
    pub fn invoke(
        &mut self,
        procedure: &str,
        payload: Payload,
        wait_for_response: bool,
    ) -> Result<Option<Message>> {
        if self.pid.is_none() {
            return Err(PoolError::InvalidOperation(
                "process has not been started".to_string(),
            ));
        }

        // Never two requests in flight on one channel: drain the pending
        // response first and hold it for the caller.
        while self.status() == Status::Busy {
            let msg = self.receive_pending()?;
            // Termination notices are not deferred; the liveness check
            // below reports the death to this caller directly.
            if !msg.is_exception() {
                self.defer(msg);
            }
        }

        if !self.is_running() {
            return Ok(Some(self.termination_message()));
        }

        let request = Message::request(procedure, payload, !wait_for_response)?;
        {
            let mut s = self.lock();
            s.status = Status::Busy;
        }

        let send_result = match self.channel.as_mut() {
            Some(channel) => channel.send(&request),
            None => Err(PoolError::Transport("channel closed".to_string())),
        };
        if let Err(e) = send_result {
            trace!(pid = ?self.pid, error = %e, "send failed, treating as termination");
            return Ok(Some(self.termination_message()));
        }

        if !wait_for_response {
            return Ok(None);
        }

        loop {
            let msg = self.receive_pending()?;
            if msg.id == request.id || msg.is_exception() {
                return Ok(Some(msg));
            }
            trace!(id = msg.id, expected = request.id, "deferring stale response");
            self.defer(msg);
        }
    }

    /// Receive the next message from the child, blocking while yielding to
    /// signal dispatch. A dead or disconnecting child yields a synthesized
    /// termination message.
    pub fn receive_pending(&mut self) -> Result<Message> {
        let control = self.control;
        loop {
            control.dispatch();
            if !self.is_running() {
                return Ok(self.termination_message());
            }
            let readable = match self.channel.as_ref() {
                Some(channel) => channel.ready(WAIT_TICK)?,
                None => return Ok(self.termination_message()),
            };
            if !readable {
                continue;
            }
            let received = match self.channel.as_mut() {
                Some(channel) => channel.receive::<Message>(),
                None => return Ok(self.termination_message()),
            };
            match received {
                Ok(Some(msg)) => {
                    let mut s = self.lock();
                    if matches!(s.status, Status::Busy) {
                        s.status = Status::Idle;
                        s.idle_since = Instant::now();
                    }
                    return Ok(msg);
                }
                // EOF or a broken frame: the child is going away.
                Ok(None) => return Ok(self.termination_message()),
                Err(e) => {
                    trace!(pid = ?self.pid, error = %e, "receive failed, treating as termination");
                    return Ok(self.termination_message());
                }
            }
        }
    }

    /// Wait for the child to be reaped and build the termination message
    /// attributed to it. Escalates to SIGKILL if the child lingers after
    /// its channel broke.
    fn termination_message(&mut self) -> Message {
        let control = self.control;
        let pid = self.pid;
        let start = Instant::now();
        let mut killed = false;
        while self.is_running() {
            if !killed && start.elapsed() > EXIT_GRACE {
                if let Some(pid) = pid {
                    warn!(pid = pid.as_raw(), "child unresponsive, sending SIGKILL");
                    let _ = signal::kill(pid, Signal::SIGKILL);
                }
                killed = true;
            }
            control.sleep_and_dispatch(WAIT_TICK);
            control.reap_now();
        }
        // Channel to a dead process is useless; drop it now.
        self.channel = None;
        let exit_status = self.exit_status().unwrap_or(-1);
        let raw_pid = pid.map(Pid::as_raw).unwrap_or(-1);
        Message::exception(Payload::Terminated {
            pid: raw_pid,
            exit_status,
        })
        .override_pid(raw_pid)
    }

    /// Ask the child to exit, escalating to SIGKILL after `max_wait`.
    ///
    /// Always returns with the OS process gone and reaped. Calling destroy
    /// twice, or before start, fails with `InvalidOperation`.
    pub fn destroy(&mut self, max_wait: Duration) -> Result<()> {
        if self.pid.is_none() {
            return Err(PoolError::InvalidOperation(
                "cannot destroy a process that was never started".to_string(),
            ));
        }
        if self.destroying {
            return Err(PoolError::InvalidOperation(
                "process is already being destroyed".to_string(),
            ));
        }
        self.destroying = true;

        let control = self.control;
        if !self.is_running() {
            self.channel = None;
            return Ok(());
        }

        {
            let mut s = self.lock();
            s.status = Status::Exiting;
        }
        if let Some(channel) = self.channel.as_mut() {
            // A broken channel is fine; the escalation below covers it.
            let _ = channel.send(&Message::exit());
        }

        let deadline = Instant::now() + max_wait;
        while self.is_running() && Instant::now() < deadline {
            control.sleep_and_dispatch(WAIT_TICK);
            control.reap_now();
        }

        if self.is_running()
            && let Some(pid) = self.pid
        {
            debug!(pid = pid.as_raw(), "graceful exit timed out, sending SIGKILL");
            let _ = signal::kill(pid, Signal::SIGKILL);
            while self.is_running() {
                control.sleep_and_dispatch(WAIT_TICK);
                control.reap_now();
            }
        }

        self.channel = None;
        Ok(())
    }
}

impl<C: ChildRun> Drop for Process<C> {
    fn drop(&mut self) {
        if self.pid.is_some() && !self.destroying && self.is_running() {
            let _ = self.destroy(Duration::from_millis(500));
        }
    }
}

/// Receive/dispatch loop run in the forked child. Never returns.
fn run_child_loop<C: ChildRun>(mut logic: C, mut channel: Channel) -> ! {
    // The parent may vanish at any time; a write then raises SIGPIPE,
    // which must not kill the worker before it can notice the EOF.
    unsafe {
        let _ = signal::signal(Signal::SIGPIPE, SigHandler::SigIgn);
    }

    if let Err(e) = logic.on_create() {
        error!(error = %e, "worker create hook failed");
        std::process::exit(1);
    }

    loop {
        let msg: Message = match channel.receive() {
            Ok(Some(msg)) => msg,
            // EOF or a protocol break both end the loop.
            Ok(None) => break,
            Err(_) => break,
        };
        if msg.is_exit() {
            break;
        }

        let procedure = msg.procedure.clone();
        let payload = msg.payload.clone();
        let result = catch_unwind(AssertUnwindSafe(|| logic.handle(&procedure, payload)))
            .unwrap_or_else(|panic_payload| Payload::WorkerError {
                error: crate::message::ErrorRecord::from_panic(panic_payload.as_ref()),
            });

        if channel.send(&msg.respond(result)).is_err() {
            break;
        }
    }

    logic.on_exit();
    std::process::exit(0);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Clone)]
    struct EchoChild;

    impl ChildRun for EchoChild {
        fn handle(&mut self, _procedure: &str, payload: Payload) -> Payload {
            payload
        }
    }

    #[derive(Clone)]
    struct ExitingChild {
        code: i32,
    }

    impl ChildRun for ExitingChild {
        fn handle(&mut self, _procedure: &str, _payload: Payload) -> Payload {
            std::process::exit(self.code);
        }
    }

    #[derive(Clone)]
    struct PanickingChild;

    impl ChildRun for PanickingChild {
        fn handle(&mut self, _procedure: &str, _payload: Payload) -> Payload {
            panic!("boom");
        }
    }

    #[test]
    fn test_invoke_before_start_fails() {
        let mut proc = Process::new(EchoChild);
        let err = proc.invoke("ping", Payload::None, true).unwrap_err();
        assert!(matches!(err, PoolError::InvalidOperation(_)));
    }

    #[test]
    fn test_start_twice_fails() {
        let mut proc = Process::new(EchoChild);
        proc.start().unwrap();
        let err = proc.start().unwrap_err();
        assert!(matches!(err, PoolError::InvalidOperation(_)));
        proc.destroy(Duration::from_secs(2)).unwrap();
    }

    #[test]
    fn test_invoke_round_trip() {
        let mut proc = Process::new(EchoChild);
        proc.start().unwrap();
        assert_eq!(proc.status(), Status::Idle);

        let input = json!({"n": 5});
        let response = proc
            .invoke("ping", Payload::Data { value: input.clone() }, true)
            .unwrap()
            .unwrap();
        assert_eq!(response.payload, Payload::Data { value: input });
        assert_eq!(proc.status(), Status::Idle);

        proc.destroy(Duration::from_secs(2)).unwrap();
        assert!(!proc.is_running());
    }

    #[test]
    fn test_invoke_on_dead_child_synthesizes_termination() {
        let mut proc = Process::new(ExitingChild { code: 42 });
        proc.start().unwrap();

        let response = proc.invoke("die", Payload::None, true).unwrap().unwrap();
        assert!(response.is_exception());
        match response.payload {
            Payload::Terminated { pid, exit_status } => {
                assert_eq!(pid, proc.pid().unwrap().as_raw());
                assert_eq!(exit_status, 42);
            }
            other => panic!("expected Terminated payload, got {:?}", other),
        }

        // Further invokes keep reporting the termination, not hanging.
        let again = proc.invoke("die", Payload::None, true).unwrap().unwrap();
        assert!(matches!(again.payload, Payload::Terminated { .. }));

        let _ = proc.destroy(Duration::from_secs(1));
    }

    #[test]
    fn test_panic_in_handler_becomes_worker_error() {
        let mut proc = Process::new(PanickingChild);
        proc.start().unwrap();

        let response = proc.invoke("go", Payload::None, true).unwrap().unwrap();
        match response.payload {
            Payload::WorkerError { error } => {
                assert_eq!(error.class, "Panic");
                assert!(error.message.contains("boom"));
            }
            other => panic!("expected WorkerError payload, got {:?}", other),
        }

        proc.destroy(Duration::from_secs(2)).unwrap();
    }

    #[test]
    fn test_destroy_twice_fails() {
        let mut proc = Process::new(EchoChild);
        proc.start().unwrap();
        proc.destroy(Duration::from_secs(2)).unwrap();
        let err = proc.destroy(Duration::from_secs(2)).unwrap_err();
        assert!(matches!(err, PoolError::InvalidOperation(_)));
    }

    #[test]
    fn test_destroy_zero_wait_is_bounded() {
        let mut proc = Process::new(EchoChild);
        proc.start().unwrap();

        let start = Instant::now();
        proc.destroy(Duration::ZERO).unwrap();
        assert!(!proc.is_running());
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_async_invoke_returns_immediately() {
        let mut proc = Process::new(EchoChild);
        proc.start().unwrap();

        let none = proc
            .invoke("ping", Payload::Data { value: json!(1) }, false)
            .unwrap();
        assert!(none.is_none());
        assert_eq!(proc.status(), Status::Busy);

        // The next invoke drains the in-flight response and defers it.
        let response = proc
            .invoke("ping", Payload::Data { value: json!(2) }, true)
            .unwrap()
            .unwrap();
        assert_eq!(response.payload, Payload::Data { value: json!(2) });

        let deferred = proc.take_deferred();
        assert_eq!(deferred.len(), 1);
        assert_eq!(deferred[0].payload, Payload::Data { value: json!(1) });

        proc.destroy(Duration::from_secs(2)).unwrap();
    }
}
