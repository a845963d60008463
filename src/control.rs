//! Process-wide signal supervision.
//!
//! The OS allows one handler per signal per process, so child reaping and
//! signal fan-out are centralized here. Handlers only set atomic flags;
//! the real work happens in [`ProcessControl::dispatch`], which every
//! blocking wait in the crate calls so bookkeeping keeps making progress.
//!
//! Registrations are keyed by the pid of the registering process. A forked
//! child inherits the registry memory but its own `dispatch` skips entries
//! owned by the parent, so children never consume parent callbacks.

use crate::error::Result;
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::os::raw::c_int;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock, PoisonError};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Signals available for graceful-shutdown subscriptions.
const TERM_SIGNALS: [Signal; 4] = [
    Signal::SIGTERM,
    Signal::SIGINT,
    Signal::SIGHUP,
    Signal::SIGQUIT,
];

/// Cap on buffered wait statuses nobody has claimed. Entries inherited
/// from a pre-fork parent are evicted first when the cap is hit.
const MAX_UNCLAIMED: usize = 256;

static CHILD_PENDING: AtomicBool = AtomicBool::new(false);
static TERM_PENDING: [AtomicBool; 4] = [const { AtomicBool::new(false) }; 4];

extern "C" fn flag_signal(signo: c_int) {
    if signo == Signal::SIGCHLD as c_int {
        CHILD_PENDING.store(true, Ordering::SeqCst);
        return;
    }
    for (i, sig) in TERM_SIGNALS.iter().enumerate() {
        if signo == *sig as c_int {
            TERM_PENDING[i].store(true, Ordering::SeqCst);
            return;
        }
    }
}

type ReapCallback = Box<dyn FnOnce(WaitStatus) + Send>;
type SignalCallback = Box<dyn FnMut(Signal) + Send>;

#[derive(Default)]
struct Registry {
    /// Termination callbacks keyed by (owner pid, child pid); delivered
    /// exactly once, the entry is removed on delivery.
    on_reaped: HashMap<(i32, i32), ReapCallback>,
    /// Generic signal subscriptions, keyed by owner pid.
    on_signal: Vec<(i32, Signal, SignalCallback)>,
    /// Terminal signals whose handler has been installed.
    installed: Vec<Signal>,
    /// Wait statuses reaped before any callback was registered, keyed by
    /// (owner pid, child pid). Claimed on registration.
    unclaimed: HashMap<(i32, i32), WaitStatus>,
}

/// Singleton signal supervisor.
pub struct ProcessControl {
    registry: Mutex<Registry>,
}

static INSTANCE: OnceLock<ProcessControl> = OnceLock::new();

impl ProcessControl {
    /// Get the supervisor, installing the SIGCHLD handler on first use.
    pub fn instance() -> &'static ProcessControl {
        INSTANCE.get_or_init(|| {
            let action = SigAction::new(
                SigHandler::Handler(flag_signal),
                SaFlags::SA_RESTART | SaFlags::SA_NOCLDSTOP,
                SigSet::empty(),
            );
            // Replacing the default SIGCHLD disposition cannot fail here.
            if let Err(e) = unsafe { sigaction(Signal::SIGCHLD, &action) } {
                warn!(error = %e, "failed to install SIGCHLD handler");
            }
            ProcessControl {
                registry: Mutex::new(Registry::default()),
            }
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a callback fired exactly once when `pid` is reaped.
    ///
    /// Only fires in the process that registered it. If the child was
    /// already reaped before registration, the callback fires immediately.
    pub fn on_reaped(&self, pid: Pid, callback: ReapCallback) {
        let me = Pid::this().as_raw();
        let mut reg = self.lock();
        if let Some(status) = reg.unclaimed.remove(&(me, pid.as_raw())) {
            drop(reg);
            callback(status);
        } else {
            reg.on_reaped.insert((me, pid.as_raw()), callback);
        }
    }

    /// Drop any reap registration or buffered status for `pid`.
    pub fn forget(&self, pid: Pid) {
        let me = Pid::this().as_raw();
        let mut reg = self.lock();
        reg.on_reaped.remove(&(me, pid.as_raw()));
        reg.unclaimed.remove(&(me, pid.as_raw()));
    }

    /// Subscribe to a terminal signal (SIGTERM, SIGINT, SIGHUP, SIGQUIT).
    ///
    /// The callback runs from `dispatch`, not from the handler, and only
    /// in the process that subscribed.
    pub fn on_signal(&self, signal: Signal, callback: SignalCallback) -> Result<()> {
        if !TERM_SIGNALS.contains(&signal) {
            return Err(crate::error::PoolError::InvalidOperation(format!(
                "cannot subscribe to {:?}",
                signal
            )));
        }
        let me = Pid::this().as_raw();
        let mut reg = self.lock();
        if !reg.installed.contains(&signal) {
            let action = SigAction::new(
                SigHandler::Handler(flag_signal),
                SaFlags::SA_RESTART,
                SigSet::empty(),
            );
            unsafe { sigaction(signal, &action) }.map_err(|e| {
                crate::error::PoolError::InvalidOperation(format!(
                    "failed to install handler for {:?}: {}",
                    signal, e
                ))
            })?;
            reg.installed.push(signal);
        }
        reg.on_signal.push((me, signal, callback));
        Ok(())
    }

    /// Drop all of the calling process's subscriptions for `signal`.
    ///
    /// Takes effect for deliveries after the current `dispatch` pass.
    pub fn unsubscribe(&self, signal: Signal) {
        let me = Pid::this().as_raw();
        self.lock()
            .on_signal
            .retain(|(owner, registered, _)| !(*owner == me && *registered == signal));
    }

    /// Run pending signal work: deliver terminal-signal callbacks and reap
    /// terminated children, firing their registered callbacks.
    pub fn dispatch(&self) {
        self.deliver_term_signals();
        if CHILD_PENDING.swap(false, Ordering::SeqCst) {
            self.reap_children();
        }
    }

    /// Reap synchronously, regardless of whether SIGCHLD is pending.
    pub fn reap_now(&self) {
        CHILD_PENDING.store(false, Ordering::SeqCst);
        self.reap_children();
    }

    /// Sleep while still yielding to signal dispatch.
    pub fn sleep_and_dispatch(&self, duration: Duration) {
        std::thread::sleep(duration);
        self.dispatch();
    }

    fn deliver_term_signals(&self) {
        let me = Pid::this().as_raw();
        for (i, sig) in TERM_SIGNALS.iter().enumerate() {
            if !TERM_PENDING[i].swap(false, Ordering::SeqCst) {
                continue;
            }
            debug!(signal = ?sig, "dispatching terminal signal");
            // Callbacks may call back into the supervisor, so they run
            // with the registry unlocked: take the matching entries out,
            // invoke them, then put them back.
            let mut hits: Vec<(i32, Signal, SignalCallback)> = Vec::new();
            {
                let mut reg = self.lock();
                let mut rest = Vec::new();
                for entry in std::mem::take(&mut reg.on_signal) {
                    if entry.0 == me && entry.1 == *sig {
                        hits.push(entry);
                    } else {
                        rest.push(entry);
                    }
                }
                reg.on_signal = rest;
            }
            for (_, _, callback) in hits.iter_mut() {
                callback(*sig);
            }
            self.lock().on_signal.append(&mut hits);
        }
    }

    fn reap_children(&self) {
        let me = Pid::this().as_raw();
        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => break,
                Ok(status) => {
                    let Some(pid) = status.pid() else { break };
                    trace!(pid = pid.as_raw(), status = ?status, "reaped child");
                    let callback = {
                        let mut reg = self.lock();
                        let callback = reg.on_reaped.remove(&(me, pid.as_raw()));
                        if callback.is_none() {
                            if reg.unclaimed.len() >= MAX_UNCLAIMED {
                                reg.unclaimed.retain(|&(owner, _), _| owner == me);
                            }
                            if reg.unclaimed.len() >= MAX_UNCLAIMED
                                && let Some(key) = reg.unclaimed.keys().next().copied()
                            {
                                reg.unclaimed.remove(&key);
                            }
                            reg.unclaimed.insert((me, pid.as_raw()), status);
                        }
                        callback
                    };
                    if let Some(callback) = callback {
                        callback(status);
                    }
                }
                // ECHILD: nothing left to reap.
                Err(_) => break,
            }
        }
    }
}

/// Exit status convention for a wait status: the exit code for plain
/// exits, `128 + signo` for signal deaths.
pub fn exit_status_of(status: WaitStatus) -> i32 {
    match status {
        WaitStatus::Exited(_, code) => code,
        WaitStatus::Signaled(_, signal, _) => 128 + signal as i32,
        _ => -1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::signal::kill;
    use nix::unistd::{ForkResult, fork};
    use std::sync::Arc;
    use std::sync::atomic::AtomicI32;

    #[test]
    fn test_exit_status_of() {
        let pid = Pid::from_raw(1);
        assert_eq!(exit_status_of(WaitStatus::Exited(pid, 42)), 42);
        assert_eq!(
            exit_status_of(WaitStatus::Signaled(pid, Signal::SIGKILL, false)),
            128 + 9
        );
        assert_eq!(exit_status_of(WaitStatus::StillAlive), -1);
    }

    #[test]
    fn test_reap_callback_fires_once() {
        let control = ProcessControl::instance();

        let child = match unsafe { fork() }.expect("fork failed") {
            ForkResult::Child => {
                std::process::exit(7);
            }
            ForkResult::Parent { child } => child,
        };

        let seen = Arc::new(AtomicI32::new(0));
        let seen_cb = Arc::clone(&seen);
        control.on_reaped(
            child,
            Box::new(move |status| {
                seen_cb.store(exit_status_of(status), Ordering::SeqCst);
            }),
        );

        let start = std::time::Instant::now();
        while seen.load(Ordering::SeqCst) == 0 && start.elapsed() < Duration::from_secs(5) {
            control.sleep_and_dispatch(Duration::from_millis(10));
            control.reap_now();
        }
        assert_eq!(seen.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn test_forget_drops_registration() {
        let control = ProcessControl::instance();

        // The child lingers so it cannot be reaped before forget() runs.
        let child = match unsafe { fork() }.expect("fork failed") {
            ForkResult::Child => {
                std::thread::sleep(Duration::from_millis(200));
                std::process::exit(0);
            }
            ForkResult::Parent { child } => child,
        };

        let fired = Arc::new(AtomicBool::new(false));
        let fired_cb = Arc::clone(&fired);
        control.on_reaped(
            child,
            Box::new(move |_| {
                fired_cb.store(true, Ordering::SeqCst);
            }),
        );
        control.forget(child);

        std::thread::sleep(Duration::from_millis(400));
        control.reap_now();
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[test]
    fn test_on_signal_rejects_unsupported() {
        let control = ProcessControl::instance();
        let result = control.on_signal(Signal::SIGUSR2, Box::new(|_| {}));
        assert!(result.is_err());
    }

    #[test]
    fn test_term_signal_subscription() {
        let control = ProcessControl::instance();

        let hit = Arc::new(AtomicBool::new(false));
        let hit_cb = Arc::clone(&hit);
        control
            .on_signal(
                Signal::SIGHUP,
                Box::new(move |_| {
                    hit_cb.store(true, Ordering::SeqCst);
                }),
            )
            .unwrap();

        kill(Pid::this(), Signal::SIGHUP).unwrap();
        // Delivery is asynchronous; keep dispatching until it lands.
        let start = std::time::Instant::now();
        while !hit.load(Ordering::SeqCst) && start.elapsed() < Duration::from_secs(2) {
            control.dispatch();
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(hit.load(Ordering::SeqCst));
    }

    #[test]
    fn test_signal_callback_may_reenter_supervisor() {
        let control = ProcessControl::instance();

        let hit = Arc::new(AtomicBool::new(false));
        let hit_cb = Arc::clone(&hit);
        control
            .on_signal(
                Signal::SIGQUIT,
                Box::new(move |_| {
                    // A shutdown callback typically drops registrations and
                    // triggers another dispatch pass; both must not block.
                    let control = ProcessControl::instance();
                    control.forget(Pid::from_raw(i32::MAX));
                    control.dispatch();
                    hit_cb.store(true, Ordering::SeqCst);
                }),
            )
            .unwrap();

        kill(Pid::this(), Signal::SIGQUIT).unwrap();
        let start = std::time::Instant::now();
        while !hit.load(Ordering::SeqCst) && start.elapsed() < Duration::from_secs(3) {
            control.dispatch();
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(hit.load(Ordering::SeqCst));
        control.unsubscribe(Signal::SIGQUIT);
    }

    #[test]
    fn test_unsubscribe_removes_signal_callbacks() {
        let control = ProcessControl::instance();

        let hits = Arc::new(AtomicI32::new(0));
        let hits_cb = Arc::clone(&hits);
        control
            .on_signal(
                Signal::SIGINT,
                Box::new(move |_| {
                    hits_cb.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();
        control.unsubscribe(Signal::SIGINT);

        kill(Pid::this(), Signal::SIGINT).unwrap();
        for _ in 0..100 {
            control.dispatch();
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }
}
