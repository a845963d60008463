//! System V counting semaphore shared across fork.
//!
//! Used to serialize critical sections in user worker code running in
//! different processes. The pool's own control plane never takes it.

use crate::error::{PoolError, Result};
use nix::errno::Errno;
use nix::unistd::Pid;
use rand::Rng;
use std::os::raw::c_int;
use tracing::debug;

/// Attempts at finding an unused random key before giving up.
const RANDOM_KEY_RETRIES: u32 = 5;

/// Semaphore key selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SemKey {
    /// Pick a random unused key, retrying on collision.
    Random,
    /// Use a well-known key; attaches if the semaphore already exists.
    Fixed(i32),
}

#[derive(Debug, Clone)]
enum Inner {
    SysV {
        semid: c_int,
        key: i32,
        owner: Pid,
        destroyed: bool,
    },
    /// No-op variant: never blocks, never synchronizes.
    Disabled,
}

/// Cross-process counting semaphore.
///
/// Clones share the underlying kernel object; forked children inherit it.
#[derive(Debug, Clone)]
pub struct Semaphore {
    inner: Inner,
}

/// Releases on drop so `run_exclusively` cannot leak a held slot, even
/// when the closure panics.
struct ReleaseGuard<'a> {
    sem: &'a Semaphore,
}

impl Drop for ReleaseGuard<'_> {
    fn drop(&mut self) {
        let _ = self.sem.release();
    }
}

impl Semaphore {
    /// Create (or attach to) a semaphore with `max_holders` slots.
    ///
    /// `perms` are the IPC permission bits, e.g. `0o666`.
    pub fn create(key: SemKey, max_holders: u32, perms: u32) -> Result<Self> {
        if max_holders == 0 {
            return Err(PoolError::Semaphore(
                "max_holders must be at least 1".to_string(),
            ));
        }
        let flags = perms as c_int;

        match key {
            SemKey::Random => {
                let mut rng = rand::thread_rng();
                for _ in 0..RANDOM_KEY_RETRIES {
                    let key: i32 = rng.gen_range(1..i32::MAX);
                    match Self::get(key, flags | libc::IPC_CREAT | libc::IPC_EXCL) {
                        Ok(semid) => {
                            Self::set_value(semid, max_holders as c_int)?;
                            debug!(semid, key, "created semaphore");
                            return Ok(Self::sysv(semid, key));
                        }
                        Err(Errno::EEXIST) => continue,
                        Err(e) => {
                            return Err(PoolError::Semaphore(format!("semget failed: {}", e)));
                        }
                    }
                }
                Err(PoolError::Semaphore(format!(
                    "no unused semaphore key after {} attempts",
                    RANDOM_KEY_RETRIES
                )))
            }
            SemKey::Fixed(key) => {
                match Self::get(key, flags | libc::IPC_CREAT | libc::IPC_EXCL) {
                    Ok(semid) => {
                        Self::set_value(semid, max_holders as c_int)?;
                        debug!(semid, key, "created semaphore");
                        Ok(Self::sysv(semid, key))
                    }
                    // Already exists: attach without resetting its value.
                    Err(Errno::EEXIST) => match Self::get(key, flags) {
                        Ok(semid) => {
                            debug!(semid, key, "attached to existing semaphore");
                            Ok(Self::sysv(semid, key))
                        }
                        Err(e) => Err(PoolError::Semaphore(format!("semget failed: {}", e))),
                    },
                    Err(e) => Err(PoolError::Semaphore(format!("semget failed: {}", e))),
                }
            }
        }
    }

    /// A semaphore that satisfies the same surface but synchronizes nothing.
    pub fn disabled() -> Self {
        Self {
            inner: Inner::Disabled,
        }
    }

    fn sysv(semid: c_int, key: i32) -> Self {
        Self {
            inner: Inner::SysV {
                semid,
                key,
                owner: Pid::this(),
                destroyed: false,
            },
        }
    }

    fn get(key: i32, flags: c_int) -> std::result::Result<c_int, Errno> {
        let semid = unsafe { libc::semget(key as libc::key_t, 1, flags) };
        if semid < 0 { Err(Errno::last()) } else { Ok(semid) }
    }

    fn set_value(semid: c_int, value: c_int) -> Result<()> {
        let rc = unsafe { libc::semctl(semid, 0, libc::SETVAL, value) };
        if rc < 0 {
            return Err(PoolError::Semaphore(format!(
                "semctl SETVAL failed: {}",
                Errno::last()
            )));
        }
        Ok(())
    }

    fn semid(&self) -> Result<c_int> {
        match &self.inner {
            Inner::SysV { destroyed: true, .. } => Err(PoolError::Semaphore(
                "semaphore has been destroyed".to_string(),
            )),
            Inner::SysV { semid, .. } => Ok(*semid),
            Inner::Disabled => Err(PoolError::Semaphore(
                "semaphore is disabled".to_string(),
            )),
        }
    }

    fn op(&self, delta: i16) -> Result<()> {
        let semid = self.semid()?;
        let mut sop = libc::sembuf {
            sem_num: 0,
            sem_op: delta,
            sem_flg: libc::SEM_UNDO as i16,
        };
        loop {
            let rc = unsafe { libc::semop(semid, &mut sop, 1) };
            if rc == 0 {
                return Ok(());
            }
            match Errno::last() {
                Errno::EINTR => continue,
                e => return Err(PoolError::Semaphore(format!("semop failed: {}", e))),
            }
        }
    }

    /// Take one slot, blocking until one is available.
    pub fn acquire(&self) -> Result<()> {
        if matches!(self.inner, Inner::Disabled) {
            return Ok(());
        }
        self.op(-1)
    }

    /// Return one slot.
    pub fn release(&self) -> Result<()> {
        if matches!(self.inner, Inner::Disabled) {
            return Ok(());
        }
        self.op(1)
    }

    /// Run `f` while holding a slot. The slot is returned unconditionally,
    /// including when `f` panics.
    pub fn run_exclusively<T>(&self, f: impl FnOnce() -> T) -> Result<T> {
        self.acquire()?;
        let _guard = ReleaseGuard { sem: self };
        Ok(f())
    }

    /// Current number of free slots.
    pub fn value(&self) -> Result<i32> {
        if matches!(self.inner, Inner::Disabled) {
            return Ok(0);
        }
        let semid = self.semid()?;
        let rc = unsafe { libc::semctl(semid, 0, libc::GETVAL) };
        if rc < 0 {
            return Err(PoolError::Semaphore(format!(
                "semctl GETVAL failed: {}",
                Errno::last()
            )));
        }
        Ok(rc)
    }

    /// Pid of the process that created this handle.
    pub fn owner(&self) -> Option<Pid> {
        match &self.inner {
            Inner::SysV { owner, .. } => Some(*owner),
            Inner::Disabled => None,
        }
    }

    /// Remove the semaphore from the system.
    ///
    /// Fails on a second call or on any handle already destroyed.
    pub fn destroy(&mut self) -> Result<()> {
        match &mut self.inner {
            Inner::Disabled => Ok(()),
            Inner::SysV { destroyed: true, .. } => Err(PoolError::Semaphore(
                "semaphore already destroyed".to_string(),
            )),
            Inner::SysV {
                semid, destroyed, key, ..
            } => {
                let rc = unsafe { libc::semctl(*semid, 0, libc::IPC_RMID) };
                *destroyed = true;
                if rc < 0 {
                    return Err(PoolError::Semaphore(format!(
                        "semctl IPC_RMID failed: {}",
                        Errno::last()
                    )));
                }
                debug!(semid = *semid, key = *key, "destroyed semaphore");
                Ok(())
            }
        }
    }
}
