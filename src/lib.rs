//! Process-based worker pool for Unix.
//!
//! A parent process forks worker processes, hands them tasks over framed
//! socket-pair channels, and collects the results asynchronously. Workers
//! that crash are detected through SIGCHLD, their in-flight task surfaces
//! as a termination result, and the pool respawns back to its minimum
//! size.
//!
//! # Architecture
//!
//! ```text
//!                     ┌─────────────────┐
//!                     │  Parent Process │
//!                     │  (WorkerPool)   │
//!                     └────────┬────────┘
//!                              │ socketpair per worker
//!               ┌──────────────┼──────────────┐
//!               │              │              │
//!         ┌─────▼─────┐  ┌─────▼─────┐  ┌─────▼─────┐
//!         │ Worker 1  │  │ Worker 2  │  │ Worker N  │
//!         │ (process) │  │ (process) │  │ (process) │
//!         └───────────┘  └───────────┘  └───────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use forkpool::{ClosureWorker, PoolConfig, WorkerPool};
//! use serde_json::{Value, json};
//!
//! # fn main() -> forkpool::Result<()> {
//! let worker = ClosureWorker::new(|input: Value| Ok(Some(input)));
//! let mut pool = WorkerPool::new(PoolConfig::new(1, 4)?, worker);
//! pool.start()?;
//!
//! for i in 0..10 {
//!     pool.run(json!(i))?;
//! }
//! pool.wait_for_all_workers()?;
//! for result in pool.results()? {
//!     println!("worker {} -> {:?}", result.pid, result.outcome);
//! }
//! pool.destroy(std::time::Duration::from_secs(5))?;
//! # Ok(())
//! # }
//! ```

pub mod control;
pub mod error;
pub mod message;
pub mod pool;
pub mod process;
pub mod result;
pub mod semaphore;
pub mod transport;
pub mod worker;

pub use control::ProcessControl;
pub use error::{PoolError, Result};
pub use message::{ErrorRecord, Message, Payload};
pub use pool::{ForkPolicy, PoolConfig, WorkerPool};
pub use process::{ChildRun, Process, Status};
pub use result::{TaskOutcome, WorkerResult};
pub use semaphore::{SemKey, Semaphore};
pub use transport::Channel;
pub use worker::{ClosureWorker, TaskResult, Worker, WorkerProcess};
