//! Worker processes and their supervision.
//!
//! # Components
//!
//! - [`ProcessHandle`] / [`WorkerSpawner`]: the seam between pools and OS processes
//! - [`WorkerPool`]: keeps one build group at its configured worker count
//! - [`BuildExecutor`]: runs the external builder for a task on a VM
//! - [`BuildWorker`]: the loop inside each worker process
//!
//! # Worker Flow
//!
//! 1. Claim the oldest task of the group from the job channel
//! 2. Confirm with the frontend that the task may start
//! 3. Check out a ready VM, waiting if none is available
//! 4. Build, listening on the VM's interrupt topic for cancellation
//! 5. Report the result, release the VM, forget the task

pub mod executor;
pub mod pool;
pub mod process;
pub mod runner;

pub use executor::{BuildExecutor, BuildOutcome, ExecutionResult};
pub use pool::{worker_name, WorkerHandle, WorkerPool};
pub use process::{ChildProcess, ChildSpawner, ProcessHandle, WorkerSpawner};
pub use runner::{BuildWorker, TaskOutcome};
