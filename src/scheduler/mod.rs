//! Build tasks and the job-queue channel.
//!
//! # Components
//!
//! - [`BuildTask`], [`BuildStatus`], [`TaskUpdate`]: what flows between the
//!   frontend, the queue and the workers
//! - [`JobChannel`]: per-group task queues on the coordination store
//! - [`JobGrabber`]: polls the frontend and routes tasks to build groups

pub mod channel;
pub mod grabber;
pub mod job;

pub use channel::JobChannel;
pub use grabber::JobGrabber;
pub use job::{BuildStatus, BuildTask, TaskUpdate};
