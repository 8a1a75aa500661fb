use thiserror::Error;

use crate::bus::BusError;
use crate::frontend::FrontendError;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Job broker error: {0}")]
    Broker(String),

    #[error("Backend error: {0}")]
    Fatal(String),

    #[error("{count} worker(s) of build group {group_id} died")]
    WorkerDied { group_id: u32, count: usize },

    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Frontend error: {0}")]
    Frontend(#[from] FrontendError),

    #[error("No such build status code: {0}")]
    UnknownStatus(i32),

    #[error("No such VM state: {0}")]
    UnknownVmState(String),

    #[error("Daemon setup failed: {0}")]
    Daemon(String),

    #[error("Interrupted by operator")]
    Interrupted,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BackendError {
    /// Process exit code for this error when it ends `main`.
    pub fn exit_code(&self) -> i32 {
        match self {
            BackendError::Interrupted => 130,
            _ => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, BackendError>;
