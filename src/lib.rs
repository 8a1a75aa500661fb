pub mod bus;
pub mod config;
pub mod daemon;
pub mod dashboard;
pub mod error;
pub mod frontend;
pub mod lifecycle;
pub mod scheduler;
pub mod shutdown;
pub mod vm;
pub mod worker;
