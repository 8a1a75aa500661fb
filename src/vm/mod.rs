//! Build VM lifecycle management.
//!
//! # Components
//!
//! - [`VmState`]: lifecycle states and their wire names
//! - [`VmDescriptor`]: the per-VM record kept on the bus
//! - [`machine`]: pure transition rules (health results, watchdog, retries)
//! - [`VmManager`]: the only writer of descriptors and pool sets; used by the
//!   VM master and by workers for checkout and release
//! - [`VmMaster`]: the VM Manager process loop
//! - [`HealthChecker`]: probe abstraction, [`CommandHealthChecker`] in production
//!
//! # Checkout
//!
//! A VM is available exactly while its name is in the group's pool set.
//! Workers check out a VM by removing its name; the store reports removal to
//! one caller only, so two workers can never hold the same VM.

pub mod descriptor;
pub mod health;
pub mod machine;
pub mod manager;
pub mod master;
pub mod state;

pub use descriptor::VmDescriptor;
pub use health::{CommandHealthChecker, HealthChecker, HealthReport};
pub use machine::Transition;
pub use manager::VmManager;
pub use master::{TickReport, VmMaster};
pub use state::VmState;
