//! fwfleet library
//!
//! Orchestration core for upgrading fleets of network appliances: phase
//! retry policies, the per-device upgrade state machine, HA pair
//! coordination and the bounded batch scheduler.

pub mod app;
pub mod device;
pub mod errors;
pub mod filesys;
pub mod logs;
pub mod models;
pub mod storage;
pub mod upgrade;
pub mod utils;

pub use errors::UpgradeError;
pub use upgrade::scheduler::{run_job, BatchScheduler};
