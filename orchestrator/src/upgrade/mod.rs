//! Upgrade orchestration core

pub mod cancel;
pub mod fsm;
pub mod ha;
pub mod machine;
pub mod progress;
pub mod retry;
pub mod scheduler;
