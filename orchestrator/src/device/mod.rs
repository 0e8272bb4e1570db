//! Device collaborators

pub mod client;
pub mod simulated;
