//! Shared data models for fwfleet

pub mod models;

pub use models::*;
