//! Data models

pub mod device;
pub mod job;
pub mod result;
pub mod version;
