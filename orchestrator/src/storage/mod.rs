//! Settings and inventory files

pub mod inventory;
pub mod settings;
