//! Binary application layer

pub mod console;
pub mod options;
pub mod run;
