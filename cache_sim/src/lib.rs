mod bin;
pub mod cache;
pub mod config;
pub mod line;
pub mod memory;
pub mod program;
pub mod sim;

#[cfg(feature = "stat")]
pub mod stat;
