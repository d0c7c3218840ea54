//! Backup Rotate Library
//!
//! Yearly/monthly/daily backup rotation on top of a borg-style archive store:
//! picks the tier that is due, creates one archive per target directory and
//! prunes expired monthly and daily batches.

pub mod catalog;
pub mod config;
pub mod controller;
pub mod daemon;
pub mod executor;
pub mod hooks;
pub mod retention;
pub mod store;
pub mod tier;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use controller::{Controller, RunReport};
pub use tier::Tier;
pub use utils::errors::RotateError;
pub type Result<T> = std::result::Result<T, RotateError>;
