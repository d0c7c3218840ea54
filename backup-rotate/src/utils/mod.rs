//! Utility modules for the rotation controller.

pub mod errors;
pub mod logger;

pub use errors::{Result, RotateError};
