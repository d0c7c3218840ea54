//! Process-level concerns: run exclusivity and signal handling.

pub mod lock;
pub mod shutdown;

pub use lock::LockGuard;
pub use shutdown::{ShutdownCoordinator, ShutdownSignal};
