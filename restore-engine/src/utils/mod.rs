//! Utility modules for the restore engine.

pub mod errors;
pub mod escape;
pub mod lock;
pub mod logger;
pub mod process;

pub use errors::{RestoreError, Result};
