//! Restore Engine Library
//!
//! Applies a system backup (package list, filesystem overlay, change set,
//! account databases and database export) onto a live system, capturing
//! what it replaces into a rollback capsule.

pub mod changes;
pub mod config;
pub mod external;
pub mod fs;
pub mod hooks;
pub mod limits;
pub mod restore;
pub mod rollback;
pub mod snapshot;
pub mod userdb;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use utils::errors::RestoreError;
pub use utils::Result;
