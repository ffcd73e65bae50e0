//! Capsule manifest types.
//!
//! Records which paths a restore run displaced into the capsule and which it
//! failed to capture, so an operator can see how complete the rollback data is.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const MANIFEST_VERSION: u32 = 1;

/// Capsule manifest, serialized as `capsule.json` at the capsule root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub run_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub db_engine: String,
    pub captured: Vec<String>,
    pub failed: Vec<FailedCapture>,
}

/// A path the capsule could not take before it was destroyed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedCapture {
    pub path: String,
    pub reason: String,
}

impl Manifest {
    pub fn new(db_engine: &str) -> Self {
        Self {
            version: MANIFEST_VERSION,
            run_id: Uuid::new_v4(),
            created_at: Utc::now(),
            db_engine: db_engine.to_string(),
            captured: Vec::new(),
            failed: Vec::new(),
        }
    }
}
