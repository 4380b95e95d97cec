//! # API Request/Response Types
//!
//! This module defines the JSON structures for the HTTP API. Screen bodies
//! are [`crate::screens::ScreenView`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use stagehand_core::TableStats;

// =============================================================================
// HEALTH RESPONSE
// =============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub screens: usize,
}

impl HealthResponse {
    #[must_use]
    pub fn ok(screens: usize) -> Self {
        Self {
            status: "ok".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            screens,
        }
    }
}

// =============================================================================
// OPEN SCREEN
// =============================================================================

/// Open a roster screen, optionally keyed right away.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OpenRosterRequest {
    #[serde(default)]
    pub teacher_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OpenAssignmentRequest {
    #[serde(default)]
    pub assignment_id: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OpenProfileRequest {
    #[serde(default)]
    pub student_id: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenScreenResponse {
    pub screen_id: u64,
    pub kind: String,
}

// =============================================================================
// KEYS
// =============================================================================

/// New root key or selection. `null` clears (root) or unpins (selection).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyRequest {
    #[serde(default)]
    pub key: Value,
}

// =============================================================================
// REGISTRY
// =============================================================================

/// Drop a cached entry after a write changed the underlying data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvalidateRequest {
    pub stage: String,
    pub key: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvalidateResponse {
    pub removed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistryResponse {
    pub tables: Vec<TableStats>,
}
