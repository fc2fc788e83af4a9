//! meshcrawl core - crawl state and coordination primitives
//!
//! This crate provides the building blocks shared by every agent:
//! - URL classification, normalization and skip-lists
//! - Storage layout mirroring the URL hierarchy
//! - Content fingerprint index for duplicate detection
//! - Local progress snapshots and the shared coordination record
//! - Agent configuration

pub mod classifier;
pub mod config;
pub mod coordination;
pub mod fingerprint;
pub mod progress;
pub mod state;
pub mod storage;

pub use classifier::*;
pub use config::*;
pub use coordination::*;
pub use fingerprint::*;
pub use progress::*;
pub use state::*;
pub use storage::*;

/// Links are followed while the page depth is below this bound
pub const MAX_LINK_DEPTH: usize = 3;

/// ISO-8601 timestamp for state files
pub fn timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}
