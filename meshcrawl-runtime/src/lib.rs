//! meshcrawl runtime
//!
//! Drives one agent's crawl:
//! - Fetch and dedup engine writing into the storage layout
//! - Error escalation into identity rotation
//! - Depth-bounded crawl driver state machine
//! - Background coordination sync

pub mod driver;
pub mod engine;
pub mod escalation;
pub mod sync;

#[cfg(test)]
mod testing;

pub use driver::*;
pub use engine::*;
pub use escalation::*;
pub use sync::*;
