//! meshcrawl network layer
//!
//! Everything that touches the outside world:
//! - HTTP transport with browser-like headers and optional proxy
//! - Link and document extraction from fetched markup
//! - Network identity rotation through VPN clients

pub mod links;
pub mod rotation;
pub mod transport;

pub use links::*;
pub use rotation::*;
pub use transport::*;
