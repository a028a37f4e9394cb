//! Client for the UltraContext versioned context store.
//!
//! [`AsyncContextClient`] and [`BlockingContextClient`] share one protocol
//! core and one kind of [`VersionTracker`], so mutations carry the last
//! version seen for their context and stale writes surface as conflicts.

pub mod adapter;
pub mod application;
pub mod config;
pub mod domain;
pub mod ports;

pub use application::{AsyncContextClient, BlockingContextClient};
pub use config::ClientConfig;
pub use domain::{UltraContextError, UltraContextResult, VersionTracker};
pub use ports::in_ports::ContextPort;

#[cfg(test)]
mod tests;
