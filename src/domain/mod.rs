pub mod error;
pub mod model;
pub mod version_tracker;

pub use error::*;
pub use model::*;
pub use version_tracker::VersionTracker;
