//! Courier Core - shared vocabulary for the courier messaging stack
//!
//! Holds the error taxonomy, delivery trackers and statuses, and the
//! address grammar used by both the fabric and the messenger.

pub mod address;
pub mod error;
pub mod tracker;

// Re-exports for convenience
pub use address::Address;
pub use error::{Error, Progress, Result};
pub use tracker::{Direction, Status, Tracker, UpdateFlags};
