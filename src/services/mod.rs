//! Hosted services around the [`Station`](crate::Station).
//!
//! - [`runner`]: a dedicated tick thread that owns the station and is
//!   reached through tokio sync channels

pub mod runner;

pub use runner::{spawn, StationHandle};
