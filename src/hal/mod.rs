//! Hardware Abstraction Layer implementations.
//!
//! This module contains concrete implementations of the traits
//! defined in [`crate::traits`] for desktop use.
//!
//! # Available Implementations
//!
//! - `mock`: Test doubles for lines, actuators and the host channel
//! - `sim`: An in-memory layout where slave engines share the master's
//!   lines (requires `std`)

pub mod mock;

#[cfg(feature = "std")]
pub mod sim;

pub use mock::*;

#[cfg(feature = "std")]
pub use sim::*;
