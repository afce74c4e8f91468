//! Trait definitions for hardware abstraction and the host channel.
//!
//! These abstractions let the protocol engines run on:
//! - real hardware (GPIO lines, PWM outputs, UART)
//! - the simulated bus in [`crate::hal::sim`]
//! - the recording mocks in [`crate::hal::mock`]
//!
//! # Submodules
//!
//! - `hardware`: bus lines, tick phases, actuator outputs
//! - `channel`: host command byte channel

pub mod channel;
pub mod hardware;

pub use channel::*;
pub use hardware::*;
