//! # twpc-rail
//!
//! A model railway controller for a Two-Wire Power Communication (TWPC) bus:
//! one master station powers and polls up to 254 trains and stations over
//! the same two conductors, and scans contact sensor lines to see which
//! train is where.
//!
//! ## Features
//!
//! - **Tick-driven engines**: every state machine advances one step per
//!   scheduler tick, no blocking waits
//! - **Bus enumeration**: new devices answer an invitation and get the lowest
//!   free id, then identify themselves
//! - **Round-robin polling**: one exchange per device per round, faulty
//!   devices are dropped rather than retried
//! - **Contact scan**: self-timed presence pulse and 8-bit id with a trailing
//!   check bit, deduplicated per line
//! - **Host protocol**: single-letter commands with hex arguments over any
//!   byte channel
//!
//! ## Architecture
//!
//! The crate is structured to allow testing on desktop without hardware:
//!
//! - `traits` - Line, actuator and host channel abstractions
//! - `packet` / `codec` - Frame layout, checksum and the bit-level transceiver
//! - `master` / `slave` - The two ends of the TWPC bus
//! - `scan` - Contact scanner and the train-side responder
//! - `station` - Master, scanner and host dispatch on one set of lines
//! - `hal` - Mock lines and a simulated layout
//!
//! ## Example
//!
//! ```rust
//! use twpc_rail::{
//!     config::{Config, DeviceConfig},
//!     hal::SimBus,
//!     HostCommand, HostReply, Station,
//! };
//!
//! // One train on a simulated layout
//! let config = Config::default();
//! let mut bus = SimBus::new(&config.bus);
//! bus.attach(&DeviceConfig::default());
//!
//! let mut station = Station::new(&config, bus);
//! assert!(station.run_until(2000, |s| s.master().table().get(1).is_some_and(|e| e.is_ready())));
//!
//! // Broadcast the lights on and let the master send it
//! assert_eq!(station.execute(HostCommand::LightOn), Ok(HostReply::On));
//! station.run_cycles(200);
//! assert!(station.lines().slave(0).unwrap().actuator().light);
//! ```

#![cfg_attr(not(feature = "std"), no_std)]
#![warn(missing_docs)]

/// Bit-level transceiver shared by master and slave.
pub mod codec;
/// Host command parser, replies and notices.
pub mod commands;
/// Shared configuration for station and devices.
pub mod config;
/// Id-indexed table of bus devices.
pub mod device_table;
/// Error and fault types.
pub mod error;
/// Hardware abstraction layer with mock and simulated implementations.
pub mod hal;
/// TWPC bus master: enumeration and polling.
pub mod master;
/// Packet layout, opcodes and checksum.
pub mod packet;
/// Contact-scan engine and responder.
pub mod scan;
/// TWPC bus slave.
pub mod slave;
/// Master station tying bus, scanner and host together.
pub mod station;
/// Core traits for hardware abstraction.
pub mod traits;

/// Serializable snapshots (serde-based).
#[cfg(feature = "serde")]
pub mod messages;

/// Hosted services (tick thread).
#[cfg(feature = "runtime")]
pub mod services;

pub use commands::{HostCommand, HostLink, HostNotice, HostParser, HostReply};
pub use config::{BusConfig, Config, DeviceConfig, HostConfig, ScanConfig, ScanRule};
pub use device_table::{DeviceEntry, DeviceKind, DeviceTable, HandshakeStage};
pub use error::{ConfigError, FaultKind, HostError, PacketError};
pub use master::{FaultRecord, MasterEngine, MasterEvent, MasterState};
pub use packet::{DeviceType, Opcode, Packet, PacketFormat};
pub use scan::{ContactResponder, ContactScanner, ScanReport, ScanStats};
pub use slave::{SlaveEngine, SlaveEvent, SlaveState};
pub use station::{Station, StationEvent};
pub use traits::{Actuator, Direction, HostChannel, Line, LineInterface, Output, Phase};

#[cfg(feature = "runtime")]
pub use error::RunnerError;
