//! Error and fault types shared by the engines.
//!
//! Bus faults ([`FaultKind`]) are never fatal: the master handles them by
//! deleting the offending device and carrying on. The error enums describe
//! failures that are reported back to a caller instead.

use thiserror::Error;

/// Fault conditions raised by the bus engines.
///
/// The numeric code is what the host sees in the upper byte of the `l`
/// (last fault) reply.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum FaultKind {
    /// Start-bit pair not observed within the fault threshold.
    Sync = 1,
    /// Unexpected reply code during handshake or polling.
    Protocol = 2,
    /// Packet checksum or addressing did not match.
    Checksum = 3,
    /// No free device id for a new device.
    Capacity = 4,
}

impl FaultKind {
    /// Numeric code reported to the host.
    #[inline]
    pub const fn code(self) -> u8 {
        self as u8
    }
}

/// A received frame could not be turned into a packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum PacketError {
    /// Recomputed checksum disagrees with the transmitted one.
    #[error("checksum mismatch: expected {expected:#04x}, found {found:#04x}")]
    Checksum {
        /// Checksum computed from the packet fields.
        expected: u8,
        /// Checksum carried by the packet.
        found: u8,
    },
}

impl From<PacketError> for FaultKind {
    fn from(_: PacketError) -> Self {
        FaultKind::Checksum
    }
}

/// Host command could not be parsed or executed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum HostError {
    /// First byte is not a known opcode.
    #[error("unknown opcode {0:#04x}")]
    UnknownOpcode(u8),
    /// An argument byte is not a hex digit.
    #[error("invalid hex digit {0:#04x}")]
    InvalidHex(u8),
    /// Relayed packet failed checksum validation.
    #[error("relayed packet checksum mismatch")]
    Checksum,
    /// Addressed device is not connected or still in its handshake.
    #[error("device {0} is not available")]
    NoDevice(u8),
    /// Broadcast queue is full.
    #[error("broadcast queue is full")]
    Busy,
}

/// Configuration failed validation.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Identity length must be 0 or 3.
    #[error("identity length must be 0 or 3, got {0}")]
    IdentityLength(u8),
    /// Too many contact lines for the scanner.
    #[error("{0} contact lines exceeds the maximum of {max}", max = crate::scan::MAX_CONTACT_LINES)]
    TooManyLines(usize),
    /// Scan rule refers to a line that is not scanned.
    #[error("scan rule for line {line} but only {lines} lines are scanned")]
    RuleLine {
        /// Line named by the rule.
        line: u8,
        /// Configured line count.
        lines: u8,
    },
    /// Device id outside 1..=254.
    #[error("device id {0} is outside 1..=254")]
    DeviceId(u8),
    /// Fault threshold of zero would fault every receive immediately.
    #[error("fault threshold must be non-zero")]
    ZeroThreshold,
    /// TOML parse failure.
    #[cfg(feature = "toml")]
    #[error("failed to parse configuration: {0}")]
    Parse(std::string::String),
}

/// Errors from the tick thread handle.
#[cfg(feature = "runtime")]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum RunnerError {
    /// The tick thread has stopped.
    #[error("tick thread is not running")]
    Stopped,
    /// The station rejected a host command.
    #[error(transparent)]
    Host(#[from] HostError),
}
