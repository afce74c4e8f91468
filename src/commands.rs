//! Host command protocol.
//!
//! The relay computer talks to the station over a byte channel. Every
//! command is one opcode character followed by a fixed number of hex
//! digits; whitespace between bytes is ignored. Every reply is one line.
//!
//! | Command | Arguments | Effect | Reply |
//! |---------|-----------|--------|-------|
//! | `1` | | broadcast LIGHT_ON | `on` |
//! | `0` | | broadcast LIGHT_OFF | `off` |
//! | `m` | `d ss` | broadcast MOTOR_A (`d` = 0) or MOTOR_B at speed `ss` | `motor` |
//! | `s` | | broadcast STOP | `stopped` |
//! | `g` | | connected-device bitmap | `XXXXXXXX,...` (8 words) |
//! | `c` | | enable enumeration | `con` |
//! | `r` | | cancel enumeration | `res` |
//! | `l` | | last fault record | `XXXXXXXX` |
//! | `i` | `id` | identity bytes of a device | `XXXXXX` |
//! | `p` | `uid cmd arg sum` | relay a checksummed packet | `ok` |
//!
//! Failures reply `?` (unknown opcode), `err` (bad hex digit), `retry`
//! (relayed checksum mismatch), `nodev` (device missing or not ready) or
//! `busy` (broadcast queue full).
//!
//! Besides replies the station may push notices: `tLLII` for a contact
//! report (line, id), `+II` and `-II` for devices joining and leaving.
//!
//! # Example
//!
//! ```rust
//! use twpc_rail::commands::{HostCommand, HostParser};
//!
//! let mut parser = HostParser::new();
//! let mut result = None;
//! for &b in b"m180" {
//!     result = parser.feed(b);
//! }
//! assert!(matches!(result, Some(Ok(HostCommand::Motor { speed: 0x80, .. }))));
//! ```

use core::fmt;
use core::fmt::Write as _;

use heapless::Vec;

use crate::device_table::BITMAP_WORDS;
use crate::error::HostError;
use crate::packet::Packet;
use crate::scan::ScanReport;
use crate::traits::{Direction, HostChannel};

// ============================================================================
// Commands
// ============================================================================

/// A decoded host command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HostCommand {
    /// Broadcast LIGHT_ON.
    LightOn,
    /// Broadcast LIGHT_OFF.
    LightOff,
    /// Broadcast MOTOR_A or MOTOR_B.
    Motor {
        /// Forward selects MOTOR_A, anything else MOTOR_B.
        direction: Direction,
        /// PWM level.
        speed: u8,
    },
    /// Broadcast STOP.
    Stop,
    /// Report the connected-device bitmap.
    ListDevices,
    /// Start an enumeration round.
    EnableEnumeration,
    /// Stop inviting devices.
    CancelEnumeration,
    /// Report the last fault.
    LastFault,
    /// Report a device's identity bytes.
    Identity {
        /// Device id.
        id: u8,
    },
    /// Send a raw packet; uid 255 broadcasts it.
    Relay(Packet),
}

/// Argument digits a command opcode takes, `None` for unknown opcodes.
const fn arg_digits(opcode: u8) -> Option<usize> {
    match opcode {
        b'1' | b'0' | b's' | b'g' | b'c' | b'r' | b'l' => Some(0),
        b'i' => Some(2),
        b'm' => Some(3),
        b'p' => Some(8),
        _ => None,
    }
}

fn hex_value(byte: u8) -> Option<u8> {
    (byte as char).to_digit(16).map(|d| d as u8)
}

/// Incremental host command parser.
///
/// Feed it one byte at a time. A bad byte aborts the command in progress
/// and the parser waits for a fresh opcode.
#[derive(Clone, Debug, Default)]
pub struct HostParser {
    opcode: Option<u8>,
    digits: Vec<u8, 8>,
}

impl HostParser {
    /// Creates an idle parser.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a command is partially received.
    pub fn in_progress(&self) -> bool {
        self.opcode.is_some()
    }

    /// Drop a partially received command.
    pub fn reset(&mut self) {
        self.opcode = None;
        self.digits.clear();
    }

    /// Consume one byte. Returns a result once a command is complete or
    /// malformed.
    pub fn feed(&mut self, byte: u8) -> Option<Result<HostCommand, HostError>> {
        if byte.is_ascii_whitespace() {
            return None;
        }

        let Some(opcode) = self.opcode else {
            return match arg_digits(byte) {
                Some(0) => Some(Ok(Self::build(byte, &[]))),
                Some(_) => {
                    self.opcode = Some(byte);
                    None
                }
                None => Some(Err(HostError::UnknownOpcode(byte))),
            };
        };

        let Some(nibble) = hex_value(byte) else {
            self.reset();
            return Some(Err(HostError::InvalidHex(byte)));
        };
        // capacity covers the longest argument list
        let _ = self.digits.push(nibble);
        if Some(self.digits.len()) != arg_digits(opcode) {
            return None;
        }

        let command = Self::build(opcode, &self.digits);
        self.reset();
        match command {
            HostCommand::Relay(packet) if packet.validate().is_err() => {
                Some(Err(HostError::Checksum))
            }
            command => Some(Ok(command)),
        }
    }

    fn build(opcode: u8, d: &[u8]) -> HostCommand {
        let byte = |i: usize| d[i] << 4 | d[i + 1];
        match opcode {
            b'1' => HostCommand::LightOn,
            b'0' => HostCommand::LightOff,
            b's' => HostCommand::Stop,
            b'g' => HostCommand::ListDevices,
            b'c' => HostCommand::EnableEnumeration,
            b'r' => HostCommand::CancelEnumeration,
            b'i' => HostCommand::Identity { id: byte(0) },
            b'm' => HostCommand::Motor {
                direction: Direction::from_digit(d[0]),
                speed: d[1] << 4 | d[2],
            },
            b'p' => HostCommand::Relay(Packet {
                uid: byte(0),
                cmd: byte(2),
                arg: byte(4),
                checksum: byte(6),
            }),
            // b'l', the only opcode left
            _ => HostCommand::LastFault,
        }
    }
}

// ============================================================================
// Replies
// ============================================================================

/// Successful reply to a host command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HostReply {
    /// Light broadcast queued.
    On,
    /// Light-off broadcast queued.
    Off,
    /// Motor broadcast queued.
    Motor,
    /// Stop broadcast queued.
    Stopped,
    /// Connected bitmap, word k bit b = id 32k+b+1.
    Devices([u32; BITMAP_WORDS]),
    /// Enumeration enabled.
    Con,
    /// Enumeration cancelled.
    Res,
    /// Packed fault record, 0 when none.
    LastFault(u32),
    /// Identity bytes.
    Identity([u8; 3]),
    /// Relayed packet queued.
    Queued,
}

impl fmt::Display for HostReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::On => f.write_str("on"),
            Self::Off => f.write_str("off"),
            Self::Motor => f.write_str("motor"),
            Self::Stopped => f.write_str("stopped"),
            Self::Devices(words) => {
                for (i, word) in words.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{word:08X}")?;
                }
                Ok(())
            }
            Self::Con => f.write_str("con"),
            Self::Res => f.write_str("res"),
            Self::LastFault(code) => write!(f, "{code:08X}"),
            Self::Identity([a, b, c]) => write!(f, "{a:02X}{b:02X}{c:02X}"),
            Self::Queued => f.write_str("ok"),
        }
    }
}

impl HostError {
    /// Reply line sent to the host for this error.
    pub const fn reply(&self) -> &'static str {
        match self {
            Self::UnknownOpcode(_) => "?",
            Self::InvalidHex(_) => "err",
            Self::Checksum => "retry",
            Self::NoDevice(_) => "nodev",
            Self::Busy => "busy",
        }
    }
}

/// Unsolicited message pushed to the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HostNotice {
    /// A contact line saw a new id.
    Contact(ScanReport),
    /// A device joined the bus.
    Connected(u8),
    /// A device left the bus.
    Disconnected(u8),
}

impl fmt::Display for HostNotice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Contact(r) => write!(f, "t{:02X}{:02X}", r.line, r.id),
            Self::Connected(id) => write!(f, "+{id:02X}"),
            Self::Disconnected(id) => write!(f, "-{id:02X}"),
        }
    }
}

// ============================================================================
// Link
// ============================================================================

struct LineWriter<'a, H>(&'a mut H);

impl<H: HostChannel> fmt::Write for LineWriter<'_, H> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.0.write_all(s.as_bytes());
        Ok(())
    }
}

/// A host channel with its command parser.
#[derive(Debug)]
pub struct HostLink<H> {
    channel: H,
    parser: HostParser,
}

impl<H: HostChannel> HostLink<H> {
    /// Wrap a channel.
    pub fn new(channel: H) -> Self {
        Self {
            channel,
            parser: HostParser::new(),
        }
    }

    /// Underlying channel.
    pub fn channel(&self) -> &H {
        &self.channel
    }

    /// Mutable underlying channel.
    pub fn channel_mut(&mut self) -> &mut H {
        &mut self.channel
    }

    /// Unwrap the channel.
    pub fn into_inner(self) -> H {
        self.channel
    }

    /// Read buffered bytes until one command completes or the channel runs
    /// dry.
    pub fn poll(&mut self) -> Option<Result<HostCommand, HostError>> {
        while let Some(byte) = self.channel.read_byte() {
            if let Some(result) = self.parser.feed(byte) {
                return Some(result);
            }
        }
        None
    }

    /// Write the reply line for a command result.
    pub fn respond(&mut self, result: &Result<HostReply, HostError>) {
        let mut out = LineWriter(&mut self.channel);
        let _ = match result {
            Ok(reply) => writeln!(out, "{reply}"),
            Err(e) => writeln!(out, "{}", e.reply()),
        };
    }

    /// Write a notice line.
    pub fn notify(&mut self, notice: &HostNotice) {
        let _ = writeln!(LineWriter(&mut self.channel), "{notice}");
    }
}
