//! TWPC packet layout, opcodes and checksum.
//!
//! Every bus transfer carries one [`Packet`]. On the wire it is a
//! little-endian record sent least-significant bit first:
//!
//! | Bits  | Field      |
//! |-------|------------|
//! | 0-7   | `uid`      |
//! | 8-15  | `cmd`      |
//! | 16-23 | `arg`      |
//! | 24-31 | `checksum` (omitted when the checksum is disabled) |
//!
//! Replies from a slave reuse the same layout: `cmd` carries the reply data
//! byte and `arg` the end-of-turn marker.
//!
//! # Checksum
//!
//! CRC-8 with polynomial `0x07` over `uid`, `cmd`, `arg`. The 32-bit
//! codeword has a Hamming distance of 4, so every single, double and triple
//! bit corruption is detected. There are no single-bit collision cases.
//!
//! ```rust
//! use twpc_rail::packet::{Opcode, Packet, PacketFormat};
//!
//! let packet = Packet::new(3, Opcode::LightOn as u8, 0);
//! let raw = packet.to_raw(PacketFormat::CHECKSUMMED);
//! assert_eq!(Packet::from_raw(raw, PacketFormat::CHECKSUMMED), Ok(packet));
//!
//! // A flipped bit is caught.
//! assert!(Packet::from_raw(raw ^ 0x100, PacketFormat::CHECKSUMMED).is_err());
//! ```

use crate::error::PacketError;

/// Broadcast address. Broadcast packets never solicit a reply.
pub const BROADCAST_ID: u8 = 255;

/// Highest assignable device id. Id 0 is never assigned.
pub const MAX_DEVICE_ID: u8 = 254;

/// `arg` of a NEW_DEVICE broadcast that sends serving slaves to stand by.
pub const STAND_BY: u8 = 0x00;

/// `arg` of a NEW_DEVICE broadcast that closes an enumeration round.
pub const CLOSED: u8 = 0xFF;

/// Number of closing markers emitted at the end of an enumeration round.
pub const CLOSING_MARKERS: u8 = 3;

/// Command and reply codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
#[repr(u8)]
pub enum Opcode {
    /// Nothing to do; the device replies OK.
    Nop = 0x01,
    /// End of turn, carried as the reply end marker.
    End = 0x02,
    /// More data follows.
    Data = 0x03,
    /// Command not understood.
    Error = 0x04,
    /// Command executed.
    Ok = 0x05,
    /// Enumeration round announcement (`arg` = [`STAND_BY`] or [`CLOSED`]).
    NewDevice = 0x06,
    /// Device leaves the bus.
    Disconnect = 0x07,
    /// Light on.
    LightOn = 0x08,
    /// Light off.
    LightOff = 0x09,
    /// Motor off.
    Stop = 0x0A,
    /// Motor forward, speed in `arg`.
    MotorA = 0x0B,
    /// Motor reverse, speed in `arg`.
    MotorB = 0x0C,
    /// First identity byte.
    Uid1 = 0x0D,
    /// Second identity byte.
    Uid2 = 0x0E,
    /// Third identity byte.
    Uid3 = 0x0F,
    /// Device type query.
    Type = 0x10,
}

impl Opcode {
    /// Decode a raw command byte.
    pub const fn from_u8(byte: u8) -> Option<Self> {
        Some(match byte {
            0x01 => Opcode::Nop,
            0x02 => Opcode::End,
            0x03 => Opcode::Data,
            0x04 => Opcode::Error,
            0x05 => Opcode::Ok,
            0x06 => Opcode::NewDevice,
            0x07 => Opcode::Disconnect,
            0x08 => Opcode::LightOn,
            0x09 => Opcode::LightOff,
            0x0A => Opcode::Stop,
            0x0B => Opcode::MotorA,
            0x0C => Opcode::MotorB,
            0x0D => Opcode::Uid1,
            0x0E => Opcode::Uid2,
            0x0F => Opcode::Uid3,
            0x10 => Opcode::Type,
            _ => return None,
        })
    }

    /// Identity request for byte `index` (0..3).
    pub const fn identity_request(index: u8) -> Option<Self> {
        match index {
            0 => Some(Opcode::Uid1),
            1 => Some(Opcode::Uid2),
            2 => Some(Opcode::Uid3),
            _ => None,
        }
    }

    /// Commands a serving device executes and acknowledges with OK.
    pub const fn is_actuation(self) -> bool {
        matches!(
            self,
            Opcode::Nop
                | Opcode::LightOn
                | Opcode::LightOff
                | Opcode::Stop
                | Opcode::MotorA
                | Opcode::MotorB
        )
    }
}

impl From<Opcode> for u8 {
    fn from(op: Opcode) -> u8 {
        op as u8
    }
}

/// Device type reported during enumeration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
#[repr(u8)]
pub enum DeviceType {
    /// Trackside station.
    Station = 0xFE,
    /// Locomotive.
    Train = 0xFF,
}

impl DeviceType {
    /// Decode a type reply byte.
    pub const fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0xFE => Some(DeviceType::Station),
            0xFF => Some(DeviceType::Train),
            _ => None,
        }
    }

    /// Type code sent on the bus.
    #[inline]
    pub const fn code(self) -> u8 {
        self as u8
    }
}

/// Frame layout in use on a bus.
///
/// Master and slaves must agree on the format.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PacketFormat {
    /// Whether the checksum byte is transmitted and validated.
    pub checksum: bool,
}

impl PacketFormat {
    /// Four byte frames with checksum.
    pub const CHECKSUMMED: Self = Self { checksum: true };
    /// Three byte frames without checksum.
    pub const PLAIN: Self = Self { checksum: false };

    /// Number of data bits in one frame.
    #[inline]
    pub const fn bits(self) -> u8 {
        if self.checksum {
            32
        } else {
            24
        }
    }

    /// Consecutive active power samples that can only be an invitation.
    ///
    /// The longest active run inside a frame is its data field, so a run
    /// longer than the frame plus its start pair never appears in normal
    /// traffic.
    #[inline]
    pub const fn invitation_run(self) -> u16 {
        self.bits() as u16 + 2
    }
}

impl Default for PacketFormat {
    fn default() -> Self {
        Self::CHECKSUMMED
    }
}

/// One TWPC packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Packet {
    /// Destination (or, for replies, source) device id.
    pub uid: u8,
    /// Command or reply data byte.
    pub cmd: u8,
    /// Argument or reply end marker.
    pub arg: u8,
    /// CRC-8 over `uid`, `cmd`, `arg`.
    pub checksum: u8,
}

impl Packet {
    /// Build a packet with a freshly computed checksum.
    pub const fn new(uid: u8, cmd: u8, arg: u8) -> Self {
        Self {
            uid,
            cmd,
            arg,
            checksum: checksum(uid, cmd, arg),
        }
    }

    /// Build a command packet.
    pub const fn command(uid: u8, op: Opcode, arg: u8) -> Self {
        Self::new(uid, op as u8, arg)
    }

    /// Build a slave reply: `data` followed by the `end` marker.
    pub const fn reply(uid: u8, data: u8, end: u8) -> Self {
        Self::new(uid, data, end)
    }

    /// True for packets addressed to every device.
    #[inline]
    pub const fn is_broadcast(&self) -> bool {
        self.uid == BROADCAST_ID
    }

    /// Decoded command, if `cmd` is a known opcode.
    #[inline]
    pub const fn opcode(&self) -> Option<Opcode> {
        Opcode::from_u8(self.cmd)
    }

    /// Check the carried checksum against a recomputation.
    pub const fn validate(&self) -> Result<(), PacketError> {
        let expected = checksum(self.uid, self.cmd, self.arg);
        if expected == self.checksum {
            Ok(())
        } else {
            Err(PacketError::Checksum {
                expected,
                found: self.checksum,
            })
        }
    }

    /// Frame value as transmitted, bit 0 first.
    pub const fn to_raw(&self, format: PacketFormat) -> u32 {
        let body = self.uid as u32 | (self.cmd as u32) << 8 | (self.arg as u32) << 16;
        if format.checksum {
            body | (self.checksum as u32) << 24
        } else {
            body
        }
    }

    /// Rebuild a packet from a received frame value.
    ///
    /// With the checksum disabled the checksum field is recomputed locally
    /// and validation always succeeds.
    pub const fn from_raw(raw: u32, format: PacketFormat) -> Result<Self, PacketError> {
        let uid = raw as u8;
        let cmd = (raw >> 8) as u8;
        let arg = (raw >> 16) as u8;
        if !format.checksum {
            return Ok(Self::new(uid, cmd, arg));
        }
        let packet = Self {
            uid,
            cmd,
            arg,
            checksum: (raw >> 24) as u8,
        };
        match packet.validate() {
            Ok(()) => Ok(packet),
            Err(e) => Err(e),
        }
    }

    /// Wire bytes in transmission order.
    pub const fn to_bytes(&self) -> [u8; 4] {
        [self.uid, self.cmd, self.arg, self.checksum]
    }
}

/// CRC-8, polynomial 0x07, initial value 0, over the three packet fields.
pub const fn checksum(uid: u8, cmd: u8, arg: u8) -> u8 {
    let data = [uid, cmd, arg];
    let mut crc = 0u8;
    let mut i = 0;
    while i < data.len() {
        let mut current = data[i];
        let mut bit = 0;
        while bit < 8 {
            if ((crc >> 7) ^ (current >> 7)) != 0 {
                crc = (crc << 1) ^ 0x07;
            } else {
                crc <<= 1;
            }
            current <<= 1;
            bit += 1;
        }
        i += 1;
    }
    crc
}
