//! Device table owned by the master.
//!
//! Ids `1..=254` map to one [`DeviceEntry`] each. An entry is created when
//! enumeration assigns an id (or when an id is pre-seeded from
//! configuration) and deleted when the device leaves or faults. Id 0 and the
//! broadcast id are never stored.
//!
//! ```rust
//! use twpc_rail::device_table::{DeviceTable, HandshakeStage};
//!
//! let mut table = DeviceTable::new();
//! assert_eq!(table.allocate(), Some(1));
//! assert_eq!(table.allocate(), Some(2));
//! table.remove(1);
//! assert_eq!(table.allocate(), Some(1));
//!
//! assert_eq!(table.get(2).map(|e| e.stage), Some(HandshakeStage::ExpectType));
//! assert_eq!(table.next_connected(2), Some(1));
//! ```

use crate::error::HostError;
use crate::packet::{DeviceType, Opcode, MAX_DEVICE_ID};

/// Number of 32-bit words in the connected-device bitmap.
pub const BITMAP_WORDS: usize = 8;

/// What is known about the device behind an id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum DeviceKind {
    /// Slot is free.
    #[default]
    Disconnected,
    /// Locomotive.
    Train,
    /// Trackside station.
    Station,
    /// Connected, type not reported yet.
    Unspecified,
}

impl From<DeviceType> for DeviceKind {
    fn from(t: DeviceType) -> Self {
        match t {
            DeviceType::Train => DeviceKind::Train,
            DeviceType::Station => DeviceKind::Station,
        }
    }
}

/// Which reply the master expects from a device next.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum HandshakeStage {
    /// TRAIN or STATION type code.
    #[default]
    ExpectType,
    /// Identity byte `n` (0..3).
    ExpectIdentity(u8),
    /// OK.
    ExpectAck,
    /// Any reply; DISCONNECT removes the device, ERROR faults it.
    ExpectAny,
}

impl HandshakeStage {
    /// Stage to use when polling a ready device with `cmd`.
    pub const fn for_command(cmd: u8) -> Self {
        match Opcode::from_u8(cmd) {
            Some(op) if op.is_actuation() => HandshakeStage::ExpectAck,
            _ => HandshakeStage::ExpectAny,
        }
    }

    /// True once the handshake is over.
    #[inline]
    pub const fn is_ready(self) -> bool {
        matches!(self, HandshakeStage::ExpectAck | HandshakeStage::ExpectAny)
    }
}

/// One slot of the device table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceEntry {
    /// Bus id.
    pub id: u8,
    /// Device kind.
    pub kind: DeviceKind,
    /// Identity bytes collected during the handshake.
    pub identity: [u8; 3],
    /// Command to send on the next poll, NOP when `None`.
    pub pending_command: Option<u8>,
    /// Argument for `pending_command`.
    pub pending_arg: u8,
    /// Reply expected for the command in flight.
    pub stage: HandshakeStage,
}

impl DeviceEntry {
    const EMPTY: Self = Self {
        id: 0,
        kind: DeviceKind::Disconnected,
        identity: [0; 3],
        pending_command: None,
        pending_arg: 0,
        stage: HandshakeStage::ExpectType,
    };

    /// True while the slot holds a device.
    #[inline]
    pub const fn is_connected(&self) -> bool {
        !matches!(self.kind, DeviceKind::Disconnected)
    }

    /// True when the device accepts host commands.
    #[inline]
    pub const fn is_ready(&self) -> bool {
        self.is_connected() && self.stage.is_ready()
    }
}

/// Fixed table of all assignable ids.
#[derive(Clone, Debug)]
pub struct DeviceTable {
    // index 0 is id 1
    entries: [DeviceEntry; MAX_DEVICE_ID as usize],
    len: usize,
}

impl Default for DeviceTable {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceTable {
    /// Empty table.
    pub const fn new() -> Self {
        Self {
            entries: [DeviceEntry::EMPTY; MAX_DEVICE_ID as usize],
            len: 0,
        }
    }

    fn slot(id: u8) -> Option<usize> {
        match id {
            1..=MAX_DEVICE_ID => Some(id as usize - 1),
            _ => None,
        }
    }

    /// Number of connected devices.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when no device is connected.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// True when every id is taken.
    #[inline]
    pub fn is_full(&self) -> bool {
        self.len == MAX_DEVICE_ID as usize
    }

    /// Connected entry for `id`.
    pub fn get(&self, id: u8) -> Option<&DeviceEntry> {
        Self::slot(id)
            .map(|i| &self.entries[i])
            .filter(|e| e.is_connected())
    }

    /// Mutable connected entry for `id`.
    pub fn get_mut(&mut self, id: u8) -> Option<&mut DeviceEntry> {
        let entry = &mut self.entries[Self::slot(id)?];
        if entry.is_connected() {
            Some(entry)
        } else {
            None
        }
    }

    /// True when `id` is connected.
    pub fn contains(&self, id: u8) -> bool {
        self.get(id).is_some()
    }

    /// Lowest id not currently in use.
    pub fn lowest_free_id(&self) -> Option<u8> {
        (1..=MAX_DEVICE_ID).find(|&id| !self.contains(id))
    }

    /// Create an entry for the lowest free id, awaiting its type.
    pub fn allocate(&mut self) -> Option<u8> {
        let id = self.lowest_free_id()?;
        self.insert(id, None);
        Some(id)
    }

    /// Pre-seed `id` as a device whose type is queried on its first poll.
    ///
    /// Returns `false` when `id` is not assignable or already present.
    pub fn seed(&mut self, id: u8) -> bool {
        if Self::slot(id).is_none() || self.contains(id) {
            return false;
        }
        self.insert(id, Some(Opcode::Type as u8));
        true
    }

    fn insert(&mut self, id: u8, pending: Option<u8>) {
        if let Some(i) = Self::slot(id) {
            self.entries[i] = DeviceEntry {
                id,
                kind: DeviceKind::Unspecified,
                pending_command: pending,
                ..DeviceEntry::EMPTY
            };
            self.len += 1;
        }
    }

    /// Delete the entry for `id`. Returns `true` if it was connected.
    pub fn remove(&mut self, id: u8) -> bool {
        match Self::slot(id) {
            Some(i) if self.entries[i].is_connected() => {
                self.entries[i] = DeviceEntry::EMPTY;
                self.len -= 1;
                true
            }
            _ => false,
        }
    }

    /// Next connected id after `after`, wrapping 254 to 1.
    ///
    /// `after` itself is returned last, so a lone device polls itself
    /// every round.
    pub fn next_connected(&self, after: u8) -> Option<u8> {
        let start = after.min(MAX_DEVICE_ID);
        (1..=MAX_DEVICE_ID)
            .map(|step| ((start as u16 + step as u16 - 1) % MAX_DEVICE_ID as u16) as u8 + 1)
            .find(|&id| self.contains(id))
    }

    /// Iterate connected entries in id order.
    pub fn iter(&self) -> impl Iterator<Item = &DeviceEntry> {
        self.entries.iter().filter(|e| e.is_connected())
    }

    /// Connected ids in ascending order.
    pub fn ids(&self) -> impl Iterator<Item = u8> + '_ {
        self.iter().map(|e| e.id)
    }

    /// Connected-device bitmap: word `k` bit `b` is id `32k + b + 1`.
    pub fn bitmap(&self) -> [u32; BITMAP_WORDS] {
        let mut words = [0u32; BITMAP_WORDS];
        for id in self.ids() {
            let bit = id as usize - 1;
            words[bit / 32] |= 1u32 << (bit % 32);
        }
        words
    }

    /// Queue `cmd` for the next poll of a ready device.
    ///
    /// A command already waiting is replaced.
    pub fn queue_command(&mut self, id: u8, cmd: u8, arg: u8) -> Result<(), HostError> {
        match self.get_mut(id) {
            Some(entry) if entry.stage.is_ready() => {
                entry.pending_command = Some(cmd);
                entry.pending_arg = arg;
                Ok(())
            }
            _ => Err(HostError::NoDevice(id)),
        }
    }
}
