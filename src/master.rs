//! TWPC master engine.
//!
//! The master owns the [`DeviceTable`] and the bus. Every tick it either
//! advances the transfer in flight or decides what goes out next:
//!
//! ```text
//!                 announcement sent
//!   Polling ─────────────────────────────▶ AcceptingConnections
//!     ▲  │ poll sent                           │ data line asserted
//!     │  ▼                                     ▼ (id frame sent)
//!     └── AwaitingHandshakeReply ◀─────────────┘
//!          reply / fault
//! ```
//!
//! # Polling priority
//!
//! 1. Closing markers left over from an enumeration round
//! 2. Queued broadcasts (never answered)
//! 3. The enumeration announcement, while enumeration is enabled and an id
//!    is free (a full table holds the request until one is)
//! 4. The device under the cursor, with its pending command or NOP
//!
//! # Faults
//!
//! A sync timeout, bad checksum, foreign uid or unexpected reply code deletes
//! the device and records a [`FaultRecord`]. The master never retries. When
//! the last device is gone it re-enables enumeration and starts inviting new
//! devices.

use heapless::Deque;
use tracing::{debug, info, warn};

use crate::codec::{TransferEvent, Transceiver};
use crate::config::BusConfig;
use crate::device_table::{DeviceKind, DeviceTable, HandshakeStage};
use crate::error::{FaultKind, HostError};
use crate::packet::{
    DeviceType, Opcode, Packet, PacketFormat, BROADCAST_ID, CLOSED, CLOSING_MARKERS, STAND_BY,
};
use crate::traits::{Line, LineInterface, Phase};

/// Broadcasts the master can hold before the host is told `busy`.
pub const BROADCAST_QUEUE: usize = 8;

/// Top-level master state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum MasterState {
    /// Holding the invitation and watching the data line.
    AcceptingConnections,
    /// Waiting for one device's reply.
    AwaitingHandshakeReply,
    /// Choosing the next transfer.
    Polling,
}

/// Last fault seen on the bus.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FaultRecord {
    /// Fault class.
    pub kind: FaultKind,
    /// Reply data byte, 0 if nothing was received.
    pub data: u8,
    /// Reply end marker, 0 if nothing was received.
    pub end: u8,
    /// Device id, 0 for capacity faults.
    pub id: u8,
}

impl FaultRecord {
    /// Packed form reported to the host: `kind<<24 | data<<16 | end<<8 | id`.
    pub const fn code(&self) -> u32 {
        (self.kind.code() as u32) << 24
            | (self.data as u32) << 16
            | (self.end as u32) << 8
            | self.id as u32
    }
}

/// Something the outside world may want to know about.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "event", rename_all = "snake_case"))]
pub enum MasterEvent {
    /// A new device answered the invitation and was given `id`.
    Connected {
        /// Assigned id.
        id: u8,
    },
    /// A device finished its handshake.
    Identified {
        /// Device id.
        id: u8,
        /// Reported type.
        kind: DeviceKind,
        /// Identity bytes (zero when the identity length is 0).
        identity: [u8; 3],
    },
    /// A ready device answered a poll.
    Replied {
        /// Device id.
        id: u8,
        /// Command that was sent.
        command: u8,
        /// Reply data byte.
        data: u8,
    },
    /// A device left the table.
    Disconnected {
        /// Device id.
        id: u8,
        /// Fault that caused the removal, `None` when the device asked to go.
        fault: Option<FaultKind>,
    },
    /// A queued broadcast went out.
    BroadcastSent {
        /// Command byte.
        command: u8,
        /// Argument byte.
        arg: u8,
    },
    /// Devices were sent to stand by and the invitation is up.
    EnumerationOpened,
    /// The closing markers of an enumeration round went out.
    EnumerationClosed,
    /// Enumeration was withheld because every id is taken.
    CapacityExceeded,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Outgoing {
    Marker,
    Broadcast(Packet),
    Announcement,
    IdFrame(u8),
    Poll { id: u8, command: u8 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Awaiting {
    id: u8,
    command: u8,
    enumeration: bool,
}

/// The bus master.
#[derive(Debug)]
pub struct MasterEngine {
    format: PacketFormat,
    identity_len: u8,
    fault_threshold: Option<u16>,
    state: MasterState,
    table: DeviceTable,
    cursor: u8,
    xcvr: Transceiver,
    outgoing: Option<Outgoing>,
    awaiting: Option<Awaiting>,
    id_frame: Option<u8>,
    inviting: bool,
    broadcasts: Deque<Packet, BROADCAST_QUEUE>,
    closing_markers: u8,
    enumeration_enabled: bool,
    // enumeration requested while the table is full
    capacity_withheld: bool,
    last_fault: Option<FaultRecord>,
}

impl MasterEngine {
    /// Create a master for the bus described by `config`.
    ///
    /// Pre-seeded devices are polled for their type first and enumeration
    /// starts disabled. Without any, the master starts inviting devices.
    pub fn new(config: &BusConfig) -> Self {
        let mut table = DeviceTable::new();
        for &id in &config.initial_devices {
            table.seed(id);
        }
        let empty = table.is_empty();
        let cursor = table.next_connected(0).unwrap_or(0);

        Self {
            format: config.format(),
            identity_len: config.identity_len.min(3),
            fault_threshold: config.fault_threshold,
            state: if empty {
                MasterState::AcceptingConnections
            } else {
                MasterState::Polling
            },
            table,
            cursor,
            xcvr: Transceiver::new(),
            outgoing: None,
            awaiting: None,
            id_frame: None,
            inviting: false,
            broadcasts: Deque::new(),
            closing_markers: 0,
            enumeration_enabled: empty,
            capacity_withheld: false,
            last_fault: None,
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Current state.
    #[inline]
    pub fn state(&self) -> MasterState {
        self.state
    }

    /// Device table.
    #[inline]
    pub fn table(&self) -> &DeviceTable {
        &self.table
    }

    /// Id polled next (0 when the table is empty).
    #[inline]
    pub fn cursor(&self) -> u8 {
        self.cursor
    }

    /// Most recent fault.
    #[inline]
    pub fn last_fault(&self) -> Option<FaultRecord> {
        self.last_fault
    }

    /// Whether an enumeration round is pending or running.
    #[inline]
    pub fn enumeration_enabled(&self) -> bool {
        self.enumeration_enabled
    }

    /// Frame layout in use.
    #[inline]
    pub fn format(&self) -> PacketFormat {
        self.format
    }

    /// Broadcasts waiting to go out.
    #[inline]
    pub fn queued_broadcasts(&self) -> usize {
        self.broadcasts.len()
    }

    // ========================================================================
    // Host-facing controls
    // ========================================================================

    /// Open an enumeration round at the next polling decision.
    pub fn enable_enumeration(&mut self) {
        if !self.enumeration_enabled {
            info!("enumeration enabled");
        }
        self.enumeration_enabled = true;
    }

    /// Stop inviting new devices.
    ///
    /// If the invitation is up it is dropped and devices on stand-by are
    /// released with closing markers.
    pub fn cancel_enumeration(&mut self) {
        self.enumeration_enabled = false;
        self.capacity_withheld = false;
        if self.state == MasterState::AcceptingConnections && self.id_frame.is_none() {
            info!("enumeration cancelled");
            self.inviting = false;
            self.closing_markers = CLOSING_MARKERS;
            self.state = MasterState::Polling;
        }
    }

    /// Queue a broadcast. Broadcasts never solicit a reply.
    pub fn queue_broadcast(&mut self, command: u8, arg: u8) -> Result<(), HostError> {
        self.broadcasts
            .push_back(Packet::new(BROADCAST_ID, command, arg))
            .map_err(|_| HostError::Busy)
    }

    /// Queue a command for the next poll of a ready device.
    pub fn queue_command(&mut self, id: u8, command: u8, arg: u8) -> Result<(), HostError> {
        self.table.queue_command(id, command, arg)
    }

    // ========================================================================
    // Tick
    // ========================================================================

    /// Advance the master by one tick.
    pub fn tick<L: LineInterface + ?Sized>(
        &mut self,
        phase: Phase,
        lines: &mut L,
    ) -> Option<MasterEvent> {
        if self.xcvr.is_idle() {
            return match phase {
                Phase::Drive => {
                    let event = self.start_next(lines);
                    // step 0 of a freshly armed frame goes out this tick
                    self.xcvr.tick(phase, lines, Line::Power, Line::Data);
                    event
                }
                Phase::Sample => self.watch_invitation(lines),
            };
        }

        match self.xcvr.tick(phase, lines, Line::Power, Line::Data)? {
            TransferEvent::Sent => self.on_sent(),
            TransferEvent::Received(raw) => self.on_reply(raw),
            TransferEvent::SyncFault => match self.awaiting.take() {
                Some(awaiting) => self.finish_exchange(awaiting, None, FaultKind::Sync),
                None => None,
            },
        }
    }

    fn send(&mut self, packet: Packet, what: Outgoing) {
        // the start bit continues the invitation level
        self.inviting = false;
        self.outgoing = Some(what);
        self.xcvr
            .arm_send(packet.to_raw(self.format), self.format.bits());
    }

    fn start_next<L: LineInterface + ?Sized>(&mut self, lines: &mut L) -> Option<MasterEvent> {
        if let Some(id) = self.id_frame.take() {
            let frame = Packet::command(id, Opcode::Type, 0);
            self.send(frame, Outgoing::IdFrame(id));
            return None;
        }

        match self.state {
            MasterState::AcceptingConnections => {
                if self.closing_markers > 0 {
                    self.send_marker();
                } else {
                    lines.drive(Line::Power, true);
                    self.inviting = true;
                }
                None
            }
            MasterState::Polling => self.poll_next(),
            MasterState::AwaitingHandshakeReply => None,
        }
    }

    fn send_marker(&mut self) {
        self.closing_markers -= 1;
        let marker = Packet::command(BROADCAST_ID, Opcode::NewDevice, CLOSED);
        self.send(marker, Outgoing::Marker);
    }

    fn poll_next(&mut self) -> Option<MasterEvent> {
        if self.closing_markers > 0 {
            self.send_marker();
            return None;
        }

        if let Some(packet) = self.broadcasts.pop_front() {
            self.send(packet, Outgoing::Broadcast(packet));
            return None;
        }

        // a full table keeps the request pending until an entry is freed
        if self.enumeration_enabled {
            if !self.table.is_full() {
                self.capacity_withheld = false;
                let announcement = Packet::command(BROADCAST_ID, Opcode::NewDevice, STAND_BY);
                self.send(announcement, Outgoing::Announcement);
                return None;
            }
            if !self.capacity_withheld {
                self.capacity_withheld = true;
                self.record_fault(FaultKind::Capacity, 0, 0, 0);
                warn!("device table full, enumeration withheld");
                return Some(MasterEvent::CapacityExceeded);
            }
        }

        if !self.table.contains(self.cursor) {
            self.cursor = self.table.next_connected(self.cursor)?;
        }
        let id = self.cursor;
        let entry = self.table.get_mut(id)?;
        let (command, arg) = if entry.stage.is_ready() {
            let command = entry.pending_command.take().unwrap_or(Opcode::Nop as u8);
            let arg = core::mem::take(&mut entry.pending_arg);
            entry.stage = HandshakeStage::for_command(command);
            (command, arg)
        } else {
            let query = match entry.stage {
                HandshakeStage::ExpectIdentity(n) => Opcode::identity_request(n),
                _ => Some(Opcode::Type),
            };
            let command = entry
                .pending_command
                .or(query.map(u8::from))
                .unwrap_or(Opcode::Type as u8);
            (command, 0)
        };

        debug!(id, command, arg, "poll");
        self.send(Packet::new(id, command, arg), Outgoing::Poll { id, command });
        None
    }

    fn watch_invitation<L: LineInterface + ?Sized>(&mut self, lines: &mut L) -> Option<MasterEvent> {
        if self.state != MasterState::AcceptingConnections
            || !self.inviting
            || self.id_frame.is_some()
            || !lines.sample(Line::Data)
        {
            return None;
        }

        match self.table.allocate() {
            Some(id) => {
                info!(id, "new device answered the invitation");
                self.enumeration_enabled = false;
                self.id_frame = Some(id);
                self.cursor = id;
                self.state = MasterState::AwaitingHandshakeReply;
                Some(MasterEvent::Connected { id })
            }
            None => {
                self.capacity_withheld = true;
                self.record_fault(FaultKind::Capacity, 0, 0, 0);
                warn!("device table full, invitation dropped");
                self.inviting = false;
                self.closing_markers = CLOSING_MARKERS;
                self.state = MasterState::Polling;
                Some(MasterEvent::CapacityExceeded)
            }
        }
    }

    // ========================================================================
    // Transfer completion
    // ========================================================================

    fn on_sent(&mut self) -> Option<MasterEvent> {
        match self.outgoing.take()? {
            Outgoing::Marker => {
                if self.closing_markers == 0 {
                    debug!("enumeration round closed");
                    Some(MasterEvent::EnumerationClosed)
                } else {
                    None
                }
            }
            Outgoing::Broadcast(packet) => Some(MasterEvent::BroadcastSent {
                command: packet.cmd,
                arg: packet.arg,
            }),
            Outgoing::Announcement => {
                info!("enumeration opened");
                self.state = MasterState::AcceptingConnections;
                Some(MasterEvent::EnumerationOpened)
            }
            Outgoing::IdFrame(id) => {
                self.expect_reply(id, Opcode::Type as u8, true);
                None
            }
            Outgoing::Poll { id, command } => {
                self.expect_reply(id, command, false);
                None
            }
        }
    }

    fn expect_reply(&mut self, id: u8, command: u8, enumeration: bool) {
        self.awaiting = Some(Awaiting {
            id,
            command,
            enumeration,
        });
        self.state = MasterState::AwaitingHandshakeReply;
        self.xcvr
            .arm_receive(self.format.bits(), self.fault_threshold);
    }

    fn on_reply(&mut self, raw: u32) -> Option<MasterEvent> {
        let awaiting = self.awaiting.take()?;
        let data = (raw >> 8) as u8;
        let end = (raw >> 16) as u8;

        let packet = match Packet::from_raw(raw, self.format) {
            Ok(p) if p.uid == awaiting.id => p,
            Ok(p) => {
                debug!(expected = awaiting.id, found = p.uid, "reply from wrong uid");
                return self.finish_exchange(awaiting, Some((data, end)), FaultKind::Checksum);
            }
            Err(e) => {
                debug!(id = awaiting.id, error = %e, "malformed reply");
                return self.finish_exchange(awaiting, Some((data, end)), FaultKind::from(e));
            }
        };

        match self.apply_reply(awaiting, packet.cmd) {
            Ok(event) => {
                if awaiting.enumeration {
                    self.closing_markers = CLOSING_MARKERS;
                }
                self.advance(awaiting.id, packet.arg == Opcode::End as u8);
                event
            }
            Err(kind) => self.finish_exchange(awaiting, Some((packet.cmd, packet.arg)), kind),
        }
    }

    /// Update the entry for a well-formed reply.
    fn apply_reply(&mut self, awaiting: Awaiting, data: u8) -> Result<Option<MasterEvent>, FaultKind> {
        let id = awaiting.id;
        let identity_len = self.identity_len;
        let entry = self.table.get_mut(id).ok_or(FaultKind::Protocol)?;

        match entry.stage {
            HandshakeStage::ExpectType => {
                let device_type = DeviceType::from_u8(data).ok_or(FaultKind::Protocol)?;
                entry.kind = device_type.into();
                if identity_len == 0 {
                    entry.pending_command = None;
                    entry.stage = HandshakeStage::ExpectAck;
                    info!(id, kind = ?entry.kind, "device identified");
                    Ok(Some(MasterEvent::Identified {
                        id,
                        kind: entry.kind,
                        identity: entry.identity,
                    }))
                } else {
                    entry.pending_command = Some(Opcode::Uid1 as u8);
                    entry.stage = HandshakeStage::ExpectIdentity(0);
                    Ok(None)
                }
            }
            HandshakeStage::ExpectIdentity(n) => {
                if let Some(slot) = entry.identity.get_mut(n as usize) {
                    *slot = data;
                }
                match Opcode::identity_request(n + 1).filter(|_| n + 1 < identity_len) {
                    Some(next) => {
                        entry.pending_command = Some(next as u8);
                        entry.stage = HandshakeStage::ExpectIdentity(n + 1);
                        Ok(None)
                    }
                    None => {
                        entry.pending_command = None;
                        entry.stage = HandshakeStage::ExpectAck;
                        info!(id, kind = ?entry.kind, "device identified");
                        Ok(Some(MasterEvent::Identified {
                            id,
                            kind: entry.kind,
                            identity: entry.identity,
                        }))
                    }
                }
            }
            HandshakeStage::ExpectAck => {
                if data != Opcode::Ok as u8 {
                    Err(FaultKind::Protocol)
                } else if awaiting.command == Opcode::Nop as u8 {
                    Ok(None)
                } else {
                    Ok(Some(MasterEvent::Replied {
                        id,
                        command: awaiting.command,
                        data,
                    }))
                }
            }
            HandshakeStage::ExpectAny => match Opcode::from_u8(data) {
                Some(Opcode::Disconnect) => {
                    self.table.remove(id);
                    info!(id, "device disconnected");
                    Ok(Some(MasterEvent::Disconnected { id, fault: None }))
                }
                Some(Opcode::Error) => Err(FaultKind::Protocol),
                _ => Ok(Some(MasterEvent::Replied {
                    id,
                    command: awaiting.command,
                    data,
                })),
            },
        }
    }

    /// Delete a faulted device and move on.
    fn finish_exchange(
        &mut self,
        awaiting: Awaiting,
        reply: Option<(u8, u8)>,
        kind: FaultKind,
    ) -> Option<MasterEvent> {
        let id = awaiting.id;
        let (data, end) = reply.unwrap_or((0, 0));
        self.record_fault(kind, data, end, id);
        warn!(id, ?kind, data, end, "device fault, removing");
        if awaiting.enumeration {
            self.closing_markers = CLOSING_MARKERS;
        }
        self.table.remove(id);
        self.advance(id, true);
        Some(MasterEvent::Disconnected {
            id,
            fault: Some(kind),
        })
    }

    fn record_fault(&mut self, kind: FaultKind, data: u8, end: u8, id: u8) {
        self.last_fault = Some(FaultRecord {
            kind,
            data,
            end,
            id,
        });
    }

    /// Pick the next cursor position after an exchange with `id`.
    fn advance(&mut self, id: u8, end_of_turn: bool) {
        if self.table.is_empty() {
            self.cursor = 0;
            self.enumeration_enabled = true;
            self.state = MasterState::AcceptingConnections;
            return;
        }
        self.cursor = if end_of_turn || !self.table.contains(id) {
            self.table.next_connected(id).unwrap_or(0)
        } else {
            id
        };
        self.state = MasterState::Polling;
    }
}
