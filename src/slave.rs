//! TWPC slave engine.
//!
//! Runs on every train and station. The slave listens on the power line,
//! transmits on the data line, and drives its outputs through an
//! [`Actuator`].
//!
//! # States
//!
//! | State | Behaviour |
//! |-------|-----------|
//! | `Unassigned` | Counts consecutive active power samples; a run no frame can produce is the invitation |
//! | `RespondPending` | Has an id, answers the identity queries of its handshake |
//! | `Serving` | Executes commands for its id or broadcast, replies only to its id |
//! | `StandingBy` | Another device is being enumerated; waits for a closing marker |
//!
//! Every reply is `{own id, data, END}`. Frames with a bad checksum are
//! dropped without a reply, which the master sees as a sync fault.

use tracing::{debug, info, warn};

use crate::codec::{TransferEvent, Transceiver};
use crate::config::{BusConfig, DeviceConfig};
use crate::packet::{
    DeviceType, Opcode, Packet, PacketFormat, CLOSED, MAX_DEVICE_ID, STAND_BY,
};
use crate::scan::ContactResponder;
use crate::traits::{Actuator, Direction, Line, LineInterface, Output, Phase};

/// Slave lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum SlaveState {
    /// No id yet.
    Unassigned,
    /// Id adopted, identity handshake running.
    RespondPending,
    /// Normal operation.
    Serving,
    /// Enumeration of another device in progress.
    StandingBy,
}

/// Notable slave-side changes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlaveEvent {
    /// The slave adopted `id` from an id frame.
    Assigned {
        /// New bus id.
        id: u8,
    },
    /// A command was executed.
    Executed {
        /// Command byte.
        command: u8,
        /// Argument byte.
        arg: u8,
    },
    /// The slave went to stand-by for an enumeration round.
    StandingBy,
    /// A closing marker returned the slave to service.
    Resumed,
    /// The slave dropped its id after a DISCONNECT.
    Released,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Invitation {
    Counting(u16),
    Asserting,
    Releasing,
    AwaitingId,
}

/// The bus slave.
#[derive(Debug)]
pub struct SlaveEngine<A> {
    format: PacketFormat,
    identity_len: u8,
    device_type: DeviceType,
    identity: [u8; 3],
    id: u8,
    state: SlaveState,
    invitation: Invitation,
    xcvr: Transceiver,
    leaving: bool,
    actuator: A,
    responder: Option<ContactResponder>,
}

impl<A: Actuator> SlaveEngine<A> {
    /// Create a slave for the bus described by `bus`.
    ///
    /// A device with a static id starts serving immediately.
    pub fn new(bus: &BusConfig, device: &DeviceConfig, actuator: A) -> Self {
        let mut slave = Self {
            format: bus.format(),
            identity_len: bus.identity_len.min(3),
            device_type: device.device_type,
            identity: device.identity,
            id: 0,
            state: SlaveState::Unassigned,
            invitation: Invitation::Counting(0),
            xcvr: Transceiver::new(),
            leaving: false,
            actuator,
            responder: device.contact_responder.then(ContactResponder::new),
        };
        if let Some(id) = device.static_id.filter(|id| (1..=MAX_DEVICE_ID).contains(id)) {
            slave.id = id;
            slave.state = SlaveState::Serving;
            slave.listen();
        }
        slave
    }

    /// Bus id, 0 while unassigned.
    #[inline]
    pub fn id(&self) -> u8 {
        self.id
    }

    /// Current state.
    #[inline]
    pub fn state(&self) -> SlaveState {
        self.state
    }

    /// Output driver.
    #[inline]
    pub fn actuator(&self) -> &A {
        &self.actuator
    }

    /// Mutable output driver.
    #[inline]
    pub fn actuator_mut(&mut self) -> &mut A {
        &mut self.actuator
    }

    fn listen(&mut self) {
        self.xcvr.arm_receive(self.format.bits(), None);
    }

    /// Advance the slave by one tick.
    pub fn tick<L: LineInterface + ?Sized>(
        &mut self,
        phase: Phase,
        lines: &mut L,
    ) -> Option<SlaveEvent> {
        if let Some(responder) = self.responder.as_mut() {
            responder.tick(phase, lines, Line::Contact(0), self.id);
        }

        if self.state == SlaveState::Unassigned {
            return self.tick_unassigned(phase, lines);
        }

        if self.xcvr.is_idle() {
            self.listen();
        }
        match self.xcvr.tick(phase, lines, Line::Data, Line::Power)? {
            TransferEvent::Received(raw) => self.on_frame(raw),
            TransferEvent::Sent => self.on_sent(),
            TransferEvent::SyncFault => None,
        }
    }

    fn tick_unassigned<L: LineInterface + ?Sized>(
        &mut self,
        phase: Phase,
        lines: &mut L,
    ) -> Option<SlaveEvent> {
        match (self.invitation, phase) {
            (Invitation::Counting(run), Phase::Sample) => {
                let run = if lines.sample(Line::Power) { run + 1 } else { 0 };
                self.invitation = if run >= self.format.invitation_run() {
                    Invitation::Asserting
                } else {
                    Invitation::Counting(run)
                };
                None
            }
            (Invitation::Asserting, Phase::Drive) => {
                lines.drive(Line::Data, true);
                self.invitation = Invitation::Releasing;
                None
            }
            (Invitation::Releasing, Phase::Drive) => {
                lines.drive(Line::Data, false);
                self.invitation = Invitation::AwaitingId;
                self.listen();
                None
            }
            (Invitation::AwaitingId, _) => match self.xcvr.tick(phase, lines, Line::Data, Line::Power)? {
                TransferEvent::Received(raw) => self.adopt(raw),
                _ => None,
            },
            _ => None,
        }
    }

    /// Take the id from an id frame `{id, TYPE, 0}` and report the type.
    fn adopt(&mut self, raw: u32) -> Option<SlaveEvent> {
        let frame = Packet::from_raw(raw, self.format)
            .ok()
            .filter(|p| p.cmd == Opcode::Type as u8 && p.arg == 0)
            .filter(|p| (1..=MAX_DEVICE_ID).contains(&p.uid));
        let Some(frame) = frame else {
            debug!("expected an id frame, back to counting");
            self.invitation = Invitation::Counting(0);
            return None;
        };

        self.id = frame.uid;
        self.invitation = Invitation::Counting(0);
        self.state = if self.identity_len == 0 {
            SlaveState::Serving
        } else {
            SlaveState::RespondPending
        };
        info!(id = self.id, "adopted bus id");
        self.reply(self.device_type.code());
        Some(SlaveEvent::Assigned { id: self.id })
    }

    fn reply(&mut self, data: u8) {
        let packet = Packet::reply(self.id, data, Opcode::End as u8);
        self.xcvr
            .arm_send(packet.to_raw(self.format), self.format.bits());
    }

    fn on_sent(&mut self) -> Option<SlaveEvent> {
        if self.leaving {
            self.release();
            return Some(SlaveEvent::Released);
        }
        self.listen();
        None
    }

    fn release(&mut self) {
        info!(id = self.id, "leaving the bus");
        self.leaving = false;
        self.id = 0;
        self.state = SlaveState::Unassigned;
        self.invitation = Invitation::Counting(0);
        self.xcvr.reset();
    }

    fn on_frame(&mut self, raw: u32) -> Option<SlaveEvent> {
        let Ok(packet) = Packet::from_raw(raw, self.format) else {
            debug!(id = self.id, "dropping corrupted frame");
            self.listen();
            return None;
        };
        let addressed = packet.uid == self.id;
        if !addressed && !packet.is_broadcast() {
            self.listen();
            return None;
        }

        if self.state == SlaveState::StandingBy {
            self.listen();
            if packet.is_broadcast()
                && packet.opcode() == Some(Opcode::NewDevice)
                && packet.arg == CLOSED
            {
                self.state = SlaveState::Serving;
                return Some(SlaveEvent::Resumed);
            }
            return None;
        }

        let (data, event) = self.execute(&packet);
        if addressed {
            self.reply(data);
        } else if self.leaving {
            // broadcast DISCONNECT: nobody answers
            self.release();
            return Some(SlaveEvent::Released);
        } else {
            self.listen();
        }
        event
    }

    /// Run one command and produce the reply data byte.
    fn execute(&mut self, packet: &Packet) -> (u8, Option<SlaveEvent>) {
        const OK: u8 = Opcode::Ok as u8;
        const NOP: u8 = Opcode::Nop as u8;

        let Some(op) = packet.opcode() else {
            warn!(id = self.id, command = packet.cmd, "unknown command");
            return (Opcode::Error as u8, None);
        };
        let executed = Some(SlaveEvent::Executed {
            command: packet.cmd,
            arg: packet.arg,
        });

        let outcome = match op {
            Opcode::Nop => return (OK, None),
            Opcode::LightOn => self.actuator.set_output(Output::Light, 1),
            Opcode::LightOff => self.actuator.set_output(Output::Light, 0),
            Opcode::Stop => self.actuator.stop(),
            Opcode::MotorA => self.actuator.drive_motor(Direction::Forward, packet.arg),
            Opcode::MotorB => self.actuator.drive_motor(Direction::Reverse, packet.arg),
            Opcode::Type => return (self.device_type.code(), None),
            Opcode::Uid1 | Opcode::Uid2 | Opcode::Uid3 => {
                let index = op as u8 - Opcode::Uid1 as u8;
                if self.state == SlaveState::RespondPending && index + 1 >= self.identity_len {
                    self.state = SlaveState::Serving;
                }
                return (self.identity[index as usize], None);
            }
            Opcode::NewDevice => {
                if packet.arg == STAND_BY {
                    debug!(id = self.id, "standing by");
                    self.state = SlaveState::StandingBy;
                    return (OK, Some(SlaveEvent::StandingBy));
                }
                return (OK, None);
            }
            Opcode::Disconnect => {
                self.leaving = true;
                return (Opcode::Disconnect as u8, None);
            }
            Opcode::End | Opcode::Data | Opcode::Error | Opcode::Ok => return (NOP, None),
        };

        match outcome {
            Ok(()) => (OK, executed),
            Err(_) => {
                warn!(id = self.id, command = packet.cmd, "actuator rejected command");
                (Opcode::Error as u8, None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::{MockActuator, MockLines};

    fn bus() -> BusConfig {
        BusConfig::default()
    }

    fn serving(id: u8) -> SlaveEngine<MockActuator> {
        let device = DeviceConfig::default()
            .with_static_id(Some(id))
            .with_contact_responder(false);
        SlaveEngine::new(&bus(), &device, MockActuator::new())
    }

    /// Drive a frame onto the power line the way the master would.
    fn send_frame(
        slave: &mut SlaveEngine<MockActuator>,
        lines: &mut MockLines,
        packet: Packet,
    ) -> std::vec::Vec<SlaveEvent> {
        let mut master = Transceiver::new();
        master.arm_send(packet.to_raw(PacketFormat::CHECKSUMMED), 32);
        let mut events = std::vec::Vec::new();
        let mut phase = Phase::Drive;
        while !master.is_idle() {
            master.tick(phase, lines, Line::Power, Line::Data);
            events.extend(slave.tick(phase, lines));
            phase = phase.next();
        }
        events
    }

    /// Collect the slave's reply from the data line.
    fn read_reply(slave: &mut SlaveEngine<MockActuator>, lines: &mut MockLines) -> Option<Packet> {
        let mut master = Transceiver::new();
        master.arm_receive(32, Some(8));
        let mut phase = Phase::Sample;
        for _ in 0..200 {
            let event = master.tick(phase, lines, Line::Power, Line::Data);
            slave.tick(phase, lines);
            match event {
                Some(TransferEvent::Received(raw)) => {
                    return Packet::from_raw(raw, PacketFormat::CHECKSUMMED).ok()
                }
                Some(TransferEvent::SyncFault) => return None,
                _ => {}
            }
            phase = phase.next();
        }
        None
    }

    #[test]
    fn static_id_starts_serving() {
        let slave = serving(3);
        assert_eq!(slave.state(), SlaveState::Serving);
        assert_eq!(slave.id(), 3);

        let unassigned = SlaveEngine::new(&bus(), &DeviceConfig::default(), MockActuator::new());
        assert_eq!(unassigned.state(), SlaveState::Unassigned);
        assert_eq!(unassigned.id(), 0);
    }

    #[test]
    fn light_on_sets_output_and_acks() {
        let mut slave = serving(3);
        let mut lines = MockLines::new();
        let events = send_frame(&mut slave, &mut lines, Packet::command(3, Opcode::LightOn, 0));
        assert!(events.contains(&SlaveEvent::Executed {
            command: Opcode::LightOn as u8,
            arg: 0
        }));
        assert!(slave.actuator().light);

        let reply = read_reply(&mut slave, &mut lines).unwrap();
        assert_eq!(reply, Packet::reply(3, Opcode::Ok as u8, Opcode::End as u8));
    }

    #[test]
    fn motor_commands_drive_the_bridge() {
        let mut slave = serving(2);
        let mut lines = MockLines::new();
        send_frame(&mut slave, &mut lines, Packet::command(2, Opcode::MotorB, 0x60));
        read_reply(&mut slave, &mut lines);
        assert_eq!(slave.actuator().direction(), Direction::Reverse);
        assert_eq!(slave.actuator().motor_reverse, 0x60);

        send_frame(&mut slave, &mut lines, Packet::command(2, Opcode::Stop, 0));
        read_reply(&mut slave, &mut lines);
        assert_eq!(slave.actuator().direction(), Direction::Stopped);
    }

    #[test]
    fn broadcast_executes_without_reply() {
        let mut slave = serving(4);
        let mut lines = MockLines::new();
        send_frame(&mut slave, &mut lines, Packet::command(255, Opcode::LightOn, 0));
        assert!(slave.actuator().light);
        assert_eq!(read_reply(&mut slave, &mut lines), None);
    }

    #[test]
    fn other_ids_are_ignored() {
        let mut slave = serving(4);
        let mut lines = MockLines::new();
        let events = send_frame(&mut slave, &mut lines, Packet::command(5, Opcode::LightOn, 0));
        assert!(events.is_empty());
        assert!(!slave.actuator().light);
        assert_eq!(read_reply(&mut slave, &mut lines), None);
    }

    #[test]
    fn unknown_command_replies_error() {
        let mut slave = serving(6);
        let mut lines = MockLines::new();
        send_frame(&mut slave, &mut lines, Packet::new(6, 0x7E, 0));
        let reply = read_reply(&mut slave, &mut lines).unwrap();
        assert_eq!(reply.cmd, Opcode::Error as u8);
        assert_eq!(reply.arg, Opcode::End as u8);
    }

    #[test]
    fn non_actionable_codes_reply_nop() {
        let mut slave = serving(6);
        let mut lines = MockLines::new();
        send_frame(&mut slave, &mut lines, Packet::command(6, Opcode::Data, 0));
        let reply = read_reply(&mut slave, &mut lines).unwrap();
        assert_eq!(reply.cmd, Opcode::Nop as u8);
    }

    #[test]
    fn identity_and_type_queries() {
        let mut slave = serving(1);
        let mut lines = MockLines::new();
        send_frame(&mut slave, &mut lines, Packet::command(1, Opcode::Type, 0));
        assert_eq!(read_reply(&mut slave, &mut lines).unwrap().cmd, 0xFF);
        send_frame(&mut slave, &mut lines, Packet::command(1, Opcode::Uid2, 0));
        assert_eq!(read_reply(&mut slave, &mut lines).unwrap().cmd, b'S');
    }

    #[test]
    fn stand_by_until_closing_marker() {
        let mut slave = serving(1);
        let mut lines = MockLines::new();
        let events = send_frame(
            &mut slave,
            &mut lines,
            Packet::command(255, Opcode::NewDevice, STAND_BY),
        );
        assert_eq!(events, [SlaveEvent::StandingBy]);
        assert_eq!(slave.state(), SlaveState::StandingBy);

        // traffic addressed to it is ignored while standing by
        send_frame(&mut slave, &mut lines, Packet::command(1, Opcode::LightOn, 0));
        assert!(!slave.actuator().light);

        let events = send_frame(
            &mut slave,
            &mut lines,
            Packet::command(255, Opcode::NewDevice, CLOSED),
        );
        assert_eq!(events, [SlaveEvent::Resumed]);
        assert_eq!(slave.state(), SlaveState::Serving);
    }

    #[test]
    fn disconnect_replies_then_releases_id() {
        let mut slave = serving(9);
        let mut lines = MockLines::new();
        send_frame(&mut slave, &mut lines, Packet::command(9, Opcode::Disconnect, 0));
        let reply = read_reply(&mut slave, &mut lines).unwrap();
        assert_eq!(reply.cmd, Opcode::Disconnect as u8);
        // one more drive tick completes the reply
        slave.tick(Phase::Drive, &mut lines);
        assert_eq!(slave.state(), SlaveState::Unassigned);
        assert_eq!(slave.id(), 0);
    }

    #[test]
    fn corrupted_frame_gets_no_reply() {
        let mut slave = serving(3);
        let mut lines = MockLines::new();
        let mut packet = Packet::command(3, Opcode::LightOn, 0);
        packet.checksum ^= 1;
        send_frame(&mut slave, &mut lines, packet);
        assert!(!slave.actuator().light);
        assert_eq!(read_reply(&mut slave, &mut lines), None);
    }

    #[test]
    fn long_power_run_triggers_presence_then_adopts_id() {
        let device = DeviceConfig::default().with_contact_responder(false);
        let mut slave = SlaveEngine::new(&bus(), &device, MockActuator::new());
        let mut lines = MockLines::new();

        lines.drive(Line::Power, true);
        let mut asserted_at = None;
        for cycle in 0..60 {
            slave.tick(Phase::Drive, &mut lines);
            if lines.level(Line::Data) && asserted_at.is_none() {
                asserted_at = Some(cycle);
            }
            slave.tick(Phase::Sample, &mut lines);
        }
        // the run must exceed anything a frame can produce
        assert_eq!(asserted_at, Some(34));
        assert!(!lines.level(Line::Data));

        let events = send_frame(&mut slave, &mut lines, Packet::command(7, Opcode::Type, 0));
        assert_eq!(events, [SlaveEvent::Assigned { id: 7 }]);
        assert_eq!(slave.state(), SlaveState::RespondPending);
        let reply = read_reply(&mut slave, &mut lines).unwrap();
        assert_eq!(reply, Packet::reply(7, 0xFF, Opcode::End as u8));

        for (query, byte) in [(Opcode::Uid1, b'A'), (Opcode::Uid2, b'S'), (Opcode::Uid3, b'D')] {
            send_frame(&mut slave, &mut lines, Packet::command(7, query, 0));
            assert_eq!(read_reply(&mut slave, &mut lines).unwrap().cmd, byte);
        }
        assert_eq!(slave.state(), SlaveState::Serving);
    }
}
