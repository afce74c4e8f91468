//! The master station.
//!
//! [`Station`] ties the bus master, the contact scanner and the host
//! protocol to one set of lines. It is the only thing the tick source
//! calls:
//!
//! ```text
//!   tick ──▶ master ──▶ scanner ──▶ lines.settle(phase)
//!              │           │
//!              │           └──▶ scan rule ──▶ queued device command
//!              └──▶ StationEvent / host notice
//! ```
//!
//! Host commands never touch the lines directly. They queue broadcasts or
//! per-device commands that the master picks up at its next polling
//! decision.
//!
//! # Example
//!
//! ```rust
//! use twpc_rail::commands::{HostCommand, HostReply};
//! use twpc_rail::config::Config;
//! use twpc_rail::hal::MockLines;
//! use twpc_rail::Station;
//!
//! let mut station = Station::new(&Config::default(), MockLines::new());
//! station.run_cycles(10);
//!
//! assert_eq!(station.execute(HostCommand::LightOn), Ok(HostReply::On));
//! assert_eq!(station.master().queued_broadcasts(), 1);
//! ```

use heapless::{Deque, Vec};
use tracing::{debug, info};

use crate::commands::{HostCommand, HostLink, HostNotice, HostReply};
use crate::config::{Config, HostConfig, ScanConfig};
use crate::error::HostError;
use crate::master::{MasterEngine, MasterEvent};
use crate::packet::Opcode;
use crate::scan::{ContactScanner, ScanReport};
use crate::traits::{Direction, HostChannel, LineInterface, Phase};

/// Notices held for the host between two [`Station::service_host`] calls.
pub const NOTICE_QUEUE: usize = 32;

/// What happened during one tick.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum StationEvent {
    /// Bus master event.
    Bus(MasterEvent),
    /// Contact scanner report.
    Contact(ScanReport),
}

/// Master station: bus master, contact scanner and host dispatcher.
#[derive(Debug)]
pub struct Station<L> {
    master: MasterEngine,
    scanner: Option<ContactScanner>,
    scan: ScanConfig,
    host: HostConfig,
    lines: L,
    phase: Phase,
    ticks: u64,
    notices: Deque<HostNotice, NOTICE_QUEUE>,
}

impl<L: LineInterface> Station<L> {
    /// Build a station from a validated configuration.
    pub fn new(config: &Config, lines: L) -> Self {
        let scanner = (config.scan.enabled && config.scan.lines > 0)
            .then(|| ContactScanner::new(config.scan.lines));
        info!(
            checksum = config.bus.checksum,
            identity_len = config.bus.identity_len,
            scan_lines = config.scan.lines,
            "station starting"
        );
        Self {
            master: MasterEngine::new(&config.bus),
            scanner,
            scan: config.scan.clone(),
            host: config.host.clone(),
            lines,
            phase: Phase::Drive,
            ticks: 0,
            notices: Deque::new(),
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Bus master.
    pub fn master(&self) -> &MasterEngine {
        &self.master
    }

    /// Contact scanner, if scanning is enabled.
    pub fn scanner(&self) -> Option<&ContactScanner> {
        self.scanner.as_ref()
    }

    /// Line interface.
    pub fn lines(&self) -> &L {
        &self.lines
    }

    /// Mutable line interface.
    pub fn lines_mut(&mut self) -> &mut L {
        &mut self.lines
    }

    /// Phase of the next tick.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Ticks run so far.
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Notices waiting for the host.
    pub fn pending_notices(&self) -> usize {
        self.notices.len()
    }

    // ========================================================================
    // Tick
    // ========================================================================

    /// Advance every state machine by one tick.
    pub fn tick(&mut self) -> Vec<StationEvent, 2> {
        let phase = self.phase;
        let mut events = Vec::new();

        if let Some(event) = self.master.tick(phase, &mut self.lines) {
            self.note_bus(&event);
            let _ = events.push(StationEvent::Bus(event));
        }

        let report = self
            .scanner
            .as_mut()
            .and_then(|scanner| scanner.tick(phase, &mut self.lines));
        if let Some(report) = report {
            self.dispatch(report);
            let _ = events.push(StationEvent::Contact(report));
        }

        self.lines.settle(phase);
        self.phase = phase.next();
        self.ticks += 1;
        events
    }

    /// Run `cycles` full drive/sample cycles, discarding events.
    pub fn run_cycles(&mut self, cycles: usize) {
        for _ in 0..cycles * 2 {
            self.tick();
        }
    }

    /// Run until `done` holds or `max_cycles` elapse. Returns whether
    /// `done` was reached.
    pub fn run_until(&mut self, max_cycles: usize, mut done: impl FnMut(&Self) -> bool) -> bool {
        for _ in 0..max_cycles * 2 {
            if done(self) {
                return true;
            }
            self.tick();
        }
        done(self)
    }

    fn note_bus(&mut self, event: &MasterEvent) {
        if !self.host.forward_connections {
            return;
        }
        let notice = match *event {
            MasterEvent::Identified { id, .. } => HostNotice::Connected(id),
            MasterEvent::Disconnected { id, .. } => HostNotice::Disconnected(id),
            _ => return,
        };
        self.push_notice(notice);
    }

    /// Apply the scan rule for a contact report.
    fn dispatch(&mut self, report: ScanReport) {
        if self.host.forward_reports {
            self.push_notice(HostNotice::Contact(report));
        }
        let Some(rule) = self.scan.rule_for(report.line) else {
            debug!(line = report.line, id = report.id, "no rule for contact");
            return;
        };
        match self
            .master
            .queue_command(report.id, rule.command as u8, rule.arg)
        {
            Ok(()) => debug!(
                line = report.line,
                id = report.id,
                command = rule.command as u8,
                "contact rule queued"
            ),
            Err(e) => debug!(line = report.line, id = report.id, error = %e, "contact dropped"),
        }
    }

    fn push_notice(&mut self, notice: HostNotice) {
        if self.notices.is_full() {
            self.notices.pop_front();
        }
        let _ = self.notices.push_back(notice);
    }

    // ========================================================================
    // Host commands
    // ========================================================================

    /// Carry out one host command.
    pub fn execute(&mut self, command: HostCommand) -> Result<HostReply, HostError> {
        debug!(?command, "host command");
        match command {
            HostCommand::LightOn => self.broadcast(Opcode::LightOn, 0, HostReply::On),
            HostCommand::LightOff => self.broadcast(Opcode::LightOff, 0, HostReply::Off),
            HostCommand::Stop => self.broadcast(Opcode::Stop, 0, HostReply::Stopped),
            HostCommand::Motor { direction, speed } => {
                let op = match direction {
                    Direction::Forward => Opcode::MotorA,
                    _ => Opcode::MotorB,
                };
                self.broadcast(op, speed, HostReply::Motor)
            }
            HostCommand::ListDevices => Ok(HostReply::Devices(self.master.table().bitmap())),
            HostCommand::EnableEnumeration => {
                self.master.enable_enumeration();
                Ok(HostReply::Con)
            }
            HostCommand::CancelEnumeration => {
                self.master.cancel_enumeration();
                Ok(HostReply::Res)
            }
            HostCommand::LastFault => Ok(HostReply::LastFault(
                self.master.last_fault().map_or(0, |f| f.code()),
            )),
            HostCommand::Identity { id } => self
                .master
                .table()
                .get(id)
                .filter(|e| e.is_ready())
                .map(|e| HostReply::Identity(e.identity))
                .ok_or(HostError::NoDevice(id)),
            HostCommand::Relay(packet) => {
                if packet.is_broadcast() {
                    self.master.queue_broadcast(packet.cmd, packet.arg)?;
                } else {
                    self.master.queue_command(packet.uid, packet.cmd, packet.arg)?;
                }
                Ok(HostReply::Queued)
            }
        }
    }

    fn broadcast(&mut self, op: Opcode, arg: u8, reply: HostReply) -> Result<HostReply, HostError> {
        self.master.queue_broadcast(op as u8, arg)?;
        Ok(reply)
    }

    /// Flush pending notices to the host, then answer every complete
    /// command waiting on the channel.
    pub fn service_host<H: HostChannel>(&mut self, link: &mut HostLink<H>) {
        while let Some(notice) = self.notices.pop_front() {
            link.notify(&notice);
        }
        while let Some(result) = link.poll() {
            let reply = result.and_then(|command| self.execute(command));
            link.respond(&reply);
        }
    }

    /// Serializable view of the station.
    #[cfg(feature = "serde")]
    pub fn snapshot(&self) -> crate::messages::StationSnapshot {
        use crate::messages::{DeviceSnapshot, ScanSnapshot, StationSnapshot};

        StationSnapshot {
            state: self.master.state(),
            cursor: self.master.cursor(),
            enumeration_enabled: self.master.enumeration_enabled(),
            devices: self
                .master
                .table()
                .iter()
                .map(DeviceSnapshot::from)
                .collect(),
            last_fault: self.master.last_fault(),
            queued_broadcasts: self.master.queued_broadcasts(),
            scan: self.scanner.as_ref().map(|s| ScanSnapshot {
                stats: s.stats(),
                last_seen: (0..s.lines()).map(|line| s.last_seen(line)).collect(),
            }),
            ticks: self.ticks,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BusConfig, ScanRule};
    use crate::hal::{MockHostChannel, MockLines};
    use crate::traits::Line;

    fn config() -> Config {
        Config::default().with_bus(BusConfig::default().with_fault_threshold(Some(8)))
    }

    #[test]
    fn tick_alternates_phase_and_settles() {
        let mut station = Station::new(&config(), MockLines::new());
        assert_eq!(station.phase(), Phase::Drive);
        station.tick();
        assert_eq!(station.phase(), Phase::Sample);
        station.tick();
        assert_eq!(station.ticks(), 2);
        assert_eq!(station.lines().settle_count, 2);
    }

    #[test]
    fn broadcast_commands_queue_until_busy() {
        let mut station = Station::new(&config(), MockLines::new());
        for _ in 0..crate::master::BROADCAST_QUEUE {
            assert_eq!(
                station.execute(HostCommand::Motor {
                    direction: Direction::Reverse,
                    speed: 9
                }),
                Ok(HostReply::Motor)
            );
        }
        assert_eq!(station.execute(HostCommand::Stop), Err(HostError::Busy));
    }

    #[test]
    fn commands_for_unknown_devices_fail() {
        let mut station = Station::new(&config(), MockLines::new());
        assert_eq!(
            station.execute(HostCommand::Identity { id: 3 }),
            Err(HostError::NoDevice(3))
        );
        let packet = crate::packet::Packet::command(3, Opcode::LightOn, 0);
        assert_eq!(
            station.execute(HostCommand::Relay(packet)),
            Err(HostError::NoDevice(3))
        );
        let broadcast = crate::packet::Packet::command(255, Opcode::LightOn, 0);
        assert_eq!(station.execute(HostCommand::Relay(broadcast)), Ok(HostReply::Queued));
    }

    #[test]
    fn enumeration_toggles() {
        let mut station = Station::new(&config(), MockLines::new());
        station.run_cycles(3);
        assert_eq!(station.execute(HostCommand::CancelEnumeration), Ok(HostReply::Res));
        assert!(!station.master().enumeration_enabled());
        assert_eq!(station.execute(HostCommand::EnableEnumeration), Ok(HostReply::Con));
        assert!(station.master().enumeration_enabled());
        assert_eq!(station.execute(HostCommand::LastFault), Ok(HostReply::LastFault(0)));
    }

    /// Answer one scan cycle on line 0 with `id` from outside.
    fn answer_scan(station: &mut Station<MockLines>, id: u8) -> Option<ScanReport> {
        let mut bits = std::vec![true];
        bits.extend((0..8).map(|i| id >> i & 1 == 1));
        bits.push(true);

        let mut report = None;
        // pulse and release
        for _ in 0..2 {
            station.tick();
            station.tick();
        }
        for bit in bits {
            station.lines_mut().set(Line::Contact(0), bit);
            for _ in 0..2 {
                for event in station.tick() {
                    if let StationEvent::Contact(r) = event {
                        report = Some(r);
                    }
                }
            }
        }
        station.lines_mut().set(Line::Contact(0), false);
        report
    }

    #[test]
    fn contact_report_is_forwarded_when_device_not_ready() {
        let config = config()
            .with_bus(
                BusConfig::default()
                    .with_fault_threshold(Some(8))
                    .with_initial_device(10),
            )
            .with_scan(ScanConfig::default().with_lines(1).without_rules().with_rule(
                ScanRule::new(0, Opcode::MotorA).with_arg(0x40),
            ));
        let mut station = Station::new(&config, MockLines::new());
        // the seeded device is not ready yet
        assert!(station.master().table().get(10).is_some());

        let report = answer_scan(&mut station, 10);
        assert_eq!(report, Some(ScanReport { line: 0, id: 10 }));
        assert_eq!(station.scanner().unwrap().last_seen(0), 10);

        let mut host = HostLink::new(MockHostChannel::new());
        station.service_host(&mut host);
        assert_eq!(host.channel().lines().collect::<std::vec::Vec<_>>(), ["t000A"]);
    }

    #[test]
    fn host_link_round_trip() {
        let mut station = Station::new(&config(), MockLines::new());
        let mut host = HostLink::new(MockHostChannel::new());
        host.channel_mut().feed(b"1 g x i05");
        station.service_host(&mut host);
        let lines: std::vec::Vec<&str> = host.channel().lines().collect();
        assert_eq!(
            lines,
            [
                "on",
                "00000000,00000000,00000000,00000000,00000000,00000000,00000000,00000000",
                "?",
                "nodev",
            ]
        );
    }

    #[cfg(feature = "serde")]
    #[test]
    fn snapshot_reflects_master() {
        let station = Station::new(
            &config().with_bus(BusConfig::default().with_initial_device(2)),
            MockLines::new(),
        );
        let snapshot = station.snapshot();
        assert_eq!(snapshot.devices.len(), 1);
        assert_eq!(snapshot.devices[0].id, 2);
        assert!(!snapshot.devices[0].ready);
        assert_eq!(snapshot.scan.map(|s| s.last_seen.len()), Some(2));
    }
}
