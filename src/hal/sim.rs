//! Simulated TWPC layout.
//!
//! [`SimBus`] is the master's [`LineInterface`] for a layout that exists
//! only in memory. It owns any number of slave engines with
//! [`MockActuator`] outputs and ticks them from
//! [`settle`](LineInterface::settle), so one [`Station::tick`] moves both
//! ends of the wire.
//!
//! Every line is wired-OR: the master's level and every attached slave's
//! level are combined. Trains can be placed on a contact line, where their
//! contact responder answers the scanner.
//!
//! ```rust
//! use twpc_rail::config::{Config, DeviceConfig};
//! use twpc_rail::hal::SimBus;
//! use twpc_rail::Station;
//!
//! let config = Config::default();
//! let mut bus = SimBus::new(&config.bus);
//! bus.attach(&DeviceConfig::default());
//!
//! let mut station = Station::new(&config, bus);
//! let ready = station.run_until(2000, |s| {
//!     s.master().table().get(1).is_some_and(|e| e.is_ready())
//! });
//!
//! assert!(ready);
//! assert_eq!(station.lines().slave(0).map(|s| s.id()), Some(1));
//! ```
//!
//! [`Station::tick`]: crate::Station::tick

use crate::config::{BusConfig, DeviceConfig};
use crate::hal::MockActuator;
use crate::scan::MAX_CONTACT_LINES;
use crate::slave::{SlaveEngine, SlaveEvent};
use crate::traits::{Line, LineInterface, Phase};

/// A slave on the simulated layout.
pub type SimSlave = SlaveEngine<MockActuator>;

#[derive(Clone, Copy, Debug, Default)]
struct Port {
    plugged: bool,
    contact: Option<u8>,
    data: bool,
    contact_level: bool,
}

/// In-memory layout: the master's lines plus every attached slave.
#[derive(Debug)]
pub struct SimBus {
    bus: BusConfig,
    power: bool,
    data: bool,
    scanner: [bool; MAX_CONTACT_LINES],
    slaves: Vec<SimSlave>,
    ports: Vec<Port>,
    events: Vec<(usize, SlaveEvent)>,
}

impl SimBus {
    /// Empty layout for slaves that share `bus`.
    pub fn new(bus: &BusConfig) -> Self {
        Self {
            bus: bus.clone(),
            power: false,
            data: false,
            scanner: [false; MAX_CONTACT_LINES],
            slaves: Vec::new(),
            ports: Vec::new(),
            events: Vec::new(),
        }
    }

    /// Plug in a new slave. Returns its index.
    pub fn attach(&mut self, device: &DeviceConfig) -> usize {
        self.slaves
            .push(SlaveEngine::new(&self.bus, device, MockActuator::new()));
        self.ports.push(Port {
            plugged: true,
            ..Port::default()
        });
        self.slaves.len() - 1
    }

    /// Pull a slave off the bus. It stops ticking and releases its lines.
    pub fn unplug(&mut self, index: usize) {
        if let Some(port) = self.ports.get_mut(index) {
            *port = Port::default();
        }
    }

    /// Put a slave on contact `line`, or lift it off with `None`.
    pub fn place(&mut self, index: usize, line: Option<u8>) {
        if let Some(port) = self.ports.get_mut(index) {
            port.contact = line;
            port.contact_level = false;
        }
    }

    /// Slave at `index`.
    pub fn slave(&self, index: usize) -> Option<&SimSlave> {
        self.slaves.get(index)
    }

    /// Mutable slave at `index`.
    pub fn slave_mut(&mut self, index: usize) -> Option<&mut SimSlave> {
        self.slaves.get_mut(index)
    }

    /// Every slave ever attached, in attach order.
    pub fn slaves(&self) -> impl Iterator<Item = &SimSlave> {
        self.slaves.iter()
    }

    /// Index of the plugged slave using bus id `id`.
    pub fn find(&self, id: u8) -> Option<usize> {
        self.slaves
            .iter()
            .zip(&self.ports)
            .position(|(s, p)| p.plugged && id != 0 && s.id() == id)
    }

    /// Slave events since the last call, tagged with the slave index.
    pub fn take_events(&mut self) -> Vec<(usize, SlaveEvent)> {
        core::mem::take(&mut self.events)
    }

    fn contact_level(&self, line: u8) -> bool {
        self.scanner.get(line as usize).copied().unwrap_or(false)
            || contact_from_ports(&self.ports, line)
    }
}

fn contact_from_ports(ports: &[Port], line: u8) -> bool {
    ports
        .iter()
        .any(|p| p.plugged && p.contact == Some(line) && p.contact_level)
}

impl LineInterface for SimBus {
    fn drive(&mut self, line: Line, active: bool) {
        match line {
            Line::Power => self.power = active,
            Line::Data => self.data = active,
            Line::Contact(n) => {
                if let Some(level) = self.scanner.get_mut(n as usize) {
                    *level = active;
                }
            }
        }
    }

    fn sample(&mut self, line: Line) -> bool {
        match line {
            Line::Power => self.power,
            Line::Data => self.data || self.ports.iter().any(|p| p.plugged && p.data),
            Line::Contact(n) => self.contact_level(n),
        }
    }

    fn settle(&mut self, phase: Phase) {
        for index in 0..self.slaves.len() {
            if !self.ports[index].plugged {
                continue;
            }
            let mut port = SlavePort {
                power: self.power,
                master_data: self.data,
                scanner: &self.scanner,
                ports: &mut self.ports,
                index,
            };
            if let Some(event) = self.slaves[index].tick(phase, &mut port) {
                self.events.push((index, event));
            }
        }
    }
}

/// One slave's view of the layout.
struct SlavePort<'a> {
    power: bool,
    master_data: bool,
    scanner: &'a [bool; MAX_CONTACT_LINES],
    ports: &'a mut [Port],
    index: usize,
}

impl LineInterface for SlavePort<'_> {
    fn drive(&mut self, line: Line, active: bool) {
        let port = &mut self.ports[self.index];
        match line {
            Line::Data => port.data = active,
            Line::Contact(0) => port.contact_level = active && port.contact.is_some(),
            // slaves never drive power or foreign contacts
            _ => {}
        }
    }

    fn sample(&mut self, line: Line) -> bool {
        match line {
            Line::Power => self.power,
            Line::Data => self.master_data || self.ports.iter().any(|p| p.plugged && p.data),
            Line::Contact(0) => match self.ports[self.index].contact {
                Some(c) => {
                    self.scanner.get(c as usize).copied().unwrap_or(false)
                        || contact_from_ports(self.ports, c)
                }
                None => false,
            },
            Line::Contact(_) => false,
        }
    }
}
