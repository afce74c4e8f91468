//! Mock implementations for testing without hardware.
//!
//! This module provides test doubles for the line, actuator and host
//! channel traits so the engines can be exercised on desktop. All mocks are
//! `heapless`-backed and work without `std`.
//!
//! # Available Mocks
//!
//! | Mock | Trait | Purpose |
//! |------|-------|---------|
//! | [`MockLines`] | [`LineInterface`] | Line levels with externally forced inputs |
//! | [`MockActuator`] | [`Actuator`] | Tracks light and motor outputs |
//! | [`MockHostChannel`] | [`HostChannel`] | Queued input bytes, captured replies |
//!
//! # Example
//!
//! ```rust
//! use twpc_rail::hal::MockLines;
//! use twpc_rail::traits::{Line, LineInterface};
//!
//! let mut lines = MockLines::new();
//! lines.drive(Line::Power, true);
//! assert!(lines.sample(Line::Power));
//!
//! // A level forced from outside is OR'd with what the engine drives
//! lines.set(Line::Data, true);
//! lines.drive(Line::Data, false);
//! assert!(lines.sample(Line::Data));
//! ```
//!
//! [`LineInterface`]: crate::traits::LineInterface
//! [`Actuator`]: crate::traits::Actuator
//! [`HostChannel`]: crate::traits::HostChannel

use heapless::{Deque, Vec};

use crate::scan::MAX_CONTACT_LINES;
use crate::traits::{Actuator, Direction, HostChannel, Line, LineInterface, Output};

// ============================================================================
// Line Mock
// ============================================================================

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct Levels {
    power: bool,
    data: bool,
    contacts: [bool; MAX_CONTACT_LINES],
}

impl Levels {
    fn get(&self, line: Line) -> bool {
        match line {
            Line::Power => self.power,
            Line::Data => self.data,
            Line::Contact(n) => self.contacts.get(n as usize).copied().unwrap_or(false),
        }
    }

    fn set(&mut self, line: Line, level: bool) {
        match line {
            Line::Power => self.power = level,
            Line::Data => self.data = level,
            Line::Contact(n) => {
                if let Some(c) = self.contacts.get_mut(n as usize) {
                    *c = level;
                }
            }
        }
    }
}

/// Mock line interface.
///
/// Everything driven through [`LineInterface::drive`] shares one set of
/// levels, so several engines may run against the same mock. Levels set
/// with [`set`](Self::set) stand for another participant holding the line.
#[derive(Clone, Debug, Default)]
pub struct MockLines {
    driven: Levels,
    external: Levels,
    /// Number of `drive` calls.
    pub drive_count: usize,
    /// Number of `settle` calls.
    pub settle_count: usize,
}

impl MockLines {
    /// Creates a mock with every line released.
    pub fn new() -> Self {
        Self::default()
    }

    /// Force an external level onto `line`.
    pub fn set(&mut self, line: Line, level: bool) {
        self.external.set(line, level);
    }

    /// Current level of `line` as a receiver would see it.
    pub fn level(&self, line: Line) -> bool {
        self.driven.get(line) || self.external.get(line)
    }
}

impl LineInterface for MockLines {
    fn drive(&mut self, line: Line, active: bool) {
        self.driven.set(line, active);
        self.drive_count += 1;
    }

    fn sample(&mut self, line: Line) -> bool {
        self.level(line)
    }

    fn settle(&mut self, _phase: crate::traits::Phase) {
        self.settle_count += 1;
    }
}

// ============================================================================
// Actuator Mock
// ============================================================================

/// Mock actuator for testing.
///
/// Records the level of every output channel. Use the public fields to
/// inspect state after test operations.
///
/// # Example
///
/// ```rust
/// use twpc_rail::hal::MockActuator;
/// use twpc_rail::traits::{Actuator, Direction};
///
/// let mut outputs = MockActuator::new();
/// outputs.drive_motor(Direction::Reverse, 0x80).unwrap();
///
/// assert_eq!(outputs.motor_reverse, 0x80);
/// assert_eq!(outputs.motor_forward, 0);
/// assert_eq!(outputs.direction(), Direction::Reverse);
/// assert_eq!(outputs.call_count, 2); // forward released first
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MockActuator {
    /// Light output.
    pub light: bool,
    /// Forward motor PWM level.
    pub motor_forward: u8,
    /// Reverse motor PWM level.
    pub motor_reverse: u8,
    /// Number of `set_output` calls.
    pub call_count: usize,
    /// When set, every call fails.
    pub fail: bool,
}

impl MockActuator {
    /// Creates a mock with every output off.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a mock whose outputs always fail.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// Direction implied by the motor channels.
    pub fn direction(&self) -> Direction {
        if self.motor_forward > 0 {
            Direction::Forward
        } else if self.motor_reverse > 0 {
            Direction::Reverse
        } else {
            Direction::Stopped
        }
    }

    /// Speed on whichever motor channel is active.
    pub fn speed(&self) -> u8 {
        self.motor_forward.max(self.motor_reverse)
    }
}

impl Actuator for MockActuator {
    type Error = ();

    fn set_output(&mut self, channel: Output, level: u8) -> Result<(), ()> {
        if self.fail {
            return Err(());
        }
        match channel {
            Output::Light => self.light = level != 0,
            Output::MotorForward => self.motor_forward = level,
            Output::MotorReverse => self.motor_reverse = level,
        }
        self.call_count += 1;
        Ok(())
    }
}

// ============================================================================
// Host Channel Mock
// ============================================================================

/// Capacity of the mock's receive queue.
pub const MOCK_RX_CAPACITY: usize = 256;

/// Capacity of the mock's captured output.
pub const MOCK_TX_CAPACITY: usize = 1024;

/// Mock host channel.
///
/// Queue host input with [`feed`](Self::feed) and read back what the
/// station wrote with [`output`](Self::output) or
/// [`lines`](Self::lines).
///
/// # Example
///
/// ```rust
/// use twpc_rail::hal::MockHostChannel;
/// use twpc_rail::traits::HostChannel;
///
/// let mut host = MockHostChannel::new();
/// host.feed(b"g");
/// assert_eq!(host.read_byte(), Some(b'g'));
/// assert_eq!(host.read_byte(), None);
///
/// host.write_all(b"on\n");
/// assert_eq!(host.output(), "on\n");
/// ```
#[derive(Debug, Default)]
pub struct MockHostChannel {
    rx: Deque<u8, MOCK_RX_CAPACITY>,
    tx: Vec<u8, MOCK_TX_CAPACITY>,
}

impl MockHostChannel {
    /// Creates an empty channel.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue bytes as if the host had sent them. Excess bytes are dropped.
    pub fn feed(&mut self, bytes: &[u8]) {
        for &b in bytes {
            if self.rx.push_back(b).is_err() {
                break;
            }
        }
    }

    /// Bytes still waiting to be read.
    pub fn pending(&self) -> usize {
        self.rx.len()
    }

    /// Everything written so far, as text.
    pub fn output(&self) -> &str {
        core::str::from_utf8(&self.tx).unwrap_or("")
    }

    /// Complete reply lines written so far, without their newlines.
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        let out = self.output();
        let complete = out.rfind('\n').map(|i| &out[..i]).unwrap_or("");
        complete.split('\n').filter(|l| !l.is_empty())
    }

    /// Drop everything written so far.
    pub fn clear_output(&mut self) {
        self.tx.clear();
    }
}

impl HostChannel for MockHostChannel {
    fn read_byte(&mut self) -> Option<u8> {
        self.rx.pop_front()
    }

    fn write_byte(&mut self, byte: u8) {
        let _ = self.tx.push(byte);
    }
}
