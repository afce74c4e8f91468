//! Hardware abstraction traits for bus lines and actuator outputs.
//!
//! This module defines the interfaces the protocol engines use to touch the
//! outside world. Every engine is written against these traits so the same
//! state machines run on a microcontroller, on the simulated bus in
//! [`crate::hal::sim`], or against the recording mocks in [`crate::hal::mock`].
//!
//! # Key Traits
//!
//! | Trait | Purpose |
//! |-------|---------|
//! | [`LineInterface`] | Drive and sample the power, data and contact lines |
//! | [`Actuator`] | Light and motor outputs on a slave device |
//!
//! # Example
//!
//! ```rust
//! use twpc_rail::traits::{Actuator, Direction, Output};
//! use twpc_rail::hal::MockActuator;
//!
//! let mut outputs = MockActuator::new();
//! outputs.drive_motor(Direction::Forward, 0x40).unwrap();
//! outputs.set_output(Output::Light, 1).unwrap();
//!
//! assert_eq!(outputs.direction(), Direction::Forward);
//! assert!(outputs.light);
//! ```

/// Physical line addressed by the engines.
///
/// The TWPC master transmits on [`Power`](Self::Power) and listens on
/// [`Data`](Self::Data); slaves do the opposite. Contact lines are numbered
/// from zero in scan order. On a slave, `Contact(0)` is the pickup that
/// touches whatever contact the train currently sits on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum Line {
    /// Power-modulation line driven by the master.
    Power,
    /// Shared data line asserted by slaves.
    Data,
    /// Contact-scan sensor line.
    Contact(u8),
}

/// Which half of a bit cycle a tick belongs to.
///
/// A cycle is one [`Drive`](Self::Drive) tick followed by one
/// [`Sample`](Self::Sample) tick. Transmitters only change line levels on
/// drive ticks and receivers only read on sample ticks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Phase {
    /// First tick of a cycle: transmitters set the line level.
    #[default]
    Drive,
    /// Second tick of a cycle: receivers sample the line.
    Sample,
}

impl Phase {
    /// The phase of the following tick.
    #[inline]
    pub const fn next(self) -> Self {
        match self {
            Phase::Drive => Phase::Sample,
            Phase::Sample => Phase::Drive,
        }
    }
}

/// Line access for the tick-driven engines.
///
/// `drive(line, true)` asserts the line, `drive(line, false)` releases it.
/// Lines are wired-OR: `sample` reports active when any participant on the
/// line is asserting it.
///
/// # Example Implementation
///
/// ```rust,ignore
/// use twpc_rail::traits::{Line, LineInterface};
///
/// struct Pins { /* gpio handles */ }
///
/// impl LineInterface for Pins {
///     fn drive(&mut self, line: Line, active: bool) {
///         // Inverted logic on the power transistor: active = 0V
///     }
///
///     fn sample(&mut self, line: Line) -> bool {
///         false
///     }
/// }
/// ```
pub trait LineInterface {
    /// Assert (`true`) or release (`false`) a line.
    fn drive(&mut self, line: Line, active: bool);

    /// Read the current level of a line.
    fn sample(&mut self, line: Line) -> bool;

    /// Called once at the end of every tick, after all engines ran.
    ///
    /// Real hardware has nothing to do here. The simulated bus uses it to let
    /// the slave devices on the other end of the wire react.
    fn settle(&mut self, _phase: Phase) {}
}

/// Direction of train travel.
///
/// Maps onto the two motor output channels of a slave: forward drives
/// [`Output::MotorForward`], reverse drives [`Output::MotorReverse`].
///
/// # Default
///
/// Defaults to [`Stopped`](Self::Stopped) for safety.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum Direction {
    /// Moving forward (MOTOR_A).
    Forward,
    /// Moving in reverse (MOTOR_B).
    Reverse,
    /// Both motor channels off.
    #[default]
    Stopped,
}

impl Direction {
    /// Direction selected by the host's motor direction digit.
    ///
    /// Zero selects forward, anything else reverse.
    #[inline]
    pub const fn from_digit(digit: u8) -> Self {
        if digit == 0 {
            Direction::Forward
        } else {
            Direction::Reverse
        }
    }
}

/// Output channel on a slave device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Output {
    /// Head light / signal LED. Any non-zero level is on.
    Light,
    /// Motor PWM for forward travel. 0 = off, 0xFF = full.
    MotorForward,
    /// Motor PWM for reverse travel. 0 = off, 0xFF = full.
    MotorReverse,
}

/// Actuator driver on a slave device.
///
/// The slave engine only ever calls [`set_output`](Self::set_output); the
/// provided methods describe how motor commands map onto the two PWM
/// channels of the H-bridge.
pub trait Actuator {
    /// Error type for output operations.
    type Error;

    /// Set an output channel to `level`.
    fn set_output(&mut self, channel: Output, level: u8) -> Result<(), Self::Error>;

    /// Drive the motor in `direction` at PWM `speed`.
    ///
    /// The opposite channel is switched off first so the bridge never
    /// drives both sides at once.
    fn drive_motor(&mut self, direction: Direction, speed: u8) -> Result<(), Self::Error> {
        match direction {
            Direction::Forward => {
                self.set_output(Output::MotorReverse, 0)?;
                self.set_output(Output::MotorForward, speed)
            }
            Direction::Reverse => {
                self.set_output(Output::MotorForward, 0)?;
                self.set_output(Output::MotorReverse, speed)
            }
            Direction::Stopped => self.stop(),
        }
    }

    /// Switch both motor channels off.
    fn stop(&mut self) -> Result<(), Self::Error> {
        self.set_output(Output::MotorForward, 0)?;
        self.set_output(Output::MotorReverse, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        calls: heapless::Vec<(Output, u8), 8>,
    }

    impl Actuator for Recorder {
        type Error = ();

        fn set_output(&mut self, channel: Output, level: u8) -> Result<(), ()> {
            self.calls.push((channel, level)).map_err(|_| ())
        }
    }

    #[test]
    fn phase_alternates() {
        assert_eq!(Phase::Drive.next(), Phase::Sample);
        assert_eq!(Phase::Sample.next(), Phase::Drive);
    }

    #[test]
    fn forward_releases_reverse_channel_first() {
        let mut r = Recorder::default();
        r.drive_motor(Direction::Forward, 40).unwrap();
        assert_eq!(
            r.calls.as_slice(),
            &[(Output::MotorReverse, 0), (Output::MotorForward, 40)]
        );
    }

    #[test]
    fn stopped_direction_switches_both_off() {
        let mut r = Recorder::default();
        r.drive_motor(Direction::Stopped, 200).unwrap();
        assert_eq!(
            r.calls.as_slice(),
            &[(Output::MotorForward, 0), (Output::MotorReverse, 0)]
        );
    }

    #[test]
    fn direction_digit() {
        assert_eq!(Direction::from_digit(0), Direction::Forward);
        assert_eq!(Direction::from_digit(1), Direction::Reverse);
        assert_eq!(Direction::from_digit(0xF), Direction::Reverse);
    }
}
