//! TWPC bit codec.
//!
//! A [`Transceiver`] moves one frame over a pair of lines, one bit per cycle.
//! It is a pure tick-driven state machine: the owner arms it with
//! [`arm_send`](Transceiver::arm_send) or
//! [`arm_receive`](Transceiver::arm_receive) and then calls
//! [`tick`](Transceiver::tick) once per scheduler tick until a
//! [`TransferEvent`] comes back.
//!
//! # Line timing
//!
//! ```text
//! cycle      | S0 | S1 | D0 | D1 | ... | Dn-1 | T  |
//! line       |  1 |  0 | b0 | b1 | ... | bn-1 | 0  |
//! ```
//!
//! - Transmitters set the level on the [`Drive`](Phase::Drive) tick of a
//!   cycle and hold it through the [`Sample`](Phase::Sample) tick.
//! - `S0 S1` is the start pair. A waiting receiver locks on the first active
//!   sample immediately followed by an inactive one, so any preceding active
//!   run (for example an invitation) simply stretches `S0`.
//! - `T` releases the line. The transmitter reports
//!   [`TransferEvent::Sent`] on that drive tick.
//! - Bits go least significant first: `value |= bit << i`.

use crate::traits::{Line, LineInterface, Phase};

/// Largest frame the codec can carry.
pub const MAX_FRAME_BITS: u8 = 32;

/// Completion of an armed transfer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferEvent {
    /// The last bit went out and the line is released.
    Sent,
    /// A full frame was received.
    Received(u32),
    /// No start pair was seen within the fault threshold.
    SyncFault,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Mode {
    Idle,
    Send {
        value: u32,
        width: u8,
        step: u8,
    },
    Receive {
        width: u8,
        threshold: Option<u16>,
        waited: u16,
        prev: Option<bool>,
        synced: bool,
        count: u8,
        value: u32,
    },
}

/// Half-duplex frame transceiver.
#[derive(Clone, Copy, Debug)]
pub struct Transceiver {
    mode: Mode,
}

impl Default for Transceiver {
    fn default() -> Self {
        Self::new()
    }
}

impl Transceiver {
    /// Create an idle transceiver.
    pub const fn new() -> Self {
        Self { mode: Mode::Idle }
    }

    /// True when nothing is armed.
    #[inline]
    pub const fn is_idle(&self) -> bool {
        matches!(self.mode, Mode::Idle)
    }

    /// Queue `value` for transmission. Starts on the next drive tick.
    ///
    /// Any transfer in progress is abandoned.
    pub fn arm_send(&mut self, value: u32, width: u8) {
        debug_assert!(width > 0 && width <= MAX_FRAME_BITS);
        self.mode = Mode::Send {
            value,
            width: width.min(MAX_FRAME_BITS),
            step: 0,
        };
    }

    /// Wait for a frame of `width` bits.
    ///
    /// With `threshold` set, more than that many sample ticks without a
    /// start pair produce [`TransferEvent::SyncFault`].
    pub fn arm_receive(&mut self, width: u8, threshold: Option<u16>) {
        debug_assert!(width > 0 && width <= MAX_FRAME_BITS);
        self.mode = Mode::Receive {
            width: width.min(MAX_FRAME_BITS),
            threshold,
            waited: 0,
            prev: None,
            synced: false,
            count: 0,
            value: 0,
        };
    }

    /// Drop whatever is armed without touching the lines.
    pub fn reset(&mut self) {
        self.mode = Mode::Idle;
    }

    /// Advance by one tick.
    ///
    /// `tx` is the line this side drives, `rx` the line it samples.
    pub fn tick<L: LineInterface + ?Sized>(
        &mut self,
        phase: Phase,
        lines: &mut L,
        tx: Line,
        rx: Line,
    ) -> Option<TransferEvent> {
        match (&mut self.mode, phase) {
            (Mode::Send { value, width, step }, Phase::Drive) => {
                let level = match *step {
                    0 => true,
                    1 => false,
                    s if s < *width + 2 => (*value >> (s - 2)) & 1 == 1,
                    _ => {
                        lines.drive(tx, false);
                        self.mode = Mode::Idle;
                        return Some(TransferEvent::Sent);
                    }
                };
                lines.drive(tx, level);
                *step += 1;
                None
            }
            (
                Mode::Receive {
                    width,
                    threshold,
                    waited,
                    prev,
                    synced,
                    count,
                    value,
                },
                Phase::Sample,
            ) => {
                let level = lines.sample(rx);
                if *synced {
                    if level {
                        *value |= 1u32 << *count;
                    }
                    *count += 1;
                    if *count == *width {
                        let frame = *value;
                        self.mode = Mode::Idle;
                        return Some(TransferEvent::Received(frame));
                    }
                    return None;
                }

                if *prev == Some(true) && !level {
                    *synced = true;
                    return None;
                }
                *prev = Some(level);
                *waited = waited.saturating_add(1);
                match *threshold {
                    Some(limit) if *waited > limit => {
                        self.mode = Mode::Idle;
                        Some(TransferEvent::SyncFault)
                    }
                    _ => None,
                }
            }
            _ => None,
        }
    }
}
