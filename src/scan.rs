//! Contact-scan engine.
//!
//! Each track contact is a separate sensor line. A train standing on a
//! contact answers a short pulse with its bus id, in the style of 1-Wire:
//!
//! | Step | Scanner (drive tick) | Train (sample tick) |
//! |------|----------------------|---------------------|
//! | 0 | assert the line | sees the pulse |
//! | 1 | release | asserts presence |
//! | 2 | sample presence | drives bit 0 |
//! | 3-10 | sample bits 0-7 | drives bits 1-7, then the check bit |
//! | 11 | sample check bit | releases |
//!
//! The train always drives the check bit high, so a train that leaves the
//! contact mid-frame reads back low and the cycle is discarded. The
//! [`ContactScanner`] moves to
//! the next line after every cycle, whatever the outcome, and keeps one
//! last-seen id per line so a train sitting on a contact is reported once.
//!
//! ```rust
//! use twpc_rail::scan::{ContactResponder, ContactScanner};
//! use twpc_rail::hal::MockLines;
//! use twpc_rail::traits::{Line, Phase};
//!
//! let mut scanner = ContactScanner::new(1);
//! let mut train = ContactResponder::new();
//! let mut lines = MockLines::new();
//!
//! let mut reports = Vec::new();
//! for _ in 0..40 {
//!     for phase in [Phase::Drive, Phase::Sample] {
//!         reports.extend(scanner.tick(phase, &mut lines));
//!         train.tick(phase, &mut lines, Line::Contact(0), 0x0A);
//!     }
//! }
//! // three full scans, one report
//! assert_eq!(reports.len(), 1);
//! assert_eq!(reports[0].id, 0x0A);
//! ```

use tracing::{debug, trace};

use crate::traits::{Line, LineInterface, Phase};

/// Maximum number of contact lines one scanner handles.
pub const MAX_CONTACT_LINES: usize = 16;

/// Bit cycles in one scan of one line.
pub const SCAN_STEPS: u8 = 12;

/// A new id seen on a contact line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ScanReport {
    /// Contact line index.
    pub line: u8,
    /// Reported bus id.
    pub id: u8,
}

/// Scanner counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ScanStats {
    /// Completed scan cycles.
    pub cycles: u32,
    /// Cycles without a presence answer.
    pub empty: u32,
    /// Cycles discarded on a low check bit.
    pub check_errors: u32,
    /// Valid ids equal to the cached one.
    pub duplicates: u32,
    /// Reports produced.
    pub reports: u32,
}

/// Round-robin contact scanner.
#[derive(Clone, Debug)]
pub struct ContactScanner {
    lines: u8,
    line: u8,
    step: u8,
    value: u8,
    last_seen: [u8; MAX_CONTACT_LINES],
    stats: ScanStats,
}

impl ContactScanner {
    /// Scan `Contact(0)..Contact(lines - 1)`.
    pub fn new(lines: u8) -> Self {
        Self {
            lines: lines.min(MAX_CONTACT_LINES as u8),
            line: 0,
            step: 0,
            value: 0,
            last_seen: [0; MAX_CONTACT_LINES],
            stats: ScanStats::default(),
        }
    }

    /// Number of scanned lines.
    pub fn lines(&self) -> u8 {
        self.lines
    }

    /// Line currently being scanned.
    pub fn current_line(&self) -> u8 {
        self.line
    }

    /// Last id reported on `line`, 0 when nothing was seen yet.
    pub fn last_seen(&self, line: u8) -> u8 {
        self.last_seen.get(line as usize).copied().unwrap_or(0)
    }

    /// Counters since start-up.
    pub fn stats(&self) -> ScanStats {
        self.stats
    }

    /// Advance by one tick. Only drive ticks do anything.
    pub fn tick<L: LineInterface + ?Sized>(
        &mut self,
        phase: Phase,
        lines: &mut L,
    ) -> Option<ScanReport> {
        if phase != Phase::Drive || self.lines == 0 {
            return None;
        }
        let contact = Line::Contact(self.line);

        match self.step {
            0 => lines.drive(contact, true),
            1 => lines.drive(contact, false),
            2 => {
                if !lines.sample(contact) {
                    self.stats.empty += 1;
                    self.next_line();
                    return None;
                }
                self.value = 0;
            }
            3..=10 => {
                if lines.sample(contact) {
                    self.value |= 1u8 << (self.step - 3);
                }
            }
            _ => {
                let check = lines.sample(contact);
                let report = self.finish(check);
                self.next_line();
                return report;
            }
        }
        self.step += 1;
        None
    }

    fn finish(&mut self, check: bool) -> Option<ScanReport> {
        let line = self.line;
        let id = self.value;
        if !check {
            self.stats.check_errors += 1;
            debug!(line, id, "contact scan check bit low");
            return None;
        }
        let cached = &mut self.last_seen[line as usize];
        if *cached == id {
            self.stats.duplicates += 1;
            trace!(line, id, "contact unchanged");
            return None;
        }
        *cached = id;
        self.stats.reports += 1;
        debug!(line, id, "contact report");
        Some(ScanReport { line, id })
    }

    fn next_line(&mut self) {
        self.stats.cycles += 1;
        self.step = 0;
        self.line = (self.line + 1) % self.lines;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Answer {
    Idle,
    Presence,
    Bit(u8),
    Check,
    Release,
}

/// Train-side answer to contact-scan pulses.
///
/// Acts on sample ticks, half a cycle after the scanner, so every level it
/// drives is stable when the scanner samples on the next drive tick. An id
/// of 0 never answers.
#[derive(Clone, Copy, Debug)]
pub struct ContactResponder {
    answer: Answer,
    id: u8,
}

impl Default for ContactResponder {
    fn default() -> Self {
        Self::new()
    }
}

impl ContactResponder {
    /// Idle responder.
    pub const fn new() -> Self {
        Self {
            answer: Answer::Idle,
            id: 0,
        }
    }

    /// Advance by one tick on `line`, answering with `id`.
    pub fn tick<L: LineInterface + ?Sized>(&mut self, phase: Phase, lines: &mut L, line: Line, id: u8) {
        if phase != Phase::Sample {
            return;
        }
        self.answer = match self.answer {
            Answer::Idle => {
                if id != 0 && lines.sample(line) {
                    self.id = id;
                    Answer::Presence
                } else {
                    Answer::Idle
                }
            }
            Answer::Presence => {
                lines.drive(line, true);
                Answer::Bit(0)
            }
            Answer::Bit(i) => {
                lines.drive(line, (self.id >> i) & 1 == 1);
                if i == 7 {
                    Answer::Check
                } else {
                    Answer::Bit(i + 1)
                }
            }
            Answer::Check => {
                lines.drive(line, true);
                Answer::Release
            }
            Answer::Release => {
                lines.drive(line, false);
                Answer::Idle
            }
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::MockLines;
    use std::collections::VecDeque;

    /// Answers samples from a script, ignores drives.
    struct Scripted(VecDeque<bool>);

    impl LineInterface for Scripted {
        fn drive(&mut self, _line: Line, _active: bool) {}

        fn sample(&mut self, _line: Line) -> bool {
            self.0.pop_front().unwrap_or(false)
        }
    }

    fn script(id: u8, check: bool) -> Scripted {
        let mut bits = VecDeque::new();
        bits.push_back(true);
        for i in 0..8 {
            bits.push_back((id >> i) & 1 == 1);
        }
        bits.push_back(check);
        Scripted(bits)
    }

    fn scan_once<L: LineInterface>(scanner: &mut ContactScanner, lines: &mut L) -> Option<ScanReport> {
        let mut report = None;
        for _ in 0..SCAN_STEPS {
            if let Some(r) = scanner.tick(Phase::Drive, lines) {
                report = Some(r);
            }
            scanner.tick(Phase::Sample, lines);
        }
        report
    }

    #[test]
    fn valid_answer_is_reported_once() {
        let mut scanner = ContactScanner::new(1);
        let report = scan_once(&mut scanner, &mut script(0x0A, true));
        assert_eq!(report, Some(ScanReport { line: 0, id: 0x0A }));
        assert_eq!(scanner.last_seen(0), 0x0A);

        assert_eq!(scan_once(&mut scanner, &mut script(0x0A, true)), None);
        let stats = scanner.stats();
        assert_eq!(stats.reports, 1);
        assert_eq!(stats.duplicates, 1);
        assert_eq!(stats.cycles, 2);
    }

    #[test]
    fn different_id_reports_again() {
        let mut scanner = ContactScanner::new(1);
        scan_once(&mut scanner, &mut script(0x0A, true));
        let report = scan_once(&mut scanner, &mut script(0x0B, true));
        assert_eq!(report, Some(ScanReport { line: 0, id: 0x0B }));
        let report = scan_once(&mut scanner, &mut script(0x0A, true));
        assert_eq!(report, Some(ScanReport { line: 0, id: 0x0A }));
    }

    #[test]
    fn bad_check_bit_discards_cycle() {
        let mut scanner = ContactScanner::new(1);
        assert_eq!(scan_once(&mut scanner, &mut script(0x0A, false)), None);
        assert_eq!(scanner.stats().check_errors, 1);
        assert_eq!(scanner.last_seen(0), 0);
    }

    #[test]
    fn train_leaving_mid_frame_is_discarded() {
        let mut scanner = ContactScanner::new(1);
        // presence and bit 0, then the line goes quiet
        let mut lines = Scripted(VecDeque::from([true, true]));
        assert_eq!(scan_once(&mut scanner, &mut lines), None);
        assert_eq!(scanner.stats().check_errors, 1);
        assert_eq!(scanner.stats().reports, 0);
        assert_eq!(scanner.last_seen(0), 0);
    }

    #[test]
    fn empty_line_moves_on_after_three_cycles() {
        let mut scanner = ContactScanner::new(3);
        let mut lines = Scripted(VecDeque::new());
        for _ in 0..3 {
            scanner.tick(Phase::Drive, &mut lines);
            scanner.tick(Phase::Sample, &mut lines);
        }
        assert_eq!(scanner.current_line(), 1);
        assert_eq!(scanner.stats().empty, 1);
    }

    #[test]
    fn lines_are_visited_round_robin() {
        let mut scanner = ContactScanner::new(2);
        let mut lines = Scripted(VecDeque::new());
        let mut visited = std::vec::Vec::new();
        for _ in 0..4 {
            visited.push(scanner.current_line());
            for _ in 0..3 {
                scanner.tick(Phase::Drive, &mut lines);
            }
        }
        assert_eq!(visited, [0, 1, 0, 1]);
    }

    #[test]
    fn zero_lines_never_touch_the_bus() {
        let mut scanner = ContactScanner::new(0);
        let mut lines = MockLines::new();
        for _ in 0..10 {
            assert_eq!(scanner.tick(Phase::Drive, &mut lines), None);
        }
        assert!(!lines.level(Line::Contact(0)));
    }

    #[test]
    fn responder_answers_scanner_on_its_line() {
        let mut scanner = ContactScanner::new(2);
        let mut train = ContactResponder::new();
        let mut lines = MockLines::new();
        let mut reports = std::vec::Vec::new();
        for _ in 0..60 {
            for phase in [Phase::Drive, Phase::Sample] {
                reports.extend(scanner.tick(phase, &mut lines));
                train.tick(phase, &mut lines, Line::Contact(1), 0x35);
            }
        }
        assert_eq!(reports, [ScanReport { line: 1, id: 0x35 }]);
        assert_eq!(scanner.stats().check_errors, 0);
    }

    #[test]
    fn unassigned_responder_stays_silent() {
        let mut scanner = ContactScanner::new(1);
        let mut train = ContactResponder::new();
        let mut lines = MockLines::new();
        for _ in 0..30 {
            for phase in [Phase::Drive, Phase::Sample] {
                assert_eq!(scanner.tick(phase, &mut lines), None);
                train.tick(phase, &mut lines, Line::Contact(0), 0);
            }
        }
        assert!(scanner.stats().empty > 0);
    }
}
