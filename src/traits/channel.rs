//! Host command channel abstraction.
//!
//! On the station board this is an interrupt-driven UART ring buffer to
//! the relay computer. The engines only need two operations: take the next
//! received byte if there is one, and queue a reply byte.

/// Byte-oriented link to the host.
///
/// `read_byte` must not block; it returns `None` when nothing is buffered.
pub trait HostChannel {
    /// Take the next received byte.
    fn read_byte(&mut self) -> Option<u8>;

    /// Queue one reply byte for transmission.
    fn write_byte(&mut self, byte: u8);

    /// Queue a run of reply bytes.
    fn write_all(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.write_byte(b);
        }
    }
}
