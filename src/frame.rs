//! Line framing for the inbound byte stream of one leg.

use std::fmt;

/// Byte that ends every line sent by a leg controller.
pub const LINE_TERMINATOR: u8 = b'\n';

/// One complete line from a leg controller, without its terminator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    text: String,
}

impl Frame {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// The line with any trailing carriage return removed, for display.
    pub fn display_text(&self) -> &str {
        self.text.trim_end_matches('\r')
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_text())
    }
}

/// Accumulates bytes for one leg until a line terminator arrives.
#[derive(Debug, Default)]
pub struct FrameAssembler {
    buffer: Vec<u8>,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one byte; returns the completed frame when `byte` ends a line.
    pub fn feed(&mut self, byte: u8) -> Option<Frame> {
        if byte != LINE_TERMINATOR {
            self.buffer.push(byte);
            return None;
        }
        let text = String::from_utf8_lossy(&self.buffer).into_owned();
        self.buffer.clear();
        Some(Frame { text })
    }

    /// Number of buffered bytes not yet terminated.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Drop any unterminated bytes, returning how many were dropped.
    pub fn discard(&mut self) -> usize {
        let dropped = self.buffer.len();
        self.buffer.clear();
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_all(assembler: &mut FrameAssembler, bytes: &[u8]) -> Vec<Frame> {
        bytes.iter().filter_map(|&b| assembler.feed(b)).collect()
    }

    #[test]
    fn sample_line_yields_one_frame_and_empties_buffer() {
        let mut assembler = FrameAssembler::new();
        let line = "12.5\t0.3\t1.1\t200\t0.7\t2\t1.5\t0\n";

        let frames = feed_all(&mut assembler, line.as_bytes());

        assert_eq!(frames, vec![Frame::new("12.5\t0.3\t1.1\t200\t0.7\t2\t1.5\t0")]);
        assert_eq!(assembler.pending(), 0);
    }

    #[test]
    fn partial_line_stays_buffered() {
        let mut assembler = FrameAssembler::new();
        assert!(feed_all(&mut assembler, b"Select mode").is_empty());
        assert_eq!(assembler.pending(), 11);

        let frames = feed_all(&mut assembler, b" ^\r\nnext");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].as_str(), "Select mode ^\r");
        assert_eq!(frames[0].display_text(), "Select mode ^");
        assert_eq!(assembler.pending(), 4);
    }

    #[test]
    fn consecutive_terminators_produce_empty_frames() {
        let mut assembler = FrameAssembler::new();
        let frames = feed_all(&mut assembler, b"a\n\n");
        assert_eq!(frames, vec![Frame::new("a"), Frame::new("")]);
    }

    #[test]
    fn discard_reports_dropped_bytes() {
        let mut assembler = FrameAssembler::new();
        feed_all(&mut assembler, b"1.0\t2.");
        assert_eq!(assembler.discard(), 6);
        assert_eq!(assembler.pending(), 0);
    }
}
