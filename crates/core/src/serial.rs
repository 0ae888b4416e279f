//! Serial console text.
//!
//! The robot prints line-oriented text on its UART. [`LineSplitter`] buffers
//! raw serial bytes and yields complete lines (LF terminated, CR stripped),
//! which the server forwards to clients as `RawSerial` frames.

use bytes::{Buf, BytesMut};

/// Longest line kept before it is emitted without a terminator.
pub const MAX_LINE_LEN: usize = 1024;

#[derive(Debug, Default)]
pub struct LineSplitter {
    buf: BytesMut,
}

impl LineSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes waiting for a line terminator.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Append serial bytes and return every line completed by them.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line = self.buf.split_to(pos);
            self.buf.advance(1);
            lines.push(to_text(&line));
        }
        while self.buf.len() >= MAX_LINE_LEN {
            let line = self.buf.split_to(MAX_LINE_LEN);
            lines.push(to_text(&line));
        }
        lines
    }

    /// Emit whatever is buffered as a final, unterminated line.
    pub fn flush(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let line = self.buf.split();
        Some(to_text(&line))
    }
}

fn to_text(line: &[u8]) -> String {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    String::from_utf8_lossy(line).into_owned()
}

/// Console command as written to the serial device.
pub fn command_bytes(cmd: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(cmd.len() + 1);
    out.extend_from_slice(cmd.as_bytes());
    out.push(b'\n');
    out
}
