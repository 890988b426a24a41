use crate::protocol::Command;
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt::Write as _;
use tracing::warn;

/// Line terminator appended to every outgoing command
pub const LINE_TERMINATOR: &[u8] = b"\r\n";

/// Longest partial line kept while waiting for a terminator
pub const MAX_PARTIAL_LINE: usize = 1024;

/// Splits notification chunks into text lines and encodes commands
///
/// Notifications arrive in arbitrary chunks (often 20 bytes), so a line can be
/// split across several of them. The codec keeps the unterminated tail of each
/// chunk and prefixes it to the next one. CR, LF and CRLF all terminate a line,
/// including a CRLF pair split across two chunks.
#[derive(Debug, Default)]
pub struct LineCodec {
    buffer: BytesMut,
    last_was_cr: bool,
}

impl LineCodec {
    /// Create an empty codec
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every line it completed
    pub fn decode(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();

        for &byte in chunk {
            match byte {
                b'\n' if self.last_was_cr => {
                    self.last_was_cr = false;
                }
                b'\r' | b'\n' => {
                    self.flush_line(&mut lines);
                    self.last_was_cr = byte == b'\r';
                }
                _ => {
                    self.last_was_cr = false;
                    self.buffer.put_u8(byte);
                    if self.buffer.len() >= MAX_PARTIAL_LINE {
                        warn!(
                            "Partial line exceeded {} bytes without terminator, flushing",
                            MAX_PARTIAL_LINE
                        );
                        self.flush_line(&mut lines);
                    }
                }
            }
        }

        lines
    }

    fn flush_line(&mut self, lines: &mut Vec<String>) {
        if self.buffer.is_empty() {
            return;
        }
        let raw = self.buffer.split();
        let text = String::from_utf8_lossy(&raw);
        let text = text.trim();
        if !text.is_empty() {
            lines.push(text.to_string());
        }
    }

    /// Bytes received after the last terminator
    #[must_use]
    pub fn pending(&self) -> &[u8] {
        &self.buffer
    }

    /// Drop any partial line, e.g. after the link went down
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.last_was_cr = false;
    }

    /// Encode a command as a terminated line
    #[must_use]
    pub fn encode(command: &Command) -> Bytes {
        Self::encode_text(&command.to_string())
    }

    /// Encode raw command text as a terminated line
    #[must_use]
    pub fn encode_text(text: &str) -> Bytes {
        let mut buf = BytesMut::with_capacity(text.len() + LINE_TERMINATOR.len());
        buf.extend_from_slice(text.as_bytes());
        buf.extend_from_slice(LINE_TERMINATOR);
        buf.freeze()
    }

    /// Render raw bytes for the raw-display path
    #[must_use]
    pub fn hex_dump(bytes: &[u8]) -> String {
        let mut out = String::with_capacity(bytes.len() * 3);
        for (i, byte) in bytes.iter().enumerate() {
            if i > 0 {
                out.push(' ');
            }
            let _ = write!(out, "{byte:02X}");
        }
        out
    }
}
