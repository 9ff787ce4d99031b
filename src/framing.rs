//! Line framing for the SMTP and POP3 handlers.
//!
//! Both protocols are CRLF-delimited. A read from the socket can end anywhere,
//! so bytes accumulate here until at least one full line is available; the
//! trailing fragment (no delimiter yet) stays buffered for the next read and
//! is never dispatched as a command.

const CRLF: &[u8] = b"\r\n";

#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append freshly read bytes to the buffer.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Drain and return the next complete line, delimiter stripped.
    /// Returns `None` while no full CRLF-terminated line is buffered.
    pub fn next_line(&mut self) -> Option<String> {
        let pos = self
            .buf
            .windows(CRLF.len())
            .position(|w| w == CRLF)?;
        let line: Vec<u8> = self.buf.drain(..pos + CRLF.len()).collect();
        Some(String::from_utf8_lossy(&line[..pos]).into_owned())
    }

    /// Bytes held back waiting for a delimiter.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}
