//! Line framing for the device serial link
//!
//! The device speaks newline-terminated JSON, but reads arrive in whatever
//! chunks the port hands back. Bytes accumulate until a `\n` shows up:
//! - every complete line is yielded, trimmed
//! - the trailing fragment stays buffered until more bytes arrive
//! - an unterminated tail at end-of-stream is dropped, never parsed
//! - a line longer than [`MAX_LINE_LENGTH`] is dropped whole, however it
//!   was chunked
//!
//! Splitting happens on raw bytes, so a multi-byte UTF-8 character cut in
//! half between two reads is reassembled before decoding.

use bytes::BytesMut;
use tokio_util::codec::Decoder;
use tracing::{debug, warn};

/// Upper bound for a single buffered line
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Incremental newline splitter
///
/// Usable directly through [`LineDecoder::feed`] or as a
/// [`tokio_util::codec::Decoder`] under a `FramedRead`.
#[derive(Debug, Default)]
pub struct LineDecoder {
    buffer: BytesMut,
    // bytes of the current fragment already searched for a newline
    scanned: usize,
    // inside an oversized line, skip through its newline
    discarding: bool,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every line it completed
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut buffer = std::mem::take(&mut self.buffer);
        buffer.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(line) = self.split_line(&mut buffer) {
            lines.push(line);
        }

        self.buffer = buffer;
        lines
    }

    /// Bytes waiting for a newline
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    fn split_line(&mut self, buffer: &mut BytesMut) -> Option<String> {
        loop {
            let offset = self.scanned.min(buffer.len());

            let Some(pos) = buffer[offset..].iter().position(|b| *b == b'\n') else {
                if self.discarding {
                    buffer.clear();
                    self.scanned = 0;
                } else if buffer.len() > MAX_LINE_LENGTH {
                    warn!(
                        dropped = buffer.len(),
                        "no newline within {} bytes, discarding line", MAX_LINE_LENGTH
                    );
                    buffer.clear();
                    self.scanned = 0;
                    self.discarding = true;
                } else {
                    self.scanned = buffer.len();
                }
                return None;
            };

            let end = offset + pos;
            let raw = buffer.split_to(end + 1);
            self.scanned = 0;

            if self.discarding {
                self.discarding = false;
                debug!(bytes = end, "end of oversized line skipped");
                continue;
            }
            if end > MAX_LINE_LENGTH {
                warn!(dropped = end, "line exceeds {} bytes, discarded", MAX_LINE_LENGTH);
                continue;
            }
            return Some(String::from_utf8_lossy(&raw[..end]).trim().to_string());
        }
    }
}

impl Decoder for LineDecoder {
    type Item = String;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<String>, Self::Error> {
        Ok(self.split_line(src))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<String>, Self::Error> {
        if let Some(line) = self.split_line(src) {
            return Ok(Some(line));
        }
        if !src.is_empty() {
            debug!(bytes = src.len(), "end of stream with unterminated fragment, dropped");
            src.clear();
        }
        self.scanned = 0;
        self.discarding = false;
        Ok(None)
    }
}
