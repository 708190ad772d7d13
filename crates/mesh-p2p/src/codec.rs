//! Newline-delimited framing over raw bytes.
//!
//! Unlike a string line codec, decoding never fails on content: a line that
//! is not UTF-8 is still a line (and fails later as a malformed frame), and a
//! line over the length limit is discarded up to its newline and reported as
//! [`RawLine::Oversized`]. Only I/O errors end the stream.

use std::io;

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// One decoded unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawLine {
    /// Line content without the trailing `\n`.
    Line(Bytes),
    /// A line longer than the limit was skipped.
    Oversized,
}

/// Codec splitting a byte stream on `\n` with a maximum line length.
#[derive(Debug, Clone)]
pub struct LineFrameCodec {
    max_length: usize,
    /// Bytes already scanned for a newline.
    next_index: usize,
    /// Skipping the rest of an oversized line.
    discarding: bool,
}

impl LineFrameCodec {
    /// Creates a codec that skips lines longer than `max_length` bytes.
    #[must_use]
    pub const fn new(max_length: usize) -> Self {
        Self {
            max_length,
            next_index: 0,
            discarding: false,
        }
    }

    /// Returns the maximum line length.
    #[must_use]
    pub const fn max_length(&self) -> usize {
        self.max_length
    }
}

impl Decoder for LineFrameCodec {
    type Item = RawLine;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<RawLine>, io::Error> {
        loop {
            let read_to = buf.len().min(self.max_length.saturating_add(1));
            let newline = buf[self.next_index..read_to]
                .iter()
                .position(|b| *b == b'\n')
                .map(|offset| self.next_index + offset);

            match (self.discarding, newline) {
                (true, Some(index)) => {
                    buf.advance(index + 1);
                    self.discarding = false;
                    self.next_index = 0;
                    return Ok(Some(RawLine::Oversized));
                }
                (true, None) => {
                    buf.advance(read_to);
                    self.next_index = 0;
                    if buf.is_empty() {
                        return Ok(None);
                    }
                }
                (false, Some(index)) => {
                    self.next_index = 0;
                    let mut line = buf.split_to(index + 1);
                    line.truncate(index);
                    return Ok(Some(RawLine::Line(line.freeze())));
                }
                (false, None) if buf.len() > self.max_length => {
                    self.discarding = true;
                }
                (false, None) => {
                    self.next_index = read_to;
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<RawLine>, io::Error> {
        match self.decode(buf)? {
            Some(line) => Ok(Some(line)),
            None => {
                // Unterminated tail at EOF is not a frame.
                buf.clear();
                self.next_index = 0;
                self.discarding = false;
                Ok(None)
            }
        }
    }
}

impl<T: AsRef<str>> Encoder<T> for LineFrameCodec {
    type Error = io::Error;

    fn encode(&mut self, line: T, buf: &mut BytesMut) -> Result<(), io::Error> {
        let line = line.as_ref();
        buf.reserve(line.len() + 1);
        buf.extend_from_slice(line.as_bytes());
        buf.extend_from_slice(b"\n");
        Ok(())
    }
}
