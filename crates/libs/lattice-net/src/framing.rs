//! Frame extraction from a TCP byte stream.
//!
//! Outbound frames are length-prefixed (u32 little-endian). Inbound, both
//! length-prefixed and newline-terminated JSON documents are accepted, so
//! peers on either framing convention interoperate.
//!
//! Mode detection per frame: a newline-framed document starts with `{` and
//! its first four bytes are JSON text, which never contains NUL; a length
//! prefix for any sane frame size has NUL in its upper bytes. The check
//! needs at most four buffered bytes.

/// Default cap on one frame. Larger frames poison the stream and close the
/// link.
pub const DEFAULT_MAX_FRAME: usize = 16 * 1024;

const LENGTH_PREFIX: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("frame of {0} bytes exceeds the limit")]
    Oversize(usize),
}

/// Wrap a payload in the outbound length-prefixed framing.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(LENGTH_PREFIX + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(payload);
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    LengthPrefix,
    Newline,
}

/// Accumulates raw reads and peels complete frames.
pub struct FrameBuffer {
    buf: Vec<u8>,
    max_frame: usize,
}

impl FrameBuffer {
    pub fn new(max_frame: usize) -> Self {
        Self { buf: Vec::with_capacity(2048), max_frame }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Peel the next complete frame, if one is buffered. `Ok(None)` means
    /// more bytes are needed; an error means the stream is unrecoverable.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        match self.detect_mode() {
            None => {
                if self.buf.len() > self.max_frame {
                    return Err(FrameError::Oversize(self.buf.len()));
                }
                Ok(None)
            }
            Some(Mode::Newline) => self.next_newline_frame(),
            Some(Mode::LengthPrefix) => self.next_length_prefixed_frame(),
        }
    }

    fn detect_mode(&self) -> Option<Mode> {
        if self.buf.is_empty() {
            return None;
        }
        if self.buf[0] != b'{' {
            return Some(Mode::LengthPrefix);
        }
        // a tiny document like `{}\n` resolves before four bytes arrive
        let head = &self.buf[..self.buf.len().min(LENGTH_PREFIX)];
        if head.contains(&b'\n') {
            return Some(Mode::Newline);
        }
        if self.buf.len() < LENGTH_PREFIX {
            return None;
        }
        if head[1..].contains(&0) {
            Some(Mode::LengthPrefix)
        } else {
            Some(Mode::Newline)
        }
    }

    fn next_newline_frame(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        let Some(end) = self.buf.iter().position(|&b| b == b'\n') else {
            if self.buf.len() > self.max_frame {
                return Err(FrameError::Oversize(self.buf.len()));
            }
            return Ok(None);
        };
        let mut frame: Vec<u8> = self.buf.drain(..=end).collect();
        frame.pop();
        if frame.last() == Some(&b'\r') {
            frame.pop();
        }
        if frame.len() > self.max_frame {
            return Err(FrameError::Oversize(frame.len()));
        }
        Ok(Some(frame))
    }

    fn next_length_prefixed_frame(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        if self.buf.len() < LENGTH_PREFIX {
            return Ok(None);
        }
        let mut len_bytes = [0u8; LENGTH_PREFIX];
        len_bytes.copy_from_slice(&self.buf[..LENGTH_PREFIX]);
        let len = u32::from_le_bytes(len_bytes) as usize;
        if len > self.max_frame {
            return Err(FrameError::Oversize(len));
        }
        if self.buf.len() < LENGTH_PREFIX + len {
            return Ok(None);
        }
        let frame = self.buf[LENGTH_PREFIX..LENGTH_PREFIX + len].to_vec();
        self.buf.drain(..LENGTH_PREFIX + len);
        Ok(Some(frame))
    }
}
