//! Newline framing over a byte stream.

/// Outcome of feeding bytes into a [`FrameBuffer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameEvent {
    /// A complete line, newline and trailing `\r` stripped.
    Frame(Vec<u8>),
    /// A line longer than the limit was dropped.
    Oversized,
}

/// Accumulates partial reads until a newline completes a frame.
///
/// Lines over `max_frame_bytes` are skipped up to their newline without
/// being buffered. `0` disables the guard. Blank lines yield nothing.
#[derive(Debug)]
pub struct FrameBuffer {
    buffer: Vec<u8>,
    max_frame_bytes: usize,
    discarding: bool,
}

impl FrameBuffer {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_frame_bytes,
            discarding: false,
        }
    }

    /// Bytes held for the current incomplete line.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    fn exceeds(&self, extra: usize) -> bool {
        self.max_frame_bytes > 0 && self.buffer.len() + extra > self.max_frame_bytes
    }

    pub fn push(&mut self, mut data: &[u8]) -> Vec<FrameEvent> {
        let mut events = Vec::new();

        while let Some(pos) = data.iter().position(|b| *b == b'\n') {
            let line = &data[..pos];
            data = &data[pos + 1..];

            if self.discarding {
                self.discarding = false;
                continue;
            }
            if self.exceeds(line.len()) {
                self.buffer.clear();
                events.push(FrameEvent::Oversized);
                continue;
            }

            self.buffer.extend_from_slice(line);
            let mut frame = std::mem::take(&mut self.buffer);
            if frame.last() == Some(&b'\r') {
                frame.pop();
            }
            if frame.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            events.push(FrameEvent::Frame(frame));
        }

        if !data.is_empty() && !self.discarding {
            if self.exceeds(data.len()) {
                self.buffer.clear();
                self.discarding = true;
                events.push(FrameEvent::Oversized);
            } else {
                self.buffer.extend_from_slice(data);
            }
        }

        events
    }
}
