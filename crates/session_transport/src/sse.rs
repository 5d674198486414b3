use crate::error::DecodeError;

/// Default bound for the undecoded tail of one frame.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;

const BOM: &[u8] = b"\xEF\xBB\xBF";

/// One dispatched SSE frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Frame {
    /// Value of the last `event:` field, if any.
    pub event: Option<String>,
    /// `data:` lines joined with `\n` in arrival order.
    pub data: String,
    /// Value of the `id:` field carried by this frame.
    pub id: Option<String>,
    /// Reconnection delay hint in milliseconds.
    pub retry: Option<u64>,
}

#[derive(Debug, Default)]
struct PartialFrame {
    event: Option<String>,
    data: Option<String>,
    id: Option<String>,
    retry: Option<u64>,
}

impl PartialFrame {
    fn data_len(&self) -> usize {
        self.data.as_ref().map_or(0, String::len)
    }
}

/// Incremental decoder for `text/event-stream` bodies.
///
/// Bytes go in through [`SseDecoder::feed`]; complete frames come out of
/// [`SseDecoder::next_frame`] one at a time. Only the undecoded tail of the
/// current frame is held.
#[derive(Debug)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    partial: PartialFrame,
    last_event_id: Option<String>,
    retry_hint: Option<u64>,
    max_frame_bytes: usize,
    at_stream_start: bool,
}

impl Default for SseDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl SseDecoder {
    #[must_use]
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            buffer: Vec::new(),
            partial: PartialFrame::default(),
            last_event_id: None,
            retry_hint: None,
            max_frame_bytes: max_frame_bytes.max(1),
            at_stream_start: true,
        }
    }

    /// Seed the cursor with the last event seen by a previous connection.
    #[must_use]
    pub fn with_last_event_id(mut self, last_event_id: impl Into<String>) -> Self {
        self.last_event_id = Some(last_event_id.into());
        self
    }

    /// Append raw bytes from the transport.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
        if self.at_stream_start {
            if self.buffer.len() < BOM.len() && BOM.starts_with(&self.buffer) {
                return;
            }
            if self.buffer.starts_with(BOM) {
                self.buffer.drain(..BOM.len());
            }
            self.at_stream_start = false;
        }
    }

    /// Decode the next complete frame from buffered bytes.
    ///
    /// Returns `Ok(None)` when more bytes are needed. Comment lines and frames
    /// without `data` dispatch nothing.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, DecodeError> {
        loop {
            let Some((line_len, terminator_len)) = find_line_end(&self.buffer) else {
                if self.buffer.len() + self.partial.data_len() > self.max_frame_bytes {
                    return Err(DecodeError::FrameTooLarge {
                        limit: self.max_frame_bytes,
                    });
                }
                return Ok(None);
            };

            let line: Vec<u8> = self.buffer.drain(..line_len + terminator_len).collect();
            let line = std::str::from_utf8(&line[..line_len])?;

            if line.is_empty() {
                if let Some(frame) = self.dispatch() {
                    return Ok(Some(frame));
                }
                continue;
            }

            self.process_line(line);
            if self.partial.data_len() > self.max_frame_bytes {
                return Err(DecodeError::FrameTooLarge {
                    limit: self.max_frame_bytes,
                });
            }
        }
    }

    /// Drain every frame that is complete in the current buffer.
    pub fn drain_frames(&mut self) -> Result<Vec<Frame>, DecodeError> {
        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    /// Decode a complete body in one shot.
    pub fn parse_frames(input: &str) -> Result<Vec<Frame>, DecodeError> {
        let mut decoder = Self::default();
        decoder.feed(input.as_bytes());
        decoder.drain_frames()
    }

    /// Drop buffered bytes and any half-built frame, keeping the id cursor.
    ///
    /// Used before reconnecting: the new connection starts at a frame boundary.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.buffer.shrink_to_fit();
        self.partial = PartialFrame::default();
        self.at_stream_start = true;
    }

    #[must_use]
    pub fn last_event_id(&self) -> Option<&str> {
        self.last_event_id.as_deref()
    }

    /// Most recent `retry:` hint in milliseconds.
    #[must_use]
    pub fn retry_hint(&self) -> Option<u64> {
        self.retry_hint
    }

    #[must_use]
    pub fn buffered_len(&self) -> usize {
        self.buffer.len() + self.partial.data_len()
    }

    #[must_use]
    pub fn is_empty_buffer(&self) -> bool {
        self.buffer.iter().all(u8::is_ascii_whitespace) && self.partial.data.is_none()
    }

    fn process_line(&mut self, line: &str) {
        if line.starts_with(':') {
            return;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "event" => self.partial.event = Some(value.to_string()),
            "data" => match self.partial.data.as_mut() {
                Some(data) => {
                    data.push('\n');
                    data.push_str(value);
                }
                None => self.partial.data = Some(value.to_string()),
            },
            "id" if !value.contains('\0') => self.partial.id = Some(value.to_string()),
            "retry" if !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit()) => {
                if let Ok(retry) = value.parse::<u64>() {
                    self.partial.retry = Some(retry);
                    self.retry_hint = Some(retry);
                }
            }
            _ => {}
        }
    }

    /// Complete the current frame. The id cursor moves here, never on a half-read frame.
    fn dispatch(&mut self) -> Option<Frame> {
        let partial = std::mem::take(&mut self.partial);
        if let Some(id) = partial.id.as_deref() {
            self.last_event_id = Some(id.to_string()).filter(|id| !id.is_empty());
        }
        let data = partial.data?;
        Some(Frame {
            event: partial.event.filter(|event| !event.is_empty()),
            data,
            id: partial.id.filter(|id| !id.is_empty()),
            retry: partial.retry,
        })
    }
}

/// Position of the first line terminator as `(line_len, terminator_len)`.
///
/// A trailing lone `\r` is not a terminator yet: the next chunk may start with `\n`.
fn find_line_end(buffer: &[u8]) -> Option<(usize, usize)> {
    let position = buffer.iter().position(|&b| b == b'\n' || b == b'\r')?;
    if buffer[position] == b'\n' {
        return Some((position, 1));
    }
    match buffer.get(position + 1) {
        Some(b'\n') => Some((position, 2)),
        Some(_) => Some((position, 1)),
        None => None,
    }
}
