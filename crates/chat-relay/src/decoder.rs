//! Incremental decoder for `text/event-stream` chat-completion bodies
//!
//! The body arrives in arbitrary chunks. Each event is one or more
//! `data: <payload>` lines closed by a blank line; the payload is either a
//! JSON chunk or the `[DONE]` sentinel. The decoder is a small state machine
//! over a byte buffer:
//!
//! ```text
//!   Idle --data: line--> Collecting --blank line--> (dispatch) --> Idle
//!     \                                                |
//!      `------------------ [DONE] / error -------------+--> Finished
//! ```
//!
//! Bytes that do not yet form a complete line stay buffered for the next
//! [`StreamDecoder::feed`]. UTF-8 is only decoded once a payload is complete,
//! so a character split across chunks is never mangled.

use serde::Deserialize;

use crate::error::Error;

/// Field prefix that introduces event payload lines
const DATA_PREFIX: &[u8] = b"data:";

/// Provider-side end-of-stream marker
pub const DONE_SENTINEL: &str = "[DONE]";

/// How a turn ended
#[derive(Debug)]
pub enum TerminalSignal {
    Completed,
    Failed(Error),
}

/// One unit of decoder output
#[derive(Debug)]
pub enum Decoded {
    /// Newly available assistant text, never empty
    Delta(String),
    /// End of the turn; nothing follows
    Terminal(TerminalSignal),
}

#[derive(Debug)]
enum Frame {
    /// Between events, waiting for a `data:` line
    Idle,
    /// Inside an event, collecting `data:` lines until a blank line
    Collecting { data: Vec<u8> },
    /// A terminal signal has been produced
    Finished,
}

/// Outcome of decoding one complete payload
enum Payload {
    Skip,
    Delta(String),
    Terminal(TerminalSignal),
}

/// Decodes a chat-completion event stream into text deltas.
#[derive(Debug)]
pub struct StreamDecoder {
    buffer: Vec<u8>,
    /// Offset up to which `buffer` is known to contain no newline
    scanned: usize,
    frame: Frame,
    events: usize,
    warnings: usize,
}

impl Default for StreamDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            scanned: 0,
            frame: Frame::Idle,
            events: 0,
            warnings: 0,
        }
    }

    /// Whether a terminal signal has already been produced
    pub fn is_finished(&self) -> bool {
        matches!(self.frame, Frame::Finished)
    }

    /// Number of complete events dispatched so far
    pub fn events_seen(&self) -> usize {
        self.events
    }

    /// Number of events skipped because their payload could not be decoded
    pub fn decode_warnings(&self) -> usize {
        self.warnings
    }

    /// Number of bytes buffered waiting for the rest of a line
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Append a chunk and decode every event it completes.
    ///
    /// Ignored once the decoder is finished.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Decoded> {
        let mut out = Vec::new();
        if self.is_finished() {
            tracing::trace!("Ignoring {} bytes fed after end of stream", chunk.len());
            return out;
        }

        // CR never appears unescaped inside a JSON payload, so dropping it
        // turns CRLF framing into LF framing.
        self.buffer
            .extend(chunk.iter().copied().filter(|b| *b != b'\r'));

        let mut consumed = 0;
        while let Some(rel) = self.buffer[self.scanned..]
            .iter()
            .position(|b| *b == b'\n')
        {
            let line_end = self.scanned + rel;
            let line = &self.buffer[consumed..line_end];
            consumed = line_end + 1;
            self.scanned = consumed;

            let Some(payload) = advance(&mut self.frame, line) else {
                continue;
            };
            self.events += 1;
            match self.decode_payload(&payload) {
                Payload::Skip => {}
                Payload::Delta(text) => out.push(Decoded::Delta(text)),
                Payload::Terminal(signal) => {
                    self.finish();
                    out.push(Decoded::Terminal(signal));
                    return out;
                }
            }
        }

        self.buffer.drain(..consumed);
        self.scanned = self.buffer.len();
        out
    }

    /// The transport closed the body.
    ///
    /// Without a prior `[DONE]` this still reports `Completed`: providers are
    /// known to close the connection without the marker. The same path also
    /// hides a truncated body, so the leftover state is logged.
    pub fn end(&mut self) -> Option<TerminalSignal> {
        if self.is_finished() {
            return None;
        }
        let partial = !self.buffer.is_empty() || matches!(self.frame, Frame::Collecting { .. });
        if partial {
            tracing::debug!(
                "Stream closed without {} mid-event ({} bytes undecoded); treating as complete",
                DONE_SENTINEL,
                self.buffer.len()
            );
        } else {
            tracing::debug!("Stream closed without {}; treating as complete", DONE_SENTINEL);
        }
        self.finish();
        Some(TerminalSignal::Completed)
    }

    /// The transport failed. Discards any partial event.
    pub fn error(&mut self, err: Error) -> Option<TerminalSignal> {
        if self.is_finished() {
            tracing::debug!("Dropping transport error after end of stream: {}", err);
            return None;
        }
        self.finish();
        Some(TerminalSignal::Failed(err))
    }

    fn finish(&mut self) {
        self.frame = Frame::Finished;
        self.buffer.clear();
        self.scanned = 0;
    }

    fn decode_payload(&mut self, raw: &[u8]) -> Payload {
        let text = match std::str::from_utf8(raw) {
            Ok(text) => text.trim(),
            Err(e) => {
                self.warnings += 1;
                tracing::warn!("Skipping stream event with invalid UTF-8: {}", e);
                return Payload::Skip;
            }
        };

        if text == DONE_SENTINEL {
            return Payload::Terminal(TerminalSignal::Completed);
        }
        if text.is_empty() {
            return Payload::Skip;
        }

        let value: serde_json::Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(e) => {
                self.warnings += 1;
                tracing::warn!("Skipping malformed stream event: {} (payload: {})", e, text);
                return Payload::Skip;
            }
        };

        // Valid JSON of any other shape carries no delta.
        let chunk = match StreamChunk::deserialize(&value) {
            Ok(chunk) => chunk,
            Err(e) => {
                tracing::trace!("Skipping stream event without delta: {}", e);
                return Payload::Skip;
            }
        };
        if let Some(err) = chunk.error {
            tracing::warn!("Provider reported an error mid-stream, skipping: {}", err);
            return Payload::Skip;
        }
        match chunk.delta_text() {
            Some(delta) => Payload::Delta(delta),
            None => Payload::Skip,
        }
    }
}

/// Feed one complete line to the framing state machine. Returns the payload
/// when the line closes an event.
fn advance(frame: &mut Frame, line: &[u8]) -> Option<Vec<u8>> {
    if line.is_empty() {
        return match std::mem::replace(frame, Frame::Idle) {
            Frame::Collecting { data } => Some(data),
            other => {
                *frame = other;
                None
            }
        };
    }

    // `event:`, `id:`, `retry:` and `:` comments carry nothing we use.
    let value = line.strip_prefix(DATA_PREFIX)?;
    let value = value.strip_prefix(b" ").unwrap_or(value);
    match frame {
        Frame::Idle => {
            *frame = Frame::Collecting {
                data: value.to_vec(),
            };
        }
        Frame::Collecting { data } => {
            data.push(b'\n');
            data.extend_from_slice(value);
        }
        Frame::Finished => {}
    }
    None
}

// Streaming chunk shape

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Option<Vec<StreamChoice>>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Option<StreamDelta>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

impl StreamChunk {
    fn delta_text(self) -> Option<String> {
        self.choices?
            .into_iter()
            .next()?
            .delta?
            .content
            .filter(|c| !c.is_empty())
    }
}
