//! Newline-delimited JSON decoding for the chat stream.
//!
//! The backend answers with one JSON object per line:
//! ```text
//! {"delta":"Hel"}
//! {"delta":"lo"}
//! {"error":"model overloaded"}
//! {"done":true}
//! ```
//! [`NdjsonDecoder`] turns arbitrary byte chunks into parsed [`StreamRecord`]s
//! and [`consume_body`] drives a [`StreamHandler`] from any byte stream.

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

/// One parsed line of the response body. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamRecord {
    pub delta: Option<String>,
    pub done: Option<bool>,
    pub error: Option<String>,
}

impl StreamRecord {
    pub fn is_done(&self) -> bool {
        self.done == Some(true)
    }

    // Fields of the wrong type are treated as absent
    fn from_object(obj: &Map<String, Value>) -> Self {
        let text = |key: &str| obj.get(key).and_then(Value::as_str).map(str::to_string);
        Self {
            delta: text("delta"),
            done: obj.get("done").and_then(Value::as_bool),
            error: text("error"),
        }
    }
}

/// Incremental UTF-8 decoder and line splitter.
///
/// Bytes of a multi-byte character split across chunks are held back until
/// the rest arrives. Invalid sequences decode to U+FFFD.
#[derive(Debug, Default)]
pub struct NdjsonDecoder {
    pending: Vec<u8>,
    buffer: String,
}

impl NdjsonDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one chunk and returns every record completed by it, in order.
    /// Lines that are blank or not a JSON object are dropped.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<StreamRecord> {
        self.decode(chunk);

        let mut records = Vec::new();
        while let Some(newline_pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=newline_pos).collect();
            if let Some(record) = parse_line(&line) {
                records.push(record);
            }
        }
        records
    }

    /// Drops whatever is left once the body has ended. Only newline-terminated
    /// lines are records, so an unterminated tail is discarded.
    pub fn finish(&mut self) {
        if !self.pending.is_empty() {
            log::debug!("Dropping {} bytes of a truncated character", self.pending.len());
            self.pending.clear();
        }
        let rest = std::mem::take(&mut self.buffer);
        if !rest.trim().is_empty() {
            log::debug!("Dropping unterminated stream tail: {}", rest);
        }
    }

    /// Buffered text not yet terminated by a newline.
    pub fn buffered(&self) -> &str {
        &self.buffer
    }

    fn decode(&mut self, chunk: &[u8]) {
        self.pending.extend_from_slice(chunk);
        let mut input = std::mem::take(&mut self.pending);
        let mut rest: &[u8] = &input;

        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    self.buffer.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    // from_utf8 already validated this prefix
                    self.buffer.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(bad) => {
                            self.buffer.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[bad..];
                        }
                        // Incomplete sequence at the end: wait for more bytes
                        None => {
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }

        let keep = rest.len();
        input.drain(..input.len() - keep);
        self.pending = input;
    }
}

fn parse_line(line: &str) -> Option<StreamRecord> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    match serde_json::from_str::<Map<String, Value>>(line) {
        Ok(obj) => Some(StreamRecord::from_object(&obj)),
        Err(e) => {
            log::debug!("Skipping malformed stream record ({}): {}", e, line);
            None
        }
    }
}

/// Receives the decoded events of one generation.
#[async_trait]
pub trait StreamHandler: Send {
    /// A non-empty fragment of assistant text.
    async fn on_delta(&mut self, delta: &str);

    /// The stream completed, explicitly or by reaching end of body.
    async fn on_done(&mut self) {}

    /// The backend reported an error mid-stream. Processing continues.
    async fn on_error(&mut self, _message: &str) {}
}

/// How a stream that did not fail came to an end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    Completed,
    Cancelled,
}

/// Failures that end a stream without completing it.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// The request was refused or produced no readable body.
    #[error("{message}")]
    Request { status: Option<u16>, message: String },
    /// The connection failed while sending the request or reading the body.
    #[error("stream transport error: {0}")]
    Transport(String),
}

/// Reads `body` to the end, dispatching every record to `handler`.
///
/// Returns as soon as a `done` record is seen, the body ends, or `cancel`
/// fires. Once cancelled no further handler calls are made.
pub async fn consume_body<S, B, E>(
    body: S,
    cancel: &CancellationToken,
    handler: &mut dyn StreamHandler,
) -> Result<StreamOutcome, StreamError>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    let mut body = std::pin::pin!(body);
    let mut decoder = NdjsonDecoder::new();

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                log::info!("Stream cancelled");
                return Ok(StreamOutcome::Cancelled);
            }
            next = body.next() => next,
        };

        let chunk = match next {
            Some(Ok(chunk)) => chunk,
            Some(Err(e)) => {
                log::error!("Error reading stream body: {}", e);
                return Err(StreamError::Transport(e.to_string()));
            }
            None => break,
        };

        for record in decoder.feed(chunk.as_ref()) {
            if dispatch(&record, cancel, handler).await == Flow::Stop {
                return Ok(finish_outcome(cancel));
            }
        }
    }

    decoder.finish();

    // End of body without a done record counts as completion
    if cancel.is_cancelled() {
        return Ok(StreamOutcome::Cancelled);
    }
    log::info!("Stream ended without a done record");
    handler.on_done().await;
    Ok(StreamOutcome::Completed)
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

fn finish_outcome(cancel: &CancellationToken) -> StreamOutcome {
    if cancel.is_cancelled() {
        StreamOutcome::Cancelled
    } else {
        StreamOutcome::Completed
    }
}

// error, then delta, then done: a record carrying both a delta and done has
// its delta applied before completing
async fn dispatch(
    record: &StreamRecord,
    cancel: &CancellationToken,
    handler: &mut dyn StreamHandler,
) -> Flow {
    if let Some(message) = record.error.as_deref().filter(|m| !m.is_empty()) {
        if cancel.is_cancelled() {
            return Flow::Stop;
        }
        log::warn!("Backend reported a stream error: {}", message);
        handler.on_error(message).await;
    }
    if let Some(delta) = record.delta.as_deref().filter(|d| !d.is_empty()) {
        if cancel.is_cancelled() {
            return Flow::Stop;
        }
        handler.on_delta(delta).await;
    }
    if record.is_done() {
        if cancel.is_cancelled() {
            return Flow::Stop;
        }
        log::info!("Stream finished with done record");
        handler.on_done().await;
        return Flow::Stop;
    }
    if cancel.is_cancelled() {
        Flow::Stop
    } else {
        Flow::Continue
    }
}
