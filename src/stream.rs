//! Decoder for the backend's line-delimited completion stream.
//!
//! Lines may carry an SSE-style `data: ` prefix. Each payload is one JSON frame
//! in the layout selected by [`ResponseShape`]. Frames that fail to decode are
//! logged and skipped; they never abort the stream.

use futures::{Stream, StreamExt};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use crate::ai_sdk::{DeltaChoice, FrameChoice, ResponseShape, StreamChunk, TextChoice};
use crate::backend::DeltaSink;
use crate::error::BackendError;

const DATA_PREFIX: &[u8] = b"data: ";
const DONE_MARKER: &[u8] = b"[DONE]";
const STOP_REASON: &str = "stop";
/// Longest line kept while waiting for its newline. Longer lines are dropped.
const MAX_LINE_BYTES: usize = 1 << 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEvent {
    pub delta_text: String,
    pub is_final: bool,
}

/// How a decode session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// The backend sent a stop finish-reason (or `[DONE]`).
    Finished,
    /// The body ended without a finish signal.
    EndOfStream,
    /// The sink returned [`crate::error::Stop`].
    ConsumerStopped,
    /// The cancellation token fired.
    Cancelled,
}

#[derive(Debug, PartialEq, Eq)]
enum Frame {
    Event(StreamEvent),
    Done,
    Skip,
}

pub struct EventDecoder<S> {
    body: S,
    shape: ResponseShape,
    buffer: Vec<u8>,
    // Bytes of `buffer` already known to hold no newline.
    scanned: usize,
    // Inside an oversized line; everything up to the next newline is dropped.
    discarding: bool,
    exhausted: bool,
    finished: bool,
    saw_finish: bool,
}

impl<S, B, E> EventDecoder<S>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: Into<BackendError>,
{
    pub fn new(body: S, shape: ResponseShape) -> Self {
        Self {
            body,
            shape,
            buffer: Vec::new(),
            scanned: 0,
            discarding: false,
            exhausted: false,
            finished: false,
            saw_finish: false,
        }
    }

    /// Next non-empty delta. `None` once the stream has ended, for good.
    pub async fn next_event(&mut self) -> Option<Result<StreamEvent, BackendError>> {
        loop {
            if self.finished {
                return None;
            }

            if let Some(line) = self.take_line() {
                match parse_line(self.shape, &line) {
                    Frame::Skip => {}
                    Frame::Done => {
                        self.finish(true);
                    }
                    Frame::Event(event) => {
                        if event.is_final {
                            self.finish(true);
                        }
                        if !event.delta_text.is_empty() {
                            return Some(Ok(event));
                        }
                    }
                }
                continue;
            }

            if self.exhausted {
                self.finish(false);
                continue;
            }

            match self.body.next().await {
                Some(Ok(chunk)) => self.buffer.extend_from_slice(chunk.as_ref()),
                Some(Err(err)) => {
                    self.finish(false);
                    return Some(Err(err.into()));
                }
                None => self.exhausted = true,
            }
        }
    }

    /// Pushes every delta into `sink` until the stream ends, the sink stops, or
    /// `cancel` fires. Consumes the decoder so the body is released on return.
    pub async fn relay(
        mut self,
        sink: &mut dyn DeltaSink,
        cancel: &CancellationToken,
    ) -> Result<StreamEnd, BackendError> {
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(StreamEnd::Cancelled),
                next = self.next_event() => next,
            };

            let Some(event) = next else {
                return Ok(if self.saw_finish {
                    StreamEnd::Finished
                } else {
                    StreamEnd::EndOfStream
                });
            };
            let event = event?;

            tracing::trace!(delta = %event.delta_text, "relaying delta");
            if sink.push(&event.delta_text).await.is_err() {
                tracing::debug!("consumer stopped the stream");
                return Ok(StreamEnd::ConsumerStopped);
            }
            if event.is_final {
                return Ok(StreamEnd::Finished);
            }
        }
    }

    fn take_line(&mut self) -> Option<Vec<u8>> {
        while let Some(offset) = self.buffer[self.scanned..]
            .iter()
            .position(|byte| *byte == b'\n')
        {
            let end = self.scanned + offset;
            self.scanned = 0;
            let line: Vec<u8> = self.buffer.drain(..=end).collect();
            if !std::mem::take(&mut self.discarding) {
                return Some(line);
            }
        }
        self.scanned = self.buffer.len();

        if self.buffer.len() > MAX_LINE_BYTES {
            if !self.discarding {
                tracing::warn!(
                    bytes = self.buffer.len(),
                    limit = MAX_LINE_BYTES,
                    "dropping oversized stream line"
                );
            }
            self.discard_buffer();
            self.discarding = true;
            return None;
        }

        if self.exhausted && !self.buffer.is_empty() {
            self.scanned = 0;
            if std::mem::take(&mut self.discarding) {
                self.buffer.clear();
                return None;
            }
            return Some(std::mem::take(&mut self.buffer));
        }

        None
    }

    fn discard_buffer(&mut self) {
        self.buffer.clear();
        self.scanned = 0;
    }

    fn finish(&mut self, saw_finish: bool) {
        self.finished = true;
        self.saw_finish = saw_finish;
        self.discard_buffer();
    }
}

fn parse_line(shape: ResponseShape, line: &[u8]) -> Frame {
    let line = line.trim_ascii();
    if line.is_empty() {
        return Frame::Skip;
    }

    let payload = line.strip_prefix(DATA_PREFIX).unwrap_or(line).trim_ascii();
    if payload == DONE_MARKER {
        return Frame::Done;
    }

    let decoded = match shape {
        ResponseShape::ChatDelta => decode_frame::<DeltaChoice>(payload),
        ResponseShape::CompletionText => decode_frame::<TextChoice>(payload),
    };

    match decoded {
        Ok(Some(event)) => Frame::Event(event),
        Ok(None) => Frame::Skip,
        Err(err) => {
            tracing::warn!(
                error = %err,
                raw = %String::from_utf8_lossy(payload),
                "skipping malformed stream frame"
            );
            Frame::Skip
        }
    }
}

fn decode_frame<C>(payload: &[u8]) -> serde_json::Result<Option<StreamEvent>>
where
    C: FrameChoice + DeserializeOwned,
{
    let chunk: StreamChunk<C> = serde_json::from_slice(payload)?;
    Ok(chunk.choices.first().map(|choice| StreamEvent {
        delta_text: choice.text().to_string(),
        is_final: choice.finish_reason() == Some(STOP_REASON),
    }))
}
