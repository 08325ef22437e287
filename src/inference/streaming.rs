//! SSE streaming response parser.
//!
//! Reads an HTTP body as a byte stream, splits it on SSE event boundaries
//! (`data: …\n\n`) and yields each event's data payload. Provider modules map
//! the payloads to text deltas with [`text_deltas`].

use futures::stream::{self, Stream, StreamExt};

use super::errors::InferenceError;
use super::types::TextStream;

/// Terminal payload sent by OpenAI-compatible endpoints.
const DONE_MARKER: &str = "[DONE]";

// ─── SSE event splitter ──────────────────────────────────────────────────────

/// Split a byte stream into SSE data payloads.
///
/// Multi-line `data:` fields within one event are joined with `\n`. Events
/// without data (comments, keep-alives) are skipped and `[DONE]` ends the
/// stream. Bytes after the last blank line are flushed when the body ends.
///
/// Raw bytes are buffered and only complete events are decoded, so a
/// multi-byte character split across network chunks stays intact.
pub fn sse_data_events<S, B, E>(byte_stream: S) -> impl Stream<Item = Result<String, InferenceError>>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    stream::unfold(
        (byte_stream, Vec::<u8>::new(), false),
        |(mut byte_stream, mut buffer, done)| async move {
            if done {
                return None;
            }
            loop {
                // Complete event in the buffer?
                if let Some(event_end) = find_event_end(&buffer) {
                    let event = String::from_utf8_lossy(&buffer[..event_end]).into_owned();
                    buffer.drain(..event_end + 2);

                    match event_data(&event) {
                        Some(data) if data == DONE_MARKER => return None,
                        Some(data) => return Some((Ok(data), (byte_stream, buffer, false))),
                        None => continue,
                    }
                }

                match byte_stream.next().await {
                    Some(Ok(bytes)) => {
                        // CR never occurs inside a UTF-8 sequence.
                        buffer.extend(bytes.as_ref().iter().copied().filter(|b| *b != b'\r'));
                    }
                    Some(Err(e)) => {
                        return Some((
                            Err(InferenceError::StreamError {
                                reason: format!("stream read error: {e}"),
                            }),
                            (byte_stream, buffer, true),
                        ));
                    }
                    None => {
                        // Body ended: flush a trailing event without a blank line.
                        let rest = std::mem::take(&mut buffer);
                        let rest = String::from_utf8_lossy(&rest);
                        return match event_data(rest.trim()) {
                            Some(data) if data != DONE_MARKER => {
                                Some((Ok(data), (byte_stream, buffer, true)))
                            }
                            _ => None,
                        };
                    }
                }
            }
        },
    )
}

/// Offset of the blank line that ends the first buffered event.
fn find_event_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|pair| pair == b"\n\n")
}

/// Joined `data:` payload of one event, or `None` when it carries no data.
fn event_data(event: &str) -> Option<String> {
    let lines: Vec<&str> = event
        .lines()
        .filter_map(|line| {
            line.strip_prefix("data: ")
                .or_else(|| line.strip_prefix("data:"))
        })
        .collect();
    if lines.is_empty() {
        return None;
    }
    Some(lines.join("\n").trim().to_string())
}

// ─── Text deltas ─────────────────────────────────────────────────────────────

/// Turn an HTTP streaming response into a stream of text deltas.
///
/// `extract` maps one event payload to its text, `Ok(None)` for events that
/// carry none (role headers, finish markers). Empty deltas are dropped.
pub fn text_deltas<F>(response: reqwest::Response, extract: F) -> TextStream
where
    F: Fn(&str) -> Result<Option<String>, InferenceError> + Send + 'static,
{
    let events = sse_data_events(Box::pin(response.bytes_stream()));
    Box::pin(events.filter_map(move |event| {
        let item = match event {
            Ok(data) => match extract(&data) {
                Ok(Some(text)) if !text.is_empty() => Some(Ok(text)),
                Ok(_) => None,
                Err(e) => Some(Err(e)),
            },
            Err(e) => Some(Err(e)),
        };
        futures::future::ready(item)
    }))
}

// ─── Tests ───────────────────────────────────────────────────────────────────
