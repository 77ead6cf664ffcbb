//! Incremental Server-Sent-Events decoder for OpenAI-compatible streams.
//!
//! The decoder reconstructs token events from an arbitrarily-chunked byte
//! stream. It has no knowledge of HTTP or scheduling; callers feed it text
//! fragments and collect the events it yields.

use serde::Serialize;
use serde_json::Value;
use std::time::Instant;
use tracing::debug;

/// A single content delta extracted from the stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TokenEvent {
    /// Non-empty incremental content
    pub content: String,
    /// 1-based, strictly increasing per stream
    pub sequence_index: u32,
    /// Milliseconds since the decoder's reference clock
    pub emitted_at_ms: u64,
}

/// Final (or in-flight) metrics for one decoded stream.
///
/// `ttfb_ms` is set on the first non-empty chunk regardless of whether that
/// chunk yields a token: it measures transport latency, not generation
/// latency.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StreamMetrics {
    pub ttfb_ms: Option<u64>,
    pub first_token_ms: Option<u64>,
    pub last_token_ms: Option<u64>,
    pub token_count: u32,
    /// Total tokens as reported by a `usage` payload, when present
    pub total_tokens: u64,
    pub total_time_ms: u64,
    /// token_count / total seconds, rounded to 2 decimal places
    pub tokens_per_second: f64,
    /// Mean gap between consecutive tokens, 0 unless token_count > 1
    pub average_token_interval_ms: f64,
    /// Every decoded JSON payload, in arrival order
    pub raw_events: Vec<Value>,
    /// In-stream `error` payloads (non-fatal)
    pub errors: Vec<String>,
}

/// Events the decoder yields from `feed`/`finish`.
#[derive(Debug, Clone, PartialEq)]
pub enum DecoderEvent {
    /// First non-empty byte chunk arrived
    Ttfb(u64),
    /// First non-empty content delta arrived
    FirstToken(u64),
    Token(TokenEvent),
    /// A `usage` block was reported by the provider
    Usage(Value),
    /// An in-stream `error` payload; the stream itself continues
    StreamError(Value),
    /// Terminal event carrying the final metrics
    Complete(StreamMetrics),
}

/// One SSE event under assembly, accumulated across non-blank lines.
#[derive(Debug, Default)]
struct SseEvent {
    data: Vec<String>,
    event: Option<String>,
    id: Option<String>,
    retry: Option<u64>,
}

impl SseEvent {
    fn is_empty(&self) -> bool {
        self.data.is_empty() && self.event.is_none() && self.id.is_none() && self.retry.is_none()
    }
}

/// Incremental SSE decoder.
///
/// `feed` may be called with arbitrarily-sized, arbitrarily-split fragments;
/// fragment boundaries never have to align with line or event boundaries.
pub struct StreamDecoder {
    buffer: String,
    pending: SseEvent,
    metrics: StreamMetrics,
    started_at: Instant,
    completed: bool,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self {
            buffer: String::new(),
            pending: SseEvent::default(),
            metrics: StreamMetrics::default(),
            started_at: Instant::now(),
            completed: false,
        }
    }

    /// Reset all state and record a fresh reference clock.
    pub fn start(&mut self) {
        self.buffer.clear();
        self.pending = SseEvent::default();
        self.metrics = StreamMetrics::default();
        self.started_at = Instant::now();
        self.completed = false;
    }

    /// Whether the `[DONE]` sentinel (or `finish`) has been seen.
    pub fn is_done(&self) -> bool {
        self.completed
    }

    /// Snapshot of the metrics accumulated so far.
    pub fn metrics(&self) -> &StreamMetrics {
        &self.metrics
    }

    fn elapsed_ms(&self) -> u64 {
        self.started_at.elapsed().as_millis() as u64
    }

    /// Feed one text fragment; returns every event it completed.
    pub fn feed(&mut self, chunk: &str) -> Vec<DecoderEvent> {
        if self.completed {
            return Vec::new();
        }

        self.buffer.push_str(chunk);

        let mut out = Vec::new();
        if self.metrics.ttfb_ms.is_none() && !self.buffer.is_empty() {
            let ttfb = self.elapsed_ms();
            self.metrics.ttfb_ms = Some(ttfb);
            out.push(DecoderEvent::Ttfb(ttfb));
        }

        // Only fully newline-terminated lines are parsed; a trailing partial
        // segment goes back into the buffer for the next feed call.
        let lines: Vec<String> = if self.buffer.ends_with('\n') {
            let lines = self.buffer.lines().map(str::to_owned).collect();
            self.buffer.clear();
            lines
        } else {
            let mut lines: Vec<String> = self.buffer.split('\n').map(str::to_owned).collect();
            self.buffer = lines.pop().unwrap_or_default();
            lines
        };

        for line in lines {
            self.process_line(&line, &mut out);
            if self.completed {
                break;
            }
        }

        out
    }

    /// End the stream and compute the final metrics. Idempotent.
    pub fn finish(&mut self) -> (StreamMetrics, Vec<DecoderEvent>) {
        let mut out = Vec::new();
        if !self.completed {
            // Flush an event left without its terminating blank line
            self.dispatch_pending(&mut out);
            self.complete(&mut out);
        }
        (self.metrics.clone(), out)
    }

    fn process_line(&mut self, line: &str, out: &mut Vec<DecoderEvent>) {
        let trimmed = line.trim();

        // Blank line ends the current event
        if trimmed.is_empty() {
            self.dispatch_pending(out);
            return;
        }

        if let Some(value) = field_value(trimmed, "data:") {
            if value.trim() == "[DONE]" {
                // Terminal sentinel ends the stream immediately, even with a
                // dangling partial line still buffered
                self.dispatch_pending(out);
                self.complete(out);
                return;
            }
            self.pending.data.push(value.to_string());
        } else if let Some(value) = field_value(trimmed, "event:") {
            self.pending.event = Some(value.to_string());
        } else if let Some(value) = field_value(trimmed, "id:") {
            self.pending.id = Some(value.to_string());
        } else if let Some(value) = field_value(trimmed, "retry:") {
            self.pending.retry = value.trim().parse().ok();
        }
        // Comment lines (leading ':') and unknown fields are ignored
    }

    fn dispatch_pending(&mut self, out: &mut Vec<DecoderEvent>) {
        if self.pending.is_empty() {
            return;
        }
        let event = std::mem::take(&mut self.pending);
        if event.data.is_empty() {
            return;
        }

        // Multiple data: lines join per SSE semantics
        let payload = event.data.join("\n");
        if payload.trim().is_empty() {
            return;
        }

        let json: Value = match serde_json::from_str(&payload) {
            Ok(json) => json,
            Err(err) => {
                // Providers may truncate a field (content_filter_results and
                // the like) at a chunk boundary; skip this event only, the
                // rest of the stream is still usable.
                debug!(
                    "skipping undecodable SSE event: {} - {}",
                    err,
                    payload.chars().take(100).collect::<String>()
                );
                return;
            }
        };

        self.process_payload(json, out);
    }

    fn process_payload(&mut self, json: Value, out: &mut Vec<DecoderEvent>) {
        let now = self.elapsed_ms();

        // choices[0].delta.content when choices is a non-empty array, else a
        // top-level content field. An empty choices array (seen on the first
        // chunk of some reasoning backends) means "no content yet".
        let content = match json.get("choices").and_then(Value::as_array) {
            Some(choices) if !choices.is_empty() => choices[0]
                .get("delta")
                .and_then(|d| d.get("content"))
                .and_then(Value::as_str),
            Some(_) => None,
            None => json.get("content").and_then(Value::as_str),
        };

        // Empty-string content is a received keep-alive, not a token
        if let Some(text) = content {
            if !text.is_empty() {
                self.metrics.token_count += 1;
                if self.metrics.first_token_ms.is_none() {
                    self.metrics.first_token_ms = Some(now);
                    out.push(DecoderEvent::FirstToken(now));
                }
                self.metrics.last_token_ms = Some(now);
                out.push(DecoderEvent::Token(TokenEvent {
                    content: text.to_string(),
                    sequence_index: self.metrics.token_count,
                    emitted_at_ms: now,
                }));
            }
        }

        if let Some(usage) = json.get("usage") {
            if !usage.is_null() {
                self.metrics.total_tokens = usage
                    .get("total_tokens")
                    .and_then(Value::as_u64)
                    .unwrap_or(0);
                out.push(DecoderEvent::Usage(usage.clone()));
            }
        }

        if let Some(error) = json.get("error") {
            self.metrics.errors.push(error.to_string());
            out.push(DecoderEvent::StreamError(error.clone()));
        }

        self.metrics.raw_events.push(json);
    }

    fn complete(&mut self, out: &mut Vec<DecoderEvent>) {
        if self.completed {
            return;
        }
        self.completed = true;

        let total = self.elapsed_ms();
        self.metrics.total_time_ms = total;
        self.metrics.tokens_per_second = if self.metrics.token_count > 0 && total > 0 {
            round2(self.metrics.token_count as f64 / (total as f64 / 1000.0))
        } else {
            0.0
        };
        self.metrics.average_token_interval_ms = match (
            self.metrics.first_token_ms,
            self.metrics.last_token_ms,
            self.metrics.token_count,
        ) {
            (Some(first), Some(last), count) if count > 1 => {
                (last - first) as f64 / (count - 1) as f64
            }
            _ => 0.0,
        };

        out.push(DecoderEvent::Complete(self.metrics.clone()));
    }
}

impl Default for StreamDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Reassembles UTF-8 text from byte chunks whose boundaries may fall inside
/// a multi-byte sequence.
///
/// Network chunking is byte-oriented; a character split across two chunks
/// must not turn into replacement characters. Trailing incomplete bytes are
/// held back until the next chunk completes them.
#[derive(Debug, Default)]
pub struct Utf8ChunkBuffer {
    pending: Vec<u8>,
}

impl Utf8ChunkBuffer {
    /// Append a byte chunk and return every character completed so far.
    /// Genuinely invalid bytes become U+FFFD; an incomplete trailing
    /// sequence is buffered instead.
    pub fn push(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    break;
                }
                Err(err) => {
                    let valid = err.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match err.error_len() {
                        Some(bad) => {
                            out.push('\u{FFFD}');
                            self.pending.drain(..valid + bad);
                        }
                        None => {
                            // Possibly the prefix of a multi-byte character,
                            // wait for the rest
                            self.pending.drain(..valid);
                            break;
                        }
                    }
                }
            }
        }
        out
    }

    /// Drain whatever is buffered at end of stream; a dangling incomplete
    /// sequence becomes U+FFFD.
    pub fn finish(&mut self) -> String {
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        text
    }
}

/// Strip an SSE field prefix and the single optional leading space.
fn field_value<'a>(line: &'a str, prefix: &str) -> Option<&'a str> {
    let rest = line.strip_prefix(prefix)?;
    Some(rest.strip_prefix(' ').unwrap_or(rest))
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn tokens(events: &[DecoderEvent]) -> Vec<String> {
        events
            .iter()
            .filter_map(|e| match e {
                DecoderEvent::Token(t) => Some(t.content.clone()),
                _ => None,
            })
            .collect()
    }

    fn delta(content: &str) -> String {
        format!(
            "data: {{\"choices\":[{{\"delta\":{{\"content\":\"{}\"}}}}]}}\n\n",
            content
        )
    }

    #[test]
    fn test_basic_stream() {
        let mut decoder = StreamDecoder::new();
        let events = decoder.feed(&format!("{}{}data: [DONE]\n\n", delta("Hello"), delta(" world")));

        assert_eq!(tokens(&events), vec!["Hello", " world"]);
        assert!(decoder.is_done());
        let (metrics, _) = decoder.finish();
        assert_eq!(metrics.token_count, 2);
        assert_eq!(metrics.raw_events.len(), 2);
    }

    #[test]
    fn test_split_mid_json() {
        let mut decoder = StreamDecoder::new();
        let full = delta("Hello");
        let (a, b) = full.split_at(20);

        let events = decoder.feed(a);
        assert!(tokens(&events).is_empty());
        let events = decoder.feed(b);
        assert_eq!(tokens(&events), vec!["Hello"]);
    }

    #[test]
    fn test_done_with_dangling_partial_line() {
        let mut decoder = StreamDecoder::new();
        decoder.feed(&delta("hi"));
        // Leave a dangling partial line in the buffer
        let events = decoder.feed("data: {\"cho");
        assert!(tokens(&events).is_empty());
        let events = decoder.feed("\ndata: [DONE]\n\n");
        assert!(decoder.is_done());
        assert!(events
            .iter()
            .any(|e| matches!(e, DecoderEvent::Complete(_))));
        assert_eq!(decoder.metrics().token_count, 1);
    }

    #[test]
    fn test_empty_content_is_received_not_counted() {
        let mut decoder = StreamDecoder::new();
        let events = decoder.feed(
            "data: {\"choices\":[{\"delta\":{\"content\":\"\"}}]}\n\ndata: [DONE]\n\n",
        );
        assert!(tokens(&events).is_empty());
        let metrics = decoder.metrics();
        assert_eq!(metrics.token_count, 0);
        assert!(metrics.first_token_ms.is_none());
        assert!(metrics.last_token_ms.is_none());
        // Still a received event
        assert_eq!(metrics.raw_events.len(), 1);
    }

    #[test]
    fn test_empty_choices_array_is_not_an_error() {
        let mut decoder = StreamDecoder::new();
        let events = decoder.feed("data: {\"choices\":[]}\n\n");
        assert!(tokens(&events).is_empty());
        assert!(!events
            .iter()
            .any(|e| matches!(e, DecoderEvent::StreamError(_))));
        assert_eq!(decoder.metrics().raw_events.len(), 1);
    }

    #[test]
    fn test_top_level_content_fallback() {
        let mut decoder = StreamDecoder::new();
        let events = decoder.feed("data: {\"content\":\"plain\"}\n\n");
        assert_eq!(tokens(&events), vec!["plain"]);
    }

    #[test]
    fn test_utf8_buffer_joins_split_characters() {
        // "笑" encodes to three bytes; split them across pushes
        let bytes = "笑".as_bytes();
        let mut buffer = Utf8ChunkBuffer::default();
        assert_eq!(buffer.push(&bytes[..1]), "");
        assert_eq!(buffer.push(&bytes[1..]), "笑");
        assert_eq!(buffer.finish(), "");
    }

    #[test]
    fn test_utf8_buffer_replaces_invalid_bytes() {
        let mut buffer = Utf8ChunkBuffer::default();
        assert_eq!(buffer.push(&[b'a', 0xFF, b'b']), "a\u{FFFD}b");
        // An incomplete sequence at end of stream is replaced, not dropped
        assert_eq!(buffer.push(&"笑".as_bytes()[..2]), "");
        assert_eq!(buffer.finish(), "\u{FFFD}");
    }

    #[test]
    fn test_long_undecodable_payload_is_skipped_without_panic() {
        // Force the skip log to actually render its truncated payload
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .try_init();

        // Not valid JSON, longer than the log preview, and with multi-byte
        // characters straddling the preview cutoff
        let garbage: String = std::iter::repeat('个').take(60).collect();
        let mut decoder = StreamDecoder::new();
        let events = decoder.feed(&format!("data: {{\"{}\n\n", garbage));
        assert!(tokens(&events).is_empty());
        let events = decoder.feed(&delta("ok"));
        assert_eq!(tokens(&events), vec!["ok"]);
    }

    #[test]
    fn test_malformed_event_is_skipped() {
        let mut decoder = StreamDecoder::new();
        let events = decoder.feed("data: {\"choices\":[{\"delta\":{\"conte\n\n");
        assert!(tokens(&events).is_empty());
        // The stream continues normally afterwards
        let events = decoder.feed(&delta("ok"));
        assert_eq!(tokens(&events), vec!["ok"]);
    }

    #[test]
    fn test_multiple_data_lines_join() {
        let mut decoder = StreamDecoder::new();
        // Two data: lines in one event join with a newline, which is valid
        // JSON whitespace here
        let events =
            decoder.feed("data: {\"choices\":[{\"delta\":\ndata: {\"content\":\"x\"}}]}\n\n");
        assert_eq!(tokens(&events), vec!["x"]);
    }

    #[test]
    fn test_usage_and_error_payloads() {
        let mut decoder = StreamDecoder::new();
        let events = decoder.feed(
            "data: {\"usage\":{\"total_tokens\":42}}\n\ndata: {\"error\":{\"message\":\"oops\"}}\n\n",
        );
        assert!(events.iter().any(|e| matches!(e, DecoderEvent::Usage(_))));
        assert!(events
            .iter()
            .any(|e| matches!(e, DecoderEvent::StreamError(_))));
        assert_eq!(decoder.metrics().total_tokens, 42);
        assert_eq!(decoder.metrics().errors.len(), 1);
        // In-stream errors are non-fatal
        assert!(!decoder.is_done());
    }

    #[test]
    fn test_ttfb_set_without_any_token() {
        let mut decoder = StreamDecoder::new();
        let events = decoder.feed(": keep-alive comment\n");
        assert!(events.iter().any(|e| matches!(e, DecoderEvent::Ttfb(_))));
        assert!(decoder.metrics().ttfb_ms.is_some());
        assert_eq!(decoder.metrics().token_count, 0);
    }

    #[test]
    fn test_sequence_index_strictly_increasing() {
        let mut decoder = StreamDecoder::new();
        let body: String = (0..5).map(|i| delta(&format!("t{}", i))).collect();
        let events = decoder.feed(&body);
        let indexes: Vec<u32> = events
            .iter()
            .filter_map(|e| match e {
                DecoderEvent::Token(t) => Some(t.sequence_index),
                _ => None,
            })
            .collect();
        assert_eq!(indexes, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_timing_invariants() {
        let mut decoder = StreamDecoder::new();
        decoder.feed(&delta("a"));
        decoder.feed(&delta("b"));
        let (metrics, _) = decoder.finish();

        let first = metrics.first_token_ms.unwrap();
        let last = metrics.last_token_ms.unwrap();
        assert!(metrics.ttfb_ms.unwrap() <= first);
        assert!(first <= last);
        assert!(last <= metrics.total_time_ms);
    }

    #[test]
    fn test_finish_flushes_event_without_trailing_blank_line() {
        let mut decoder = StreamDecoder::new();
        decoder.feed(&format!("{}\n", delta("tail").trim_end()));
        let (metrics, _) = decoder.finish();
        assert_eq!(metrics.token_count, 1);
    }

    #[test]
    fn test_finish_is_idempotent() {
        let mut decoder = StreamDecoder::new();
        decoder.feed(&delta("x"));
        let (first, events) = decoder.finish();
        assert!(events
            .iter()
            .any(|e| matches!(e, DecoderEvent::Complete(_))));
        let (second, events) = decoder.finish();
        assert!(events.is_empty());
        assert_eq!(first.token_count, second.token_count);
        assert_eq!(first.total_time_ms, second.total_time_ms);
    }

    #[test]
    fn test_feed_after_done_is_ignored() {
        let mut decoder = StreamDecoder::new();
        decoder.feed("data: [DONE]\n\n");
        let events = decoder.feed(&delta("late"));
        assert!(events.is_empty());
        assert_eq!(decoder.metrics().token_count, 0);
    }

    #[test]
    fn test_start_resets_state() {
        let mut decoder = StreamDecoder::new();
        decoder.feed(&delta("one"));
        decoder.start();
        assert_eq!(decoder.metrics().token_count, 0);
        assert!(decoder.metrics().ttfb_ms.is_none());
        let events = decoder.feed(&delta("two"));
        assert_eq!(tokens(&events), vec!["two"]);
    }

    proptest! {
        /// Decoded tokens are identical for every chunking of the same byte
        /// stream, including splits mid-line and mid-JSON.
        #[test]
        fn prop_chunk_split_invariance(splits in proptest::collection::vec(0usize..200, 0..8)) {
            let body = format!(
                "{}{}{}data: {{\"choices\":[]}}\n\n{}data: [DONE]\n\n",
                delta("Hello"),
                delta(", "),
                delta("world"),
                delta("!"),
            );

            let mut reference = StreamDecoder::new();
            let expected = tokens(&reference.feed(&body));
            let expected_count = reference.metrics().token_count;

            let mut offsets: Vec<usize> = splits
                .into_iter()
                .map(|s| s % (body.len() + 1))
                .filter(|off| body.is_char_boundary(*off))
                .collect();
            offsets.sort_unstable();
            offsets.dedup();

            let mut decoder = StreamDecoder::new();
            let mut got = Vec::new();
            let mut prev = 0;
            for off in offsets {
                got.extend(tokens(&decoder.feed(&body[prev..off])));
                prev = off;
            }
            got.extend(tokens(&decoder.feed(&body[prev..])));

            prop_assert_eq!(got, expected);
            prop_assert_eq!(decoder.metrics().token_count, expected_count);
        }

        /// With a `Utf8ChunkBuffer` in front, decoded tokens are identical
        /// for every BYTE-level chunking, including splits inside a
        /// multi-byte character.
        #[test]
        fn prop_byte_split_invariance(splits in proptest::collection::vec(0usize..300, 0..8)) {
            let body = format!(
                "{}{}data: [DONE]\n\n",
                delta("冷笑话"),
                delta("十个字"),
            );
            let bytes = body.as_bytes();

            let mut reference = StreamDecoder::new();
            let expected = tokens(&reference.feed(&body));

            let mut offsets: Vec<usize> = splits
                .into_iter()
                .map(|s| s % (bytes.len() + 1))
                .collect();
            offsets.sort_unstable();
            offsets.dedup();

            let mut buffer = Utf8ChunkBuffer::default();
            let mut decoder = StreamDecoder::new();
            let mut got = Vec::new();
            let mut prev = 0;
            for off in offsets {
                got.extend(tokens(&decoder.feed(&buffer.push(&bytes[prev..off]))));
                prev = off;
            }
            got.extend(tokens(&decoder.feed(&buffer.push(&bytes[prev..]))));
            got.extend(tokens(&decoder.feed(&buffer.finish())));

            prop_assert_eq!(got, expected);
        }
    }
}
