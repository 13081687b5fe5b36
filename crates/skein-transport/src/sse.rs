use std::collections::HashMap;

use serde::{Deserialize, Serialize};

pub const DEFAULT_FRAME_SEPARATOR: &str = "\n\n";
pub const DEFAULT_LINE_SEPARATOR: &str = "\n";
pub const DEFAULT_KV_SEPARATOR: &str = ":";

/// The separator set driving the text→frame→record stages. Swapping these
/// lets the same pipeline serve SSE and ad-hoc line-delimited wire formats.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSeparators {
    pub frame: String,
    pub line: String,
    pub kv: String,
}

impl Default for StreamSeparators {
    fn default() -> Self {
        Self {
            frame: DEFAULT_FRAME_SEPARATOR.to_string(),
            line: DEFAULT_LINE_SEPARATOR.to_string(),
            kv: DEFAULT_KV_SEPARATOR.to_string(),
        }
    }
}

/// One decoded frame as a key→value mapping. Keys are conventionally drawn
/// from `data`/`event`/`id`/`retry` though the parser accepts any key. A
/// record with zero keys is never produced.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StreamRecord(HashMap<String, String>);

impl StreamRecord {
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn data(&self) -> Option<&str> {
        self.get("data")
    }

    pub fn event(&self) -> Option<&str> {
        self.get("event")
    }

    pub fn id(&self) -> Option<&str> {
        self.get("id")
    }

    pub fn retry(&self) -> Option<&str> {
        self.get("retry")
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Call-site convention for end-of-content markers; not a pipeline construct.
pub fn is_done_signal(value: &str) -> bool {
    value.trim() == "[DONE]"
}

/// Stage 1: incremental byte→text decoding. A multi-byte scalar may split
/// across delivery chunks, so up to three trailing bytes are carried to the
/// next call instead of being replaced with U+FFFD.
pub struct Utf8Decoder {
    carry: Vec<u8>,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self { carry: Vec::new() }
    }

    pub fn decode(&mut self, bytes: &[u8]) -> String {
        let mut input = std::mem::take(&mut self.carry);
        input.extend_from_slice(bytes);

        let mut out = String::with_capacity(input.len());
        let mut rest = input.as_slice();
        loop {
            match std::str::from_utf8(rest) {
                Ok(text) => {
                    out.push_str(text);
                    return out;
                }
                Err(error) => {
                    let valid = error.valid_up_to();
                    out.push_str(
                        std::str::from_utf8(&rest[..valid]).expect("verified utf-8 prefix"),
                    );
                    match error.error_len() {
                        // Incomplete scalar at the end of the chunk.
                        None => {
                            self.carry = rest[valid..].to_vec();
                            return out;
                        }
                        Some(skip) => {
                            out.push('\u{FFFD}');
                            rest = &rest[valid + skip..];
                        }
                    }
                }
            }
        }
    }

    /// Flush on end-of-input: a dangling partial scalar becomes U+FFFD.
    pub fn finish(&mut self) -> String {
        let carry = std::mem::take(&mut self.carry);
        if carry.is_empty() {
            String::new()
        } else {
            String::from_utf8_lossy(&carry).into_owned()
        }
    }
}

impl Default for Utf8Decoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Stage 2: text→frame splitting with a carry buffer for the trailing,
/// possibly incomplete piece. Single-owner; never share one splitter
/// between two unrelated streams.
pub struct FrameSplitter {
    buffer: String,
    separator: String,
}

impl FrameSplitter {
    pub fn new(separator: impl Into<String>) -> Self {
        Self {
            buffer: String::new(),
            separator: separator.into(),
        }
    }

    pub fn feed(&mut self, text: &str) -> Vec<String> {
        self.buffer.push_str(text);
        let mut frames = Vec::new();
        while let Some(position) = self.buffer.find(&self.separator) {
            let frame: String = self.buffer.drain(..position + self.separator.len()).collect();
            let frame = &frame[..position];
            if !frame.trim().is_empty() {
                frames.push(frame.to_string());
            }
        }
        frames
    }

    /// Emit the remaining buffer on end-of-input, unless it is blank.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        if rest.trim().is_empty() {
            None
        } else {
            Some(rest)
        }
    }
}

/// Stage 3: one frame → one record. A line with no key/value separator is
/// dropped; a line whose key is empty is a comment and dropped; a value
/// loses one leading space; a repeated key keeps the last value. A frame
/// yielding zero pairs produces no record.
fn parse_frame(frame: &str, line_separator: &str, kv_separator: &str) -> Option<StreamRecord> {
    let mut record = StreamRecord::default();
    for line in frame.split(line_separator) {
        let line = line.strip_suffix('\r').unwrap_or(line);
        let Some(position) = line.find(kv_separator) else {
            continue;
        };
        let key = &line[..position];
        if key.is_empty() {
            continue;
        }
        let mut value = &line[position + kv_separator.len()..];
        if let Some(stripped) = value.strip_prefix(' ') {
            value = stripped;
        }
        record.insert(key, value);
    }
    if record.is_empty() {
        None
    } else {
        Some(record)
    }
}

/// A text→record transform driven chunk by chunk. The default SSE pipeline
/// implements this; callers may supply their own to bypass the key/value
/// stage entirely (e.g. line-delimited JSON).
pub trait StreamTransform: Send {
    fn push(&mut self, text: &str) -> Vec<StreamRecord>;
    fn finish(&mut self) -> Vec<StreamRecord>;
}

/// Stages 2+3 composed behind [`StreamTransform`].
pub struct SseTransform {
    splitter: FrameSplitter,
    line_separator: String,
    kv_separator: String,
}

impl SseTransform {
    pub fn new() -> Self {
        Self::with_separators(StreamSeparators::default())
    }

    pub fn with_separators(separators: StreamSeparators) -> Self {
        Self {
            splitter: FrameSplitter::new(separators.frame),
            line_separator: separators.line,
            kv_separator: separators.kv,
        }
    }
}

impl Default for SseTransform {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamTransform for SseTransform {
    fn push(&mut self, text: &str) -> Vec<StreamRecord> {
        self.splitter
            .feed(text)
            .iter()
            .filter_map(|frame| parse_frame(frame, &self.line_separator, &self.kv_separator))
            .collect()
    }

    fn finish(&mut self) -> Vec<StreamRecord> {
        self.splitter
            .finish()
            .and_then(|frame| parse_frame(&frame, &self.line_separator, &self.kv_separator))
            .into_iter()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_pipeline(chunks: &[&[u8]]) -> Vec<StreamRecord> {
        let mut decoder = Utf8Decoder::new();
        let mut transform = SseTransform::new();
        let mut records = Vec::new();
        for chunk in chunks {
            records.extend(transform.push(&decoder.decode(chunk)));
        }
        let tail = decoder.finish();
        if !tail.is_empty() {
            records.extend(transform.push(&tail));
        }
        records.extend(transform.finish());
        records
    }

    #[test]
    fn parses_basic_event_stream() {
        let records = run_pipeline(&[b"event: delta\ndata: hello\n\ndata: world\n\n"]);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].event(), Some("delta"));
        assert_eq!(records[0].data(), Some("hello"));
        assert_eq!(records[1].data(), Some("world"));
    }

    #[test]
    fn chunk_boundaries_do_not_change_output() {
        let wire = "event: delta\ndata: {\"text\":\"héllo\"}\n\nid: 7\ndata: done\n\n";
        let whole = run_pipeline(&[wire.as_bytes()]);

        let bytes = wire.as_bytes();
        for split in 1..bytes.len() {
            let parts = run_pipeline(&[&bytes[..split], &bytes[split..]]);
            assert_eq!(parts, whole, "split at byte {split} diverged");
        }
    }

    #[test]
    fn split_inside_multibyte_scalar_is_carried() {
        let mut decoder = Utf8Decoder::new();
        // "é" is 0xC3 0xA9.
        let first = decoder.decode(&[b'a', 0xC3]);
        let second = decoder.decode(&[0xA9, b'b']);
        assert_eq!(first, "a");
        assert_eq!(second, "éb");
        assert_eq!(decoder.finish(), "");
    }

    #[test]
    fn dangling_partial_scalar_flushes_as_replacement() {
        let mut decoder = Utf8Decoder::new();
        assert_eq!(decoder.decode(&[0xC3]), "");
        assert_eq!(decoder.finish(), "\u{FFFD}");
    }

    #[test]
    fn blank_frames_and_comment_lines_are_dropped() {
        let records = run_pipeline(&[b"\n\n   \n\n: heartbeat\n\nnonsense line\n\ndata: ok\n\n"]);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].data(), Some("ok"));
    }

    #[test]
    fn unterminated_trailing_frame_is_flushed_at_end_of_input() {
        let records = run_pipeline(&[b"data: first\n\ndata: last"]);
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].data(), Some("last"));
    }

    #[test]
    fn value_loses_exactly_one_leading_space() {
        let records = run_pipeline(&[b"data:  padded\n\n"]);
        assert_eq!(records[0].data(), Some(" padded"));
    }

    #[test]
    fn repeated_key_keeps_last_value() {
        let records = run_pipeline(&[b"data: one\ndata: two\n\n"]);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].data(), Some("two"));
    }

    #[test]
    fn custom_separators_only_change_what_is_split_on() {
        let mut transform = SseTransform::with_separators(StreamSeparators {
            frame: "||".to_string(),
            line: ";".to_string(),
            kv: "=".to_string(),
        });
        let mut records = transform.push("data=a;event=x||data=b|");
        records.extend(transform.push("|"));
        records.extend(transform.finish());
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].data(), Some("a"));
        assert_eq!(records[0].event(), Some("x"));
        assert_eq!(records[1].data(), Some("b"));
    }

    #[test]
    fn done_signal_tolerates_whitespace() {
        assert!(is_done_signal("[DONE]"));
        assert!(is_done_signal("  [DONE]\n"));
        assert!(!is_done_signal("[DONE"));
    }
}
