//! Incremental extraction of completed elements from a streaming JSON array.
//!
//! The model's response is one JSON document of the shape
//! `{"action_sequence": [ <action>, <action>, ... ]}`, delivered as text
//! fragments that are syntactically incomplete at every intermediate point.
//! [`PartialJsonTracker`] is a structural scanner (string/escape/depth
//! tracking) that yields each array element exactly once, in order, as soon
//! as that element's own JSON value is fully well-formed, without waiting
//! for the enclosing array or object to close.
//!
//! Code fences and any preamble before the `action_sequence` key are
//! skipped; everything after the array closes is ignored.

use crate::error::StreamError;

const SEQUENCE_KEY: &str = "\"action_sequence\"";

/// Per-response tracker. Feed fragments with [`push`](Self::push), then call
/// [`finish`](Self::finish) when the transport signals end-of-stream.
#[derive(Debug)]
pub struct PartialJsonTracker {
    buf: String,
    pos: usize,
    state: ScanState,
    yielded: usize,
}

#[derive(Debug)]
enum ScanState {
    /// Still looking for the `action_sequence` key.
    SeekingArray,
    /// Key seen; looking for the opening bracket.
    SeekingBracket,
    /// Inside the array, before the next element (or separator/close).
    BetweenElements,
    /// Mid-element.
    InElement(Element),
    /// Array closed; all further input is ignored.
    Closed,
}

#[derive(Debug)]
struct Element {
    start: usize,
    kind: ElementKind,
    depth: u32,
    in_string: bool,
    escape: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ElementKind {
    /// Object or array: complete when depth returns to zero.
    Container,
    /// String: complete at the closing quote.
    Str,
    /// Number / bool / null: complete at the next separator.
    Scalar,
}

impl Default for PartialJsonTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialJsonTracker {
    pub fn new() -> Self {
        Self {
            buf: String::new(),
            pos: 0,
            state: ScanState::SeekingArray,
            yielded: 0,
        }
    }

    /// Append one fragment and return every element newly completed by it,
    /// in array order. An element never appears twice across calls.
    pub fn push(&mut self, fragment: &str) -> Vec<serde_json::Value> {
        self.buf.push_str(fragment);
        let mut out = Vec::new();

        loop {
            match &mut self.state {
                ScanState::SeekingArray => {
                    match self.buf[self.pos..].find(SEQUENCE_KEY) {
                        Some(relative) => {
                            self.pos += relative + SEQUENCE_KEY.len();
                            self.state = ScanState::SeekingBracket;
                        }
                        None => {
                            // Resume the next search where a split key could
                            // start, so a long preamble is scanned once.
                            let mut floor =
                                self.buf.len().saturating_sub(SEQUENCE_KEY.len() - 1);
                            while !self.buf.is_char_boundary(floor) {
                                floor -= 1;
                            }
                            self.pos = self.pos.max(floor);
                            return out;
                        }
                    }
                }
                ScanState::SeekingBracket => {
                    let Some(byte) = self.buf.as_bytes().get(self.pos).copied() else {
                        return out;
                    };
                    self.pos += 1;
                    if byte == b'[' {
                        self.state = ScanState::BetweenElements;
                    }
                }
                ScanState::BetweenElements => {
                    let Some(byte) = self.buf.as_bytes().get(self.pos).copied() else {
                        return out;
                    };
                    match byte {
                        b' ' | b'\t' | b'\n' | b'\r' | b',' => self.pos += 1,
                        b']' => {
                            self.pos += 1;
                            self.state = ScanState::Closed;
                        }
                        b'{' | b'[' => {
                            self.state = ScanState::InElement(Element {
                                start: self.pos,
                                kind: ElementKind::Container,
                                depth: 1,
                                in_string: false,
                                escape: false,
                            });
                            self.pos += 1;
                        }
                        b'"' => {
                            self.state = ScanState::InElement(Element {
                                start: self.pos,
                                kind: ElementKind::Str,
                                depth: 0,
                                in_string: true,
                                escape: false,
                            });
                            self.pos += 1;
                        }
                        _ => {
                            self.state = ScanState::InElement(Element {
                                start: self.pos,
                                kind: ElementKind::Scalar,
                                depth: 0,
                                in_string: false,
                                escape: false,
                            });
                            self.pos += 1;
                        }
                    }
                }
                ScanState::InElement(element) => {
                    let Some(byte) = self.buf.as_bytes().get(self.pos).copied() else {
                        return out;
                    };
                    let mut completed: Option<usize> = None; // exclusive end

                    if element.in_string {
                        if element.escape {
                            element.escape = false;
                        } else if byte == b'\\' {
                            element.escape = true;
                        } else if byte == b'"' {
                            element.in_string = false;
                            if element.kind == ElementKind::Str {
                                completed = Some(self.pos + 1);
                            }
                        }
                        self.pos += 1;
                    } else {
                        match element.kind {
                            ElementKind::Container => {
                                match byte {
                                    b'"' => element.in_string = true,
                                    b'{' | b'[' => element.depth += 1,
                                    b'}' | b']' => {
                                        element.depth -= 1;
                                        if element.depth == 0 {
                                            completed = Some(self.pos + 1);
                                        }
                                    }
                                    _ => {}
                                }
                                self.pos += 1;
                            }
                            ElementKind::Scalar => match byte {
                                // Separator terminates the scalar without being
                                // consumed; BetweenElements handles it next.
                                b',' | b']' | b' ' | b'\t' | b'\n' | b'\r' => {
                                    completed = Some(self.pos);
                                }
                                _ => self.pos += 1,
                            },
                            // Str completion is handled in the in_string arm.
                            ElementKind::Str => self.pos += 1,
                        }
                    }

                    if let Some(end) = completed {
                        let start = element.start;
                        self.state = ScanState::BetweenElements;
                        self.emit(start, end, &mut out);
                    }
                }
                ScanState::Closed => return out,
            }
        }
    }

    fn emit(&mut self, start: usize, end: usize, out: &mut Vec<serde_json::Value>) {
        let raw = &self.buf[start..end];
        match serde_json::from_str(raw) {
            Ok(value) => {
                self.yielded += 1;
                out.push(value);
            }
            Err(error) => {
                // Structurally balanced but not valid JSON. Skip it; the
                // rest of the sequence must still go through.
                tracing::warn!(%error, index = self.yielded, "skipping malformed array element");
            }
        }
    }

    /// Number of elements yielded so far.
    pub fn elements_yielded(&self) -> usize {
        self.yielded
    }

    /// Whether the array has closed.
    pub fn is_closed(&self) -> bool {
        matches!(self.state, ScanState::Closed)
    }

    /// Signal end-of-stream. Returns an error if buffered input never became
    /// parseable: a truncated trailing element, or a response that never
    /// contained an `action_sequence` array at all.
    pub fn finish(self) -> Result<(), StreamError> {
        match self.state {
            ScanState::InElement(element) => Err(StreamError::Truncated {
                buffered: self.buf.len() - element.start,
            }),
            ScanState::SeekingArray => {
                let meaningful = self.buf.trim().len();
                if meaningful == 0 {
                    Ok(())
                } else {
                    Err(StreamError::Truncated {
                        buffered: meaningful,
                    })
                }
            }
            // The key arrived but its array never opened.
            ScanState::SeekingBracket => Err(StreamError::Truncated {
                buffered: self.buf.len().saturating_sub(self.pos),
            }),
            // An unclosed array after a complete element loses nothing.
            ScanState::BetweenElements | ScanState::Closed => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    const DOC: &str = indoc! {r#"
        {"action_sequence": [
            {"action_name": "wait", "seconds": 1},
            {"action_name": "send_message", "content": "brackets ]} in \"strings\" are fine"},
            {"action_name": "remember", "topic": "facts", "content": "深い nesting", "extra": {"a": [1, 2, {"b": "]"}]}},
            42,
            "bare string",
            null
        ]}
    "#};

    fn feed_all(tracker: &mut PartialJsonTracker, text: &str) -> Vec<serde_json::Value> {
        tracker.push(text)
    }

    #[test]
    fn whole_document_yields_all_elements_in_order() {
        let mut tracker = PartialJsonTracker::new();
        let elements = feed_all(&mut tracker, DOC);
        assert_eq!(elements.len(), 6);
        assert_eq!(elements[0]["action_name"], "wait");
        assert_eq!(elements[3], serde_json::json!(42));
        assert_eq!(elements[4], serde_json::json!("bare string"));
        assert_eq!(elements[5], serde_json::Value::Null);
        assert!(tracker.is_closed());
        tracker.finish().expect("complete document");
    }

    #[test]
    fn byte_at_a_time_matches_whole_document() {
        let mut whole = PartialJsonTracker::new();
        let expected = whole.push(DOC);

        let mut tracker = PartialJsonTracker::new();
        let mut collected = Vec::new();
        let mut buf = [0u8; 4];
        for ch in DOC.chars() {
            let fragment = ch.encode_utf8(&mut buf);
            collected.extend(tracker.push(fragment));
        }
        assert_eq!(collected, expected);
        assert_eq!(tracker.elements_yielded(), 6);
        tracker.finish().expect("complete document");
    }

    #[test]
    fn elements_yield_as_their_fragments_complete() {
        let mut tracker = PartialJsonTracker::new();

        let first = tracker.push(r#"{"action_s"#);
        assert!(first.is_empty());

        let second =
            tracker.push(r#"equence": [{"action_name": "wait", "seconds": 1}, {"act"#);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0]["action_name"], "wait");

        let third = tracker.push(r#"ion_name": "send_message", "content": "hi"}]}"#);
        assert_eq!(third.len(), 1);
        assert_eq!(third[0]["action_name"], "send_message");
        assert_eq!(third[0]["content"], "hi");

        assert!(tracker.is_closed());
    }

    #[test]
    fn element_completes_while_sibling_is_mid_token() {
        let mut tracker = PartialJsonTracker::new();
        let out = tracker.push(r#"{"action_sequence": [{"a": 1}, {"b": "unterminat"#);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0]["a"], 1);
        // Incomplete trailing element is lost at end-of-stream.
        assert!(matches!(
            tracker.finish(),
            Err(StreamError::Truncated { .. })
        ));
    }

    #[test]
    fn code_fences_and_preamble_are_skipped() {
        let mut tracker = PartialJsonTracker::new();
        let mut out = tracker.push("```json\n{\"action_sequence\": [{\"x\": 1}");
        out.extend(tracker.push("]}\n```"));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0]["x"], 1);
        assert!(tracker.is_closed());
        tracker.finish().expect("fenced document is complete");
    }

    #[test]
    fn long_preamble_in_small_fragments_still_finds_the_key() {
        let mut tracker = PartialJsonTracker::new();
        // Multibyte characters exercise the resume-offset boundary handling.
        for _ in 0..200 {
            assert!(tracker.push("préambule chatter… ").is_empty());
        }
        let mut out = tracker.push(r#"{"action_seq"#);
        assert!(out.is_empty());
        out.extend(tracker.push(r#"uence": [{"x": 1}]}"#));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0]["x"], 1);
        assert!(tracker.is_closed());
    }

    #[test]
    fn key_without_an_array_is_truncated_at_finish() {
        let mut tracker = PartialJsonTracker::new();
        assert!(tracker.push(r#"{"action_sequence": "#).is_empty());
        assert!(matches!(
            tracker.finish(),
            Err(StreamError::Truncated { .. })
        ));
    }

    #[test]
    fn input_after_close_is_ignored() {
        let mut tracker = PartialJsonTracker::new();
        let out = tracker.push(r#"{"action_sequence": [1]} trailing garbage"#);
        assert_eq!(out, vec![serde_json::json!(1)]);
        assert!(tracker.push("[2, 3]").is_empty());
        assert_eq!(tracker.elements_yielded(), 1);
    }

    #[test]
    fn empty_array_yields_nothing() {
        let mut tracker = PartialJsonTracker::new();
        assert!(tracker.push(r#"{"action_sequence": []}"#).is_empty());
        assert!(tracker.is_closed());
        tracker.finish().expect("empty sequence is complete");
    }

    #[test]
    fn response_without_sequence_is_truncated_at_finish() {
        let mut tracker = PartialJsonTracker::new();
        assert!(tracker.push("sorry, I cannot do that").is_empty());
        assert!(matches!(
            tracker.finish(),
            Err(StreamError::Truncated { .. })
        ));
    }

    #[test]
    fn empty_stream_finishes_clean() {
        let tracker = PartialJsonTracker::new();
        tracker.finish().expect("nothing buffered, nothing lost");
    }

    #[test]
    fn malformed_element_is_skipped_not_fatal() {
        let mut tracker = PartialJsonTracker::new();
        // {unquoted: key} is balanced but not valid JSON.
        let out = tracker.push(r#"{"action_sequence": [{unquoted: 1}, {"ok": 2}]}"#);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0]["ok"], 2);
    }
}
