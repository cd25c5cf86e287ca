//! Incremental parser for the upstream wire format.
//!
//! The browser agent relays the UI's private stream verbatim: records of the
//! form `<tag>:<json>` where the payload is a JSON-escaped string for text
//! deltas or a JSON object/array for attachments and end-of-stream markers.
//! Records can arrive split across fragments, so the parser keeps a rolling
//! buffer and only drains fully terminated records.

use serde_json::Value;

/// One parsed upstream record.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamRecord {
    /// `a0:` / `b0:` assistant text delta.
    Text(String),
    /// `ag:` reasoning delta.
    Reasoning(String),
    /// `a2:` / `b2:` image attachment descriptors.
    Images(Vec<ImageRef>),
    /// `ad:` / `bd:` end-of-stream marker.
    Finish { reason: String },
    /// An inline `{"error": ...}` object embedded in the raw stream.
    ErrorDescriptor(Value),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImageRef {
    pub url: String,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Tag {
    Text,
    Reasoning,
    Image,
    Finish,
}

const TAGS: [(&str, Tag); 7] = [
    ("a0:", Tag::Text),
    ("b0:", Tag::Text),
    ("ag:", Tag::Reasoning),
    ("a2:", Tag::Image),
    ("b2:", Tag::Image),
    ("ad:", Tag::Finish),
    ("bd:", Tag::Finish),
];

const INTERSTITIAL_SIGNATURES: [&str; 2] = [
    "<title>just a moment...</title>",
    "enable javascript and cookies to continue",
];

#[derive(Debug, Default)]
pub struct RecordParser {
    buf: String,
}

impl RecordParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, fragment: &str) {
        self.buf.push_str(fragment);
    }

    /// Whether the raw buffer carries a known verification-page signature.
    pub fn detect_interstitial(&self) -> bool {
        contains_interstitial(&self.buf)
    }

    /// Extract every fully terminated record, retaining the remainder.
    pub fn drain(&mut self) -> Vec<UpstreamRecord> {
        let mut records = Vec::new();

        if let Some(record) = self.take_error_descriptor() {
            records.push(record);
            return records;
        }

        loop {
            let Some((pos, tag)) = earliest_tag(&self.buf) else {
                break;
            };
            let payload_start = pos + 3;
            match parse_one_value(&self.buf[payload_start..]) {
                ParseOutcome::Complete { value, consumed } => {
                    if let Some(record) = build_record(tag, value) {
                        records.push(record);
                    }
                    self.buf.drain(..payload_start + consumed);
                }
                ParseOutcome::Incomplete => {
                    // Drop anything before the partial record, keep the rest.
                    self.buf.drain(..pos);
                    break;
                }
                ParseOutcome::Malformed(err) => {
                    tracing::warn!(error = %err, "skipping malformed upstream record");
                    self.buf.drain(..payload_start);
                }
            }
        }
        records
    }

    fn take_error_descriptor(&mut self) -> Option<UpstreamRecord> {
        let pos = self
            .buf
            .find("{\"error\"")
            .or_else(|| self.buf.find("{ \"error\""))?;
        match parse_one_value(&self.buf[pos..]) {
            ParseOutcome::Complete { value, consumed } if value.is_object() => {
                self.buf.drain(..pos + consumed);
                Some(UpstreamRecord::ErrorDescriptor(value))
            }
            _ => None,
        }
    }
}

pub fn contains_interstitial(raw: &str) -> bool {
    let lowered = raw.to_lowercase();
    INTERSTITIAL_SIGNATURES
        .iter()
        .any(|signature| lowered.contains(signature))
}

fn earliest_tag(buf: &str) -> Option<(usize, Tag)> {
    TAGS.iter()
        .filter_map(|(prefix, tag)| buf.find(prefix).map(|pos| (pos, *tag)))
        .min_by_key(|(pos, _)| *pos)
}

enum ParseOutcome {
    Complete { value: Value, consumed: usize },
    Incomplete,
    Malformed(serde_json::Error),
}

/// Parse exactly one JSON value off the front of `raw`, reporting how many
/// bytes it spanned.
fn parse_one_value(raw: &str) -> ParseOutcome {
    let mut iter = serde_json::Deserializer::from_str(raw).into_iter::<Value>();
    match iter.next() {
        Some(Ok(value)) => ParseOutcome::Complete {
            value,
            consumed: iter.byte_offset(),
        },
        Some(Err(err)) if err.is_eof() => ParseOutcome::Incomplete,
        Some(Err(err)) => ParseOutcome::Malformed(err),
        None => ParseOutcome::Incomplete,
    }
}

fn build_record(tag: Tag, value: Value) -> Option<UpstreamRecord> {
    match tag {
        Tag::Text => match value {
            Value::String(text) if !text.is_empty() => Some(UpstreamRecord::Text(text)),
            Value::String(_) => None,
            other => {
                tracing::warn!(payload = %other, "text record carried a non-string payload");
                None
            }
        },
        Tag::Reasoning => match value {
            Value::String(text) if !text.is_empty() => Some(UpstreamRecord::Reasoning(text)),
            _ => None,
        },
        Tag::Image => {
            let Value::Array(entries) = value else {
                return None;
            };
            let refs: Vec<ImageRef> = entries
                .into_iter()
                .filter_map(|entry| {
                    let object = entry.as_object()?;
                    if object.get("type").and_then(Value::as_str) != Some("image") {
                        return None;
                    }
                    let url = object.get("image").and_then(Value::as_str)?;
                    Some(ImageRef {
                        url: url.to_string(),
                    })
                })
                .collect();
            (!refs.is_empty()).then_some(UpstreamRecord::Images(refs))
        }
        Tag::Finish => {
            let reason = value
                .get("finishReason")
                .and_then(Value::as_str)
                .unwrap_or("stop")
                .to_string();
            Some(UpstreamRecord::Finish { reason })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_text_records() {
        let mut parser = RecordParser::new();
        parser.append("a0:\"Hel\"a0:\"lo\"");
        assert_eq!(
            parser.drain(),
            vec![
                UpstreamRecord::Text("Hel".into()),
                UpstreamRecord::Text("lo".into())
            ]
        );
    }

    #[test]
    fn records_split_across_fragments_are_buffered() {
        let mut parser = RecordParser::new();
        parser.append("a0:\"Hel");
        assert!(parser.drain().is_empty());
        parser.append("lo\"");
        assert_eq!(parser.drain(), vec![UpstreamRecord::Text("Hello".into())]);
    }

    #[test]
    fn escapes_are_decoded() {
        let mut parser = RecordParser::new();
        parser.append(r#"a0:"line\none \"two\"""#);
        assert_eq!(
            parser.drain(),
            vec![UpstreamRecord::Text("line\none \"two\"".into())]
        );
    }

    #[test]
    fn escape_round_trip_matches_the_source_record() {
        let payload = r#""tab\tand \"quotes\" and \\ backslash""#;
        let mut parser = RecordParser::new();
        parser.append(&format!("a0:{payload}"));
        let records = parser.drain();
        let UpstreamRecord::Text(text) = &records[0] else {
            panic!("expected a text record");
        };
        assert_eq!(serde_json::to_string(text).unwrap(), payload);
    }

    #[test]
    fn reasoning_and_text_interleave_in_order() {
        let mut parser = RecordParser::new();
        parser.append("ag:\"Think\"ag:\"ing\"a0:\"Answer\"ad:{}");
        assert_eq!(
            parser.drain(),
            vec![
                UpstreamRecord::Reasoning("Think".into()),
                UpstreamRecord::Reasoning("ing".into()),
                UpstreamRecord::Text("Answer".into()),
                UpstreamRecord::Finish {
                    reason: "stop".into()
                },
            ]
        );
    }

    #[test]
    fn b_prefixes_are_equivalent() {
        let mut parser = RecordParser::new();
        parser.append("b0:\"hi\"bd:{\"finishReason\":\"stop\"}");
        assert_eq!(
            parser.drain(),
            vec![
                UpstreamRecord::Text("hi".into()),
                UpstreamRecord::Finish {
                    reason: "stop".into()
                },
            ]
        );
    }

    #[test]
    fn image_records_extract_urls() {
        let mut parser = RecordParser::new();
        parser.append(r#"a2:[{"type":"image","image":"https://img.example/x.png"}]"#);
        assert_eq!(
            parser.drain(),
            vec![UpstreamRecord::Images(vec![ImageRef {
                url: "https://img.example/x.png".into()
            }])]
        );
    }

    #[test]
    fn finish_reason_is_extracted() {
        let mut parser = RecordParser::new();
        parser.append(r#"ad:{"finishReason":"content-filter"}"#);
        assert_eq!(
            parser.drain(),
            vec![UpstreamRecord::Finish {
                reason: "content-filter".into()
            }]
        );
    }

    #[test]
    fn unknown_tags_are_ignored() {
        let mut parser = RecordParser::new();
        parser.append("zz:\"noise\"a0:\"ok\"");
        assert_eq!(parser.drain(), vec![UpstreamRecord::Text("ok".into())]);
    }

    #[test]
    fn inline_error_objects_take_priority() {
        let mut parser = RecordParser::new();
        parser.append(r#"{"error": "rate limited"}"#);
        let records = parser.drain();
        assert!(matches!(records[0], UpstreamRecord::ErrorDescriptor(_)));
    }

    #[test]
    fn interstitial_signatures_are_detected() {
        let mut parser = RecordParser::new();
        parser.append("<html><title>Just a moment...</title></html>");
        assert!(parser.detect_interstitial());
        assert!(contains_interstitial(
            "please Enable JavaScript and cookies to continue"
        ));
        assert!(!contains_interstitial("a0:\"hello\""));
    }

    #[test]
    fn empty_deltas_are_dropped() {
        let mut parser = RecordParser::new();
        parser.append("a0:\"\"a0:\"x\"");
        assert_eq!(parser.drain(), vec![UpstreamRecord::Text("x".into())]);
    }
}
