//! Backend status labels and the line codec for the status stream.
//!
//! The stream is a text body of `data: {"state": "...", "time": "..."}`
//! frames separated by blank lines. Every non-blank line must carry the
//! `data:` prefix; the JSON after it is decoded into a [`StatusEvent`].

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::error::ReadinessError;

pub const DATA_PREFIX: &str = "data:";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum BackendState {
    Loading,
    Starting,
    Ready,
    /// Any other label. The backend cannot proceed to ready from it.
    Other(String),
}

impl BackendState {
    pub fn from_label(label: &str) -> Self {
        match label {
            "Loading" => BackendState::Loading,
            "Starting" => BackendState::Starting,
            "Ready" => BackendState::Ready,
            other => BackendState::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            BackendState::Loading => "Loading",
            BackendState::Starting => "Starting",
            BackendState::Ready => "Ready",
            BackendState::Other(label) => label,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, BackendState::Ready)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, BackendState::Other(_))
    }
}

impl From<String> for BackendState {
    fn from(value: String) -> Self {
        match value.as_str() {
            "Loading" | "Starting" | "Ready" => BackendState::from_label(&value),
            _ => BackendState::Other(value),
        }
    }
}

impl From<BackendState> for String {
    fn from(value: BackendState) -> Self {
        match value {
            BackendState::Other(label) => label,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for BackendState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub state: BackendState,
    /// Timestamp as the backend sent it; empty when absent.
    #[serde(default, deserialize_with = "time_label")]
    pub time: String,
}

/// Accept any JSON scalar for `time`; only `state` decides readiness.
fn time_label<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Null => String::new(),
        Value::String(text) => text,
        other => other.to_string(),
    })
}

/// A single stream line whose JSON could not be decoded. Not fatal.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("malformed status event {payload:?}: {reason}")]
pub struct PayloadParseError {
    pub payload: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedLine {
    Event(StatusEvent),
    Malformed(PayloadParseError),
}

/// Decode one line of the status stream.
///
/// Blank lines yield `Ok(None)`. A line without the `data:` prefix is a
/// protocol violation and ends the stream.
pub fn decode_line(line: &str) -> Result<Option<DecodedLine>, ReadinessError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let Some(rest) = line.strip_prefix(DATA_PREFIX) else {
        return Err(ReadinessError::ProtocolViolation(line.to_string()));
    };
    let payload = rest.trim();
    match serde_json::from_str::<StatusEvent>(payload) {
        Ok(event) => Ok(Some(DecodedLine::Event(event))),
        Err(err) => Ok(Some(DecodedLine::Malformed(PayloadParseError {
            payload: payload.to_string(),
            reason: err.to_string(),
        }))),
    }
}

/// Longest line the status stream may send before it is treated as broken.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// Reassembles newline-terminated lines from arbitrarily split chunks.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every line it completed.
    ///
    /// Fails once an unterminated line grows past [`MAX_LINE_BYTES`].
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<String>, ReadinessError> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|byte| *byte == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            lines.push(String::from_utf8_lossy(&raw[..pos]).into_owned());
        }
        if self.pending.len() > MAX_LINE_BYTES {
            let len = self.pending.len();
            self.pending.clear();
            return Err(ReadinessError::ProtocolViolation(format!(
                "status line exceeds {MAX_LINE_BYTES} bytes without a newline ({len} buffered)"
            )));
        }
        Ok(lines)
    }

    /// Flush an unterminated trailing line at end of stream.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let raw = std::mem::take(&mut self.pending);
        Some(String::from_utf8_lossy(&raw).into_owned())
    }
}

/// What the one-shot status request says about the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitialStatus {
    Ready,
    Pending,
    Terminal(String),
}

/// Classify the plain-text body of the status endpoint.
pub fn classify_status_body(body: &str) -> InitialStatus {
    if body.contains("Ready") {
        InitialStatus::Ready
    } else if body.contains("Loading") || body.contains("Starting") {
        InitialStatus::Pending
    } else {
        InitialStatus::Terminal(body.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_data_line_into_event() {
        let decoded = decode_line(r#"data: {"state": "Starting", "time": "t1"}"#)
            .unwrap()
            .unwrap();
        assert_eq!(
            decoded,
            DecodedLine::Event(StatusEvent {
                state: BackendState::Starting,
                time: "t1".into(),
            })
        );
    }

    #[test]
    fn blank_lines_are_skipped() {
        assert_eq!(decode_line("").unwrap(), None);
        assert_eq!(decode_line("   \r").unwrap(), None);
    }

    #[test]
    fn missing_prefix_is_protocol_violation() {
        let err = decode_line(r#"{"state":"Ready","time":"t"}"#).unwrap_err();
        assert!(matches!(err, ReadinessError::ProtocolViolation(_)));
        assert!(matches!(
            decode_line("event: status"),
            Err(ReadinessError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn bad_json_is_malformed_not_fatal() {
        let decoded = decode_line("data: {not json").unwrap().unwrap();
        match decoded {
            DecodedLine::Malformed(err) => assert_eq!(err.payload, "{not json"),
            other => panic!("expected malformed line, got {other:?}"),
        }
    }

    #[test]
    fn unknown_labels_are_terminal() {
        let decoded = decode_line(r#"data: {"state":"Crashed","time":"t9"}"#)
            .unwrap()
            .unwrap();
        let DecodedLine::Event(event) = decoded else {
            panic!("expected event");
        };
        assert_eq!(event.state, BackendState::Other("Crashed".into()));
        assert!(event.state.is_terminal());
        assert!(!BackendState::Loading.is_terminal());
        assert!(!BackendState::Ready.is_terminal());
    }

    #[test]
    fn line_buffer_reassembles_split_lines() {
        let mut buffer = LineBuffer::new();
        assert!(buffer.push(b"data: {\"state\":\"Rea").unwrap().is_empty());
        let lines = buffer.push(b"dy\",\"time\":\"t2\"}\n\ndata: x").unwrap();
        assert_eq!(
            lines,
            vec![r#"data: {"state":"Ready","time":"t2"}"#.to_string(), String::new()]
        );
        assert_eq!(buffer.finish().as_deref(), Some("data: x"));
        assert_eq!(buffer.finish(), None);
    }

    #[test]
    fn line_buffer_keeps_multibyte_characters_split_across_chunks() {
        let text = "data: é\n".as_bytes();
        let mut buffer = LineBuffer::new();
        assert!(buffer.push(&text[..7]).unwrap().is_empty());
        assert_eq!(buffer.push(&text[7..]).unwrap(), vec!["data: é".to_string()]);
    }

    #[test]
    fn time_may_be_numeric_or_missing() {
        let numeric = decode_line(r#"data: {"state":"Ready","time":1700000000}"#)
            .unwrap()
            .unwrap();
        assert_eq!(
            numeric,
            DecodedLine::Event(StatusEvent {
                state: BackendState::Ready,
                time: "1700000000".into(),
            })
        );
        let missing = decode_line(r#"data: {"state":"Ready"}"#).unwrap().unwrap();
        assert_eq!(
            missing,
            DecodedLine::Event(StatusEvent {
                state: BackendState::Ready,
                time: String::new(),
            })
        );
        assert!(matches!(
            decode_line(r#"data: {"time":"t1"}"#).unwrap().unwrap(),
            DecodedLine::Malformed(_)
        ));
    }

    #[test]
    fn line_buffer_rejects_runaway_lines() {
        let mut buffer = LineBuffer::new();
        let chunk = vec![b'x'; MAX_LINE_BYTES / 2];
        assert!(buffer.push(&chunk).unwrap().is_empty());
        assert!(buffer.push(&chunk).unwrap().is_empty());
        assert!(matches!(
            buffer.push(b"y"),
            Err(ReadinessError::ProtocolViolation(_))
        ));

        let mut buffer = LineBuffer::new();
        let mut long_but_terminated = vec![b'x'; MAX_LINE_BYTES * 2];
        long_but_terminated.push(b'\n');
        assert_eq!(buffer.push(&long_but_terminated).unwrap().len(), 1);
    }

    #[test]
    fn classifies_status_bodies() {
        assert_eq!(classify_status_body("Ready"), InitialStatus::Ready);
        assert_eq!(classify_status_body("Loading"), InitialStatus::Pending);
        assert_eq!(classify_status_body("\"Starting\"\n"), InitialStatus::Pending);
        assert_eq!(
            classify_status_body("Crashed\n"),
            InitialStatus::Terminal("Crashed".into())
        );
    }
}
