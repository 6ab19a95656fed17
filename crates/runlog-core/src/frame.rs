use crate::{Message, NewMessage};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;
use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 256 * 1024;
pub const CURRENT_PROTOCOL_VERSION: u16 = 1;

fn current_protocol_version() -> u16 {
    CURRENT_PROTOCOL_VERSION
}

/// Lines exchanged with an external executor process over stdin/stdout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ExecutorFrame {
    Dispatch(DispatchPayload),
    Interrupt,
    Message(NewMessage),
    Done,
    Interrupted,
    Error(ExecutorErrorPayload),
}

impl ExecutorFrame {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutorFrame::Done | ExecutorFrame::Interrupted | ExecutorFrame::Error(_)
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DispatchPayload {
    /// Executors written against an older protocol may omit it.
    #[serde(default = "current_protocol_version")]
    pub version: u16,
    pub thread_id: String,
    pub messages: Vec<Message>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutorErrorPayload {
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("buffer exceeds max size without delimiter: {size} > {max}")]
    OversizedBuffer { size: usize, max: usize },
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
}

#[derive(Debug, Clone)]
pub struct DecodeReport<T> {
    pub frames: Vec<T>,
    pub errors: Vec<FrameError>,
}

impl<T> Default for DecodeReport<T> {
    fn default() -> Self {
        Self {
            frames: Vec::new(),
            errors: Vec::new(),
        }
    }
}

pub fn encode_frame<T: Serialize>(
    value: &T,
    max_frame_bytes: usize,
) -> Result<Vec<u8>, FrameError> {
    let mut encoded =
        serde_json::to_vec(value).map_err(|err| FrameError::Encode(err.to_string()))?;
    if encoded.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: encoded.len(),
            max: max_frame_bytes,
        });
    }
    encoded.push(b'\n');
    Ok(encoded)
}

pub fn decode_frame<T: DeserializeOwned>(
    bytes: &[u8],
    max_frame_bytes: usize,
) -> Result<T, FrameError> {
    let raw = trim_line_ending(bytes);
    if raw.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: raw.len(),
            max: max_frame_bytes,
        });
    }
    serde_json::from_slice(raw).map_err(|err| FrameError::Decode(err.to_string()))
}

fn trim_line_ending(bytes: &[u8]) -> &[u8] {
    let raw = bytes.strip_suffix(b"\n").unwrap_or(bytes);
    raw.strip_suffix(b"\r").unwrap_or(raw)
}

/// Splits a byte stream into newline-delimited JSON frames.
/// Malformed lines are reported and skipped; decoding resumes on the next line.
pub struct NdjsonFrameDecoder<T> {
    max_frame_bytes: usize,
    pending: Vec<u8>,
    marker: PhantomData<T>,
}

impl<T> NdjsonFrameDecoder<T> {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            max_frame_bytes,
            pending: Vec::new(),
            marker: PhantomData,
        }
    }
}

impl<T> Default for NdjsonFrameDecoder<T> {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl<T: DeserializeOwned> NdjsonFrameDecoder<T> {
    pub fn push_chunk(&mut self, chunk: &[u8]) -> DecodeReport<T> {
        let mut report = DecodeReport::default();
        self.pending.extend_from_slice(chunk);

        while let Some(newline_idx) = self.pending.iter().position(|byte| *byte == b'\n') {
            let line = self.pending.drain(..=newline_idx).collect::<Vec<u8>>();
            let frame = trim_line_ending(&line);
            if frame.is_empty() {
                continue;
            }
            self.decode_into(frame, &mut report);
        }

        if self.pending.len() > self.max_frame_bytes {
            report.errors.push(FrameError::OversizedBuffer {
                size: self.pending.len(),
                max: self.max_frame_bytes,
            });
            self.pending.clear();
        }

        report
    }

    pub fn finish(&mut self) -> DecodeReport<T> {
        let mut report = DecodeReport::default();
        let rest = std::mem::take(&mut self.pending);
        let frame = trim_line_ending(&rest);
        if !frame.is_empty() {
            self.decode_into(frame, &mut report);
        }
        report
    }

    fn decode_into(&self, frame: &[u8], report: &mut DecodeReport<T>) {
        match decode_frame(frame, self.max_frame_bytes) {
            Ok(parsed) => report.frames.push(parsed),
            Err(err) => report.errors.push(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Originator;

    fn worker_frame(text: &str) -> ExecutorFrame {
        ExecutorFrame::Message(NewMessage::new(
            Originator::Worker("writer".to_string()),
            text,
        ))
    }

    #[test]
    fn unit_frames_serialize_without_payload() {
        let done = encode_frame(&ExecutorFrame::Done, DEFAULT_MAX_FRAME_BYTES).expect("encode");
        assert_eq!(done, b"{\"type\":\"done\"}\n".to_vec());
        let parsed: ExecutorFrame =
            decode_frame(b"{\"type\":\"interrupted\"}\r\n", DEFAULT_MAX_FRAME_BYTES)
                .expect("decode");
        assert_eq!(parsed, ExecutorFrame::Interrupted);
        assert!(parsed.is_terminal());
    }

    #[test]
    fn decoder_handles_split_chunks_and_trailing_frame() {
        let mut bytes = encode_frame(&worker_frame("draft"), DEFAULT_MAX_FRAME_BYTES)
            .expect("encode message");
        bytes.extend_from_slice(b"{\"type\":\"done\"}");

        let mut decoder = NdjsonFrameDecoder::<ExecutorFrame>::default();
        let (head, tail) = bytes.split_at(7);
        assert!(decoder.push_chunk(head).frames.is_empty());
        let report = decoder.push_chunk(tail);
        assert_eq!(report.frames, vec![worker_frame("draft")]);
        assert!(report.errors.is_empty());

        let rest = decoder.finish();
        assert_eq!(rest.frames, vec![ExecutorFrame::Done]);
    }

    #[test]
    fn decoder_recovers_after_malformed_json_line() {
        let mut chunk = encode_frame(&worker_frame("a"), DEFAULT_MAX_FRAME_BYTES).expect("a");
        chunk.extend_from_slice(b"{\"type\":\n");
        chunk.extend_from_slice(
            &encode_frame(&worker_frame("b"), DEFAULT_MAX_FRAME_BYTES).expect("b"),
        );

        let mut decoder = NdjsonFrameDecoder::<ExecutorFrame>::default();
        let report = decoder.push_chunk(&chunk);
        assert_eq!(report.frames.len(), 2);
        assert_eq!(report.errors.len(), 1);
        assert!(matches!(report.errors[0], FrameError::Decode(_)));
    }

    #[test]
    fn oversized_frames_are_rejected_both_ways() {
        let big = worker_frame(&"x".repeat(256));
        assert!(matches!(
            encode_frame(&big, 64),
            Err(FrameError::OversizedFrame { .. })
        ));

        let mut chunk = format!("{{\"blob\":\"{}\"}}\n", "x".repeat(2_000)).into_bytes();
        chunk.extend_from_slice(b"{\"type\":\"done\"}\n");
        let mut decoder = NdjsonFrameDecoder::<ExecutorFrame>::new(1_024);
        let report = decoder.push_chunk(&chunk);
        assert_eq!(report.frames, vec![ExecutorFrame::Done]);
        assert!(matches!(
            report.errors[0],
            FrameError::OversizedFrame { .. }
        ));
    }

    #[test]
    fn dispatch_frame_carries_protocol_version() {
        let dispatch = ExecutorFrame::Dispatch(DispatchPayload {
            version: CURRENT_PROTOCOL_VERSION,
            thread_id: "t".to_string(),
            messages: Vec::new(),
        });
        let encoded = encode_frame(&dispatch, DEFAULT_MAX_FRAME_BYTES).expect("encode");
        let value: serde_json::Value =
            serde_json::from_slice(&encoded).expect("dispatch is json");
        assert_eq!(value["payload"]["version"], serde_json::json!(1));

        let unversioned: ExecutorFrame = decode_frame(
            br#"{"type":"dispatch","payload":{"thread_id":"t","messages":[]}}"#,
            DEFAULT_MAX_FRAME_BYTES,
        )
        .expect("decode");
        assert_eq!(unversioned, dispatch);
        assert!(decode_frame::<ExecutorFrame>(
            br#"{"type":"dispatch","payload":{"version":"v1","thread_id":"t","messages":[]}}"#,
            DEFAULT_MAX_FRAME_BYTES,
        )
        .is_err());
    }
}
