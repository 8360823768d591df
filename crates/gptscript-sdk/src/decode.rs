use gptscript_schema::Frame;
use serde_json::Value;
use thiserror::Error;

/// Sentinel record the engine sends after the last event of a run.
pub const DONE_SENTINEL: &str = "[DONE]";

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid UTF-8 in engine response: {0}")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("invalid JSON record: {0}")]
    Json(#[from] serde_json::Error),
    #[error("record is not a JSON object")]
    NotAnObject,
    #[error("record has none of the stdout, stderr, prompt, run, or call fields")]
    UnknownRecord,
    #[error("invalid {kind} frame: {source}")]
    Frame {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq)]
/// One decoded record from a run response stream.
pub enum StreamRecord {
    /// Final output as plain text.
    Stdout(String),
    /// Final output as a structured object (`content`, `state`, `done` for
    /// chat runs, arbitrary JSON for basic commands).
    StructuredStdout(Value),
    Stderr(String),
    Event(Frame),
}

#[derive(Debug, Default)]
/// Reassembles newline-delimited records from arbitrary byte chunks.
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    /// Appends `chunk` and returns every line it completed, without the
    /// trailing `\n` or `\r\n`.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<String>, DecodeError> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|byte| *byte == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = std::str::from_utf8(&line[..pos])?;
            lines.push(line.trim_end_matches('\r').to_string());
        }
        Ok(lines)
    }

    /// Returns the unterminated tail, if any.
    pub fn finish(self) -> Result<Option<String>, DecodeError> {
        if self.pending.is_empty() {
            return Ok(None);
        }
        let tail = std::str::from_utf8(&self.pending)?;
        Ok(Some(tail.trim_end_matches('\r').to_string()))
    }
}

/// Decodes one line of a run response. Blank lines and the `[DONE]`
/// sentinel yield `Ok(None)`.
pub fn decode_line(line: &str) -> Result<Option<StreamRecord>, DecodeError> {
    let line = line.trim();
    let line = line.strip_prefix("data:").map(str::trim).unwrap_or(line);
    if line.is_empty() || line == DONE_SENTINEL {
        return Ok(None);
    }
    let value: Value = serde_json::from_str(line)?;
    decode_record(value).map(Some)
}

/// Classifies a decoded record by the first recognized key, checked in
/// the order `stdout`, `stderr`, `prompt`, `run`, `call`.
pub fn decode_record(value: Value) -> Result<StreamRecord, DecodeError> {
    let Value::Object(mut record) = value else {
        return Err(DecodeError::NotAnObject);
    };

    if let Some(stdout) = record.remove("stdout") {
        return Ok(match stdout {
            Value::String(text) => StreamRecord::Stdout(text),
            other => StreamRecord::StructuredStdout(other),
        });
    }
    if let Some(stderr) = record.remove("stderr") {
        return Ok(StreamRecord::Stderr(match stderr {
            Value::String(text) => text,
            other => other.to_string(),
        }));
    }
    if let Some(prompt) = record.remove("prompt") {
        return serde_json::from_value(prompt)
            .map(|frame| StreamRecord::Event(Frame::Prompt(frame)))
            .map_err(|source| DecodeError::Frame {
                kind: "prompt",
                source,
            });
    }
    if let Some(run) = record.remove("run") {
        return serde_json::from_value(run)
            .map(|frame| StreamRecord::Event(Frame::Run(frame)))
            .map_err(|source| DecodeError::Frame { kind: "run", source });
    }
    if let Some(call) = record.remove("call") {
        return serde_json::from_value(call)
            .map(|frame| StreamRecord::Event(Frame::Call(frame)))
            .map_err(|source| DecodeError::Frame {
                kind: "call",
                source,
            });
    }
    Err(DecodeError::UnknownRecord)
}
