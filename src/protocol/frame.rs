use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

/// Error payload carried by a terminal `error` event.
///
/// Mirrors the shape the child host reports: the original error name,
/// message, and (if available) stack trace, so the client can reconstruct
/// a faithful error value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultPayload {
    pub name: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl FaultPayload {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
        }
    }
}

/// An event record on the node -> client stream.
#[derive(Debug, Clone, PartialEq)]
pub enum EventFrame {
    Online(bool),
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    Message(Vec<u8>),
    Exit(i32),
    Error(FaultPayload),
}

impl EventFrame {
    /// Encode as a single `name: value\n` line.
    pub fn encode(&self) -> String {
        match self {
            EventFrame::Online(flag) => format!("online: {}\n", flag),
            EventFrame::Stdout(bytes) => format!("stdout: {}\n", BASE64.encode(bytes)),
            EventFrame::Stderr(bytes) => format!("stderr: {}\n", BASE64.encode(bytes)),
            EventFrame::Message(bytes) => format!("message: {}\n", BASE64.encode(bytes)),
            EventFrame::Exit(code) => format!("exit: {}\n", code),
            EventFrame::Error(fault) => {
                let json = serde_json::to_vec(fault).unwrap_or_default();
                format!("error: {}\n", BASE64.encode(json))
            }
        }
    }

    /// Decode a parsed `name`/`value` pair. Unknown names and malformed
    /// payloads yield `None` (forward compatibility: ignore, never fail).
    pub fn decode(name: &str, value: &str) -> Option<Self> {
        match name {
            "online" => Some(EventFrame::Online(value == "true")),
            "stdout" => BASE64.decode(value).ok().map(EventFrame::Stdout),
            "stderr" => BASE64.decode(value).ok().map(EventFrame::Stderr),
            "message" => BASE64.decode(value).ok().map(EventFrame::Message),
            "exit" => value.parse().ok().map(EventFrame::Exit),
            "error" => {
                let json = BASE64.decode(value).ok()?;
                serde_json::from_slice(&json).ok().map(EventFrame::Error)
            }
            _ => None,
        }
    }

    /// Whether this frame ends the worker's event stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, EventFrame::Exit(_) | EventFrame::Error(_))
    }
}

/// A control record on the client -> node stream.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlFrame {
    Stdin(Vec<u8>),
    WorkerMessage(Vec<u8>),
    Terminate,
}

impl ControlFrame {
    pub fn encode(&self) -> String {
        match self {
            ControlFrame::Stdin(bytes) => format!("stdin: {}\n", BASE64.encode(bytes)),
            ControlFrame::WorkerMessage(bytes) => {
                format!("worker_message: {}\n", BASE64.encode(bytes))
            }
            ControlFrame::Terminate => "terminate: true\n".to_string(),
        }
    }

    pub fn decode(name: &str, value: &str) -> Option<Self> {
        match name {
            "stdin" => BASE64.decode(value).ok().map(ControlFrame::Stdin),
            "worker_message" => BASE64.decode(value).ok().map(ControlFrame::WorkerMessage),
            "terminate" => Some(ControlFrame::Terminate),
            _ => None,
        }
    }
}

/// Incremental line parser tolerating arbitrary chunk boundaries.
///
/// Chunks are split on `\n`; the first fragment is appended to the pending
/// buffer, each completed buffer is dispatched, and the trailing fragment is
/// carried forward until the next chunk arrives.
#[derive(Debug, Default)]
pub struct LineParser {
    pending: Vec<u8>,
}

impl LineParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return the completed `(name, value)` records.
    ///
    /// Lines that do not match the `name: value` grammar are dropped.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<(String, String)> {
        let mut records = Vec::new();
        for byte in chunk {
            if *byte == b'\n' {
                if let Some(record) = Self::split_record(&self.pending) {
                    records.push(record);
                }
                self.pending.clear();
            } else {
                self.pending.push(*byte);
            }
        }
        records
    }

    fn split_record(line: &[u8]) -> Option<(String, String)> {
        let line = std::str::from_utf8(line).ok()?;
        let (name, value) = line.split_once(": ")?;
        if name.is_empty() {
            return None;
        }
        Some((name.to_string(), value.to_string()))
    }
}
