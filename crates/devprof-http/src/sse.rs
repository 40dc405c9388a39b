//! Incremental Server-Sent Events decoder
//!
//! Bytes are fed in whatever chunking the transport produced; complete
//! events come out. A line is only decoded once its terminating `\n` has
//! arrived, so multi-byte UTF-8 sequences split across chunks survive.
//! Lines may end in `\n` or `\r\n`.

use devprof_core::{ProfileError, ProfileResult};
use serde_json::Value;

/// Payload field that identifies what kind of event a structured payload is
pub const DISCRIMINATOR: &str = "action";

/// One dispatched SSE event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// `event:` field; `None` means the default `message` type
    pub event: Option<String>,
    /// `data:` lines joined with `\n`
    pub data: String,
    /// Last event id seen on the stream at dispatch time
    pub id: Option<String>,
}

impl SseEvent {
    pub fn message(data: impl Into<String>) -> Self {
        Self {
            event: None,
            data: data.into(),
            id: None,
        }
    }

    /// Whether an `EventSource` would deliver this to `onmessage`.
    pub fn is_message(&self) -> bool {
        matches!(self.event.as_deref(), None | Some("message"))
    }

    /// Parse the payload if it claims to be structured.
    ///
    /// Payloads not starting with `{` are opaque and yield `Ok(None)`.
    /// A payload starting with `{` that is not valid JSON is an upstream
    /// contract violation.
    pub fn structured_payload(&self) -> ProfileResult<Option<Value>> {
        if !self.data.starts_with('{') {
            return Ok(None);
        }
        serde_json::from_str(&self.data)
            .map(Some)
            .map_err(|e| ProfileError::malformed_payload(&self.data, e.to_string()))
    }
}

/// Discriminator value of a structured payload, if it has a string one.
pub fn discriminator(payload: &Value) -> Option<&str> {
    payload.get(DISCRIMINATOR)?.as_str()
}

#[derive(Debug, Default)]
pub struct SseDecoder {
    pending: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
    last_event_id: Option<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and collect every event it completes.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.pending.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(newline) = self.pending.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.pending.drain(..=newline).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line);
            if let Some(event) = self.process_line(&line) {
                events.push(event);
            }
        }
        events
    }

    fn process_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            "id" if !value.contains('\0') => self.last_event_id = Some(value.to_string()),
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseEvent {
            event: event.filter(|e| !e.is_empty()),
            data,
            id: self.last_event_id.clone(),
        })
    }
}
