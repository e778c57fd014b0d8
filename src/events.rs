//! Structured output of the assistant CLI.
//!
//! The CLI prints one JSON object per line (`--output-format stream-json`). Each line is
//! classified into an [`AssistantEvent`]; [`TurnRenderer`] turns the events of one turn
//! into the text chunks the caller receives.

use serde::Deserialize;
use serde_json::{json, Value};

pub const TOOL_CALL_START: &str = "__TOOL_CALL_START__";
pub const TOOL_CALL_END: &str = "__TOOL_CALL_END__";
pub const NO_RESPONSE: &str =
    "No response from Claude. Please check authentication and try again.";

const MAX_UNSTRUCTURED_LEN: usize = 1000;

/// Splits a byte stream into lines, holding back partial data until its terminator arrives.
#[derive(Debug, Default)]
pub struct LineAccumulator {
    pending: Vec<u8>,
}

impl LineAccumulator {
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            lines.push(String::from_utf8_lossy(&line[..line.len() - 1]).into_owned());
        }
        lines
    }

    /// Whatever is left after the stream ended without a final newline.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        Some(String::from_utf8_lossy(&rest).into_owned())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ToolCall {
    pub name: String,
    pub id: Option<String>,
    pub arguments: Value,
}

impl ToolCall {
    /// Marker-wrapped JSON the web client renders as a tool card.
    pub fn to_chunk(&self) -> String {
        let payload = json!({
            "type": "tool_call",
            "name": self.name,
            "id": self.id,
            "arguments": self.arguments,
        });
        format!("\n{TOOL_CALL_START}{payload}{TOOL_CALL_END}\n")
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum MessagePart {
    Text(String),
    ToolCall(ToolCall),
}

#[derive(Clone, Debug, PartialEq)]
pub enum AssistantEvent {
    /// Content of an assistant message, up to and including its first text item.
    Message(Vec<MessagePart>),
    ToolCall(ToolCall),
    Result(String),
    Delta(String),
    Stop,
    Error(String),
    /// Valid JSON the turn has no use for (system/init, user echoes, empty results).
    Ignored,
    /// A line that is not JSON at all.
    Unstructured(String),
}

#[derive(Clone, Debug, PartialEq)]
pub struct ParsedLine {
    pub event: AssistantEvent,
    pub session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireEvent {
    Assistant {
        message: Option<WireMessage>,
    },
    ToolUse {
        name: Option<String>,
        id: Option<String>,
        input: Option<Value>,
    },
    Result {
        result: Option<String>,
    },
    ContentBlockDelta {
        delta: Option<WireDelta>,
    },
    MessageStop,
    Error {
        error: Option<WireErrorDetail>,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    #[serde(default)]
    content: Vec<WireContent>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireContent {
    Text {
        text: Option<String>,
    },
    ToolUse {
        name: Option<String>,
        id: Option<String>,
        input: Option<Value>,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct WireDelta {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireErrorDetail {
    message: Option<String>,
}

fn tool_call(name: Option<String>, id: Option<String>, input: Option<Value>) -> ToolCall {
    ToolCall {
        name: name.unwrap_or_default(),
        id,
        arguments: input.unwrap_or_else(|| json!({})),
    }
}

/// Classifies one complete line of CLI output.
pub fn parse_line(line: &str) -> ParsedLine {
    let trimmed = line.trim();
    let Ok(value) = serde_json::from_str::<Value>(trimmed) else {
        return ParsedLine {
            event: AssistantEvent::Unstructured(trimmed.to_string()),
            session_id: None,
        };
    };

    let session_id = value
        .get("session_id")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .map(str::to_string);

    let event = match serde_json::from_value::<WireEvent>(value) {
        Ok(WireEvent::Assistant { message }) => {
            let mut parts = Vec::new();
            for item in message.map(|m| m.content).unwrap_or_default() {
                match item {
                    WireContent::Text { text: Some(text) } if !text.is_empty() => {
                        // Later text items repeat the same content in other encodings.
                        parts.push(MessagePart::Text(text));
                        break;
                    }
                    WireContent::ToolUse { name, id, input } => {
                        parts.push(MessagePart::ToolCall(tool_call(name, id, input)));
                    }
                    _ => {}
                }
            }
            if parts.is_empty() {
                AssistantEvent::Ignored
            } else {
                AssistantEvent::Message(parts)
            }
        }
        Ok(WireEvent::ToolUse {
            name: Some(name),
            id,
            input,
        }) if !name.is_empty() => AssistantEvent::ToolCall(tool_call(Some(name), id, input)),
        Ok(WireEvent::Result {
            result: Some(result),
        }) if !result.is_empty() => AssistantEvent::Result(result),
        Ok(WireEvent::ContentBlockDelta {
            delta: Some(WireDelta { text: Some(text) }),
        }) if !text.is_empty() => AssistantEvent::Delta(text),
        Ok(WireEvent::MessageStop) => AssistantEvent::Stop,
        Ok(WireEvent::Error { error }) => AssistantEvent::Error(
            error
                .and_then(|e| e.message)
                .unwrap_or_else(|| "Unknown error".to_string()),
        ),
        // Objects without a usable shape, and JSON scalars or arrays.
        Ok(_) | Err(_) => AssistantEvent::Ignored,
    };

    ParsedLine { event, session_id }
}

/// Whether a non-JSON line is worth showing to the user.
pub fn is_displayable(line: &str) -> bool {
    !line.is_empty()
        && line.len() < MAX_UNSTRUCTURED_LEN
        && !line.starts_with('{')
        && !line.contains("INFO")
        && !line.contains("DEBUG")
        && !line.contains("session_id")
}

/// What one line contributed to the turn.
#[derive(Debug, Default, PartialEq)]
pub struct Step {
    pub chunks: Vec<String>,
    pub done: bool,
}

/// Per-turn state: whether anything was forwarded yet and the continuation token.
#[derive(Debug, Default)]
pub struct TurnRenderer {
    started: bool,
    session_id: Option<String>,
}

impl TurnRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn started(&self) -> bool {
        self.started
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn feed_line(&mut self, line: &str) -> Step {
        if line.trim().is_empty() {
            return Step::default();
        }
        let parsed = parse_line(line);
        if self.session_id.is_none() {
            self.session_id = parsed.session_id;
        }
        self.apply(parsed.event)
    }

    pub fn apply(&mut self, event: AssistantEvent) -> Step {
        let mut step = Step::default();
        match event {
            AssistantEvent::Message(parts) => {
                for part in parts {
                    step.chunks.push(match part {
                        MessagePart::Text(text) => format!("{text}\n\n"),
                        MessagePart::ToolCall(call) => call.to_chunk(),
                    });
                }
            }
            AssistantEvent::ToolCall(call) => step.chunks.push(call.to_chunk()),
            AssistantEvent::Result(result) => {
                // Only a summary of what already streamed, unless nothing did.
                if !self.started {
                    step.chunks.push(format!("{result}\n\n"));
                }
            }
            AssistantEvent::Delta(text) => step.chunks.push(text),
            AssistantEvent::Stop => step.done = true,
            AssistantEvent::Error(message) => {
                if !self.started {
                    step.chunks.push(format!("Error: {message}"));
                }
                step.done = true;
            }
            AssistantEvent::Ignored => {}
            AssistantEvent::Unstructured(line) => {
                if is_displayable(&line) {
                    step.chunks.push(format!("{line}\n"));
                }
            }
        }
        if !step.chunks.is_empty() {
            self.started = true;
        }
        step
    }

    /// Chunks to emit once the stream has ended on its own.
    pub fn finish(&mut self, trailing: Option<&str>) -> Vec<String> {
        let mut chunks = trailing
            .map(|line| self.feed_line(line).chunks)
            .unwrap_or_default();
        if !self.started {
            chunks.push(NO_RESPONSE.to_string());
            self.started = true;
        }
        chunks
    }
}
